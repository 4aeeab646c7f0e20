use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use face_search::{
    app_state::AppState,
    config::AppConfig,
    db::{self, JobStore, PgJobStore},
    routes,
    services::{
        detector::{CroppingDetector, RemoteLocator},
        encryption::{EncryptionService, SealedBlobStore},
        queue::JobNotifier,
        storage::R2Client,
        submission::JobSubmissionService,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024; // 10 MB

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing face-search server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe();

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool.clone()));

    // Query uploads are staged encrypted in R2
    tracing::info!("Initializing R2 storage client");
    let r2_client = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");
    let encryption =
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption");
    let blobs = Arc::new(SealedBlobStore::new(Arc::new(r2_client), encryption));

    let notifier = config.redis_url.as_deref().map(|url| {
        tracing::info!("Connecting to Redis wake-up queue");
        Arc::new(JobNotifier::new(url).expect("Failed to initialize wake-up queue"))
    });

    let detector = Arc::new(CroppingDetector::new(Arc::new(RemoteLocator::new(
        config.detector_url.clone(),
        config.detector_api_token.clone(),
    ))));

    let submissions =
        JobSubmissionService::new(store.clone(), blobs, detector, notifier.clone());
    let state = AppState::new(db_pool, store, submissions, notifier);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/searches",
            post(routes::search::submit_search).get(routes::search::list_searches),
        )
        .route("/api/v1/searches/{job_id}", get(routes::search::get_search))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES));

    tracing::info!("Starting face-search on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
