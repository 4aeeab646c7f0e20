use face_search::{
    config::AppConfig,
    db::{self, JobStore, PgJobStore},
    routes,
    services::{
        comparator::{
            ClassifierComparator, ComparisonStrategy, EmbeddingComparator, FaceComparator,
            FaceEmbedder, LbpEmbedder, RemoteEmbedder,
        },
        corpus::DriveCorpus,
        detector::{CroppingDetector, RemoteLocator},
        dispatcher::JobDispatcher,
        encryption::{EncryptionService, SealedBlobStore},
        lbph::LbphModel,
        matching::MatchingEngine,
        queue::JobNotifier,
        storage::R2Client,
    },
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting face search worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    for warning in config.warnings() {
        tracing::warn!("{warning}");
    }

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid METRICS_ADDR");
        routes::metrics::serve_on(addr).expect("Failed to install Prometheus exporter");
        tracing::info!(%addr, "Serving worker metrics");
    }

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool));

    // Initialize services
    tracing::info!("Initializing services");
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

    if config.drive_folder_ids.is_empty() {
        tracing::warn!("DRIVE_FOLDER_IDS is empty, every search will complete with no results");
    }
    let corpus = Arc::new(DriveCorpus::new(
        config.drive_access_token.clone(),
        config.drive_folder_ids.clone(),
    ));

    let detector = Arc::new(CroppingDetector::new(Arc::new(RemoteLocator::new(
        config.detector_url.clone(),
        config.detector_api_token.clone(),
    ))));

    let comparator = build_comparator(&config).await;

    let engine = MatchingEngine::new(
        store.clone(),
        blobs,
        corpus,
        detector,
        comparator,
        config.match_settings(),
    );

    let mut dispatcher = JobDispatcher::new(store, engine, config.dispatcher_settings());
    if let Some(url) = &config.redis_url {
        tracing::info!("Connecting to Redis wake-up queue");
        let notifier = JobNotifier::new(url).expect("Failed to initialize wake-up queue");
        dispatcher = dispatcher.with_notifier(Arc::new(notifier));
    }

    tracing::info!(
        worker_id = %dispatcher.worker_id(),
        strategy = %config.comparison_strategy,
        threshold = config.match_threshold(),
        "Worker ready, starting job processing loop"
    );

    dispatcher
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested, finishing current job");
        })
        .await;
}

async fn build_comparator(config: &AppConfig) -> Arc<dyn FaceComparator> {
    let threshold = config.match_threshold();
    match config.comparison_strategy {
        ComparisonStrategy::Classifier => {
            tracing::info!(path = %config.lbph_model_path, "Loading LBPH face model");
            let model = LbphModel::load(&config.lbph_model_path)
                .await
                .expect("Failed to load LBPH face model");
            tracing::info!(enrolled = model.len(), "LBPH face model loaded");
            let comparator = Arc::new(ClassifierComparator::new(model, threshold));
            reload_on_hangup(comparator.clone(), config.lbph_model_path.clone());
            comparator
        }
        ComparisonStrategy::Embedding => {
            let embedder: Arc<dyn FaceEmbedder> = match &config.embedder_url {
                Some(url) => Arc::new(RemoteEmbedder::new(
                    url.clone(),
                    config.embedder_api_token.clone(),
                )),
                None => {
                    tracing::info!("EMBEDDER_URL not set, using local LBP embedder");
                    Arc::new(LbpEmbedder::default())
                }
            };
            Arc::new(EmbeddingComparator::new(embedder, threshold))
        }
    }
}

/// Reload the LBPH model from `path` whenever the process receives SIGHUP,
/// e.g. after the `enroll` binary has rewritten it.
#[cfg(unix)]
fn reload_on_hangup(comparator: Arc<ClassifierComparator>, path: String) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(hangups) => hangups,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGHUP, face model will not be reloaded");
            return;
        }
    };
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            match comparator.reload_from(&path).await {
                Ok(enrolled) => tracing::info!(%path, enrolled, "LBPH face model reloaded"),
                Err(e) => {
                    tracing::error!(%path, error = %e, "Face model reload failed, keeping the current model")
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn reload_on_hangup(_comparator: Arc<ClassifierComparator>, _path: String) {
    tracing::info!("Face model reload on SIGHUP is only available on Unix");
}
