use face_search::{
    config::AppConfig,
    db::{self, JobStore, PgJobStore, StoreError},
    models::{
        job::{JobOutcome, JobStatus, MatchResult, NewJob},
        photo::PhotoHandle,
    },
    services::{
        encryption::{EncryptionService, SealedBlobStore},
        storage::{BlobStore, R2Client},
    },
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn pg_store() -> PgJobStore {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let db_pool = db::init_pool(&database_url)
        .await
        .expect("Failed to connect to database");

    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    PgJobStore::new(db_pool)
}

async fn create_job(store: &PgJobStore) -> Uuid {
    let id = Uuid::new_v4();
    store
        .create(NewJob {
            id,
            query_face_key: format!("search-queries/{id}"),
            identity_hint: None,
        })
        .await
        .expect("Failed to create job");
    id
}

fn hit(id: &str) -> MatchResult {
    MatchResult {
        session_id: "session-a".to_string(),
        photo: PhotoHandle {
            external_id: id.to_string(),
            display_name: format!("{id}.jpg"),
            retrieval_ref: format!("https://example.com/{id}"),
            view_url: None,
        },
        score: 0.12,
        matched: true,
    }
}

/// Integration test: job lifecycle through PostgreSQL
///
/// Verifies create/claim/set_total/advance/finish and the ownership guard.
///
/// Note: This requires a running PostgreSQL instance configured via
/// DATABASE_URL.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_job_lifecycle() {
    let store = pg_store().await;
    let id = create_job(&store).await;
    let worker = Uuid::new_v4();

    let job = store.get(id).await.unwrap().expect("Job not found");
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.total.is_none());
    assert!(job.results.is_empty());

    // Drain until our job is claimed; older pending rows may exist.
    let mut claimed = None;
    while let Some(job) = store
        .claim(worker, Duration::from_secs(600))
        .await
        .expect("Claim failed")
    {
        if job.id == id {
            claimed = Some(job);
            break;
        }
        store
            .finish(job.id, worker, &JobOutcome::Failed("integration test drain".into()))
            .await
            .unwrap();
    }
    let claimed = claimed.expect("Job was never claimed");
    assert_eq!(claimed.status, JobStatus::Processing);
    assert_eq!(claimed.claimed_by, Some(worker));
    assert!(store.count_by_status(JobStatus::Processing).await.unwrap() >= 1);

    store.set_total(id, worker, 2).await.unwrap();
    assert!(store.set_total(id, worker, 3).await.is_err());

    store.advance(id, worker, 1, Some(&hit("p1"))).await.unwrap();
    // Skipping a position is rejected.
    assert!(store.advance(id, worker, 3, None).await.is_err());

    let intruder = Uuid::new_v4();
    assert!(matches!(
        store.advance(id, intruder, 2, None).await,
        Err(StoreError::LostClaim(_))
    ));

    store.advance(id, worker, 2, None).await.unwrap();
    store.finish(id, worker, &JobOutcome::Completed).await.unwrap();

    let done = store.get(id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 2);
    assert_eq!(done.total, Some(2));
    assert_eq!(done.results, vec![hit("p1")]);
    assert!(done.completed_at.is_some());

    // Terminal rows are immutable.
    assert!(store.finish(id, worker, &JobOutcome::Failed("late".into())).await.is_err());
    assert_eq!(store.get(id).await.unwrap().unwrap(), done);

    println!("✅ Job lifecycle test passed!");
}

/// Concurrent claimers never receive the same job.
#[tokio::test]
#[ignore]
async fn test_concurrent_claims_are_exclusive() {
    let store = Arc::new(pg_store().await);
    for _ in 0..3 {
        create_job(&store).await;
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let worker = Uuid::new_v4();
            let job = store.claim(worker, Duration::from_secs(600)).await.unwrap();
            job.map(|job| (job.id, worker))
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(claim) = handle.await.unwrap() {
            claimed.push(claim);
        }
    }

    let unique: HashSet<Uuid> = claimed.iter().map(|(id, _)| *id).collect();
    assert_eq!(unique.len(), claimed.len(), "a job was claimed twice");
    assert!(claimed.len() >= 3);

    for (id, worker) in claimed {
        store
            .finish(id, worker, &JobOutcome::Failed("integration test cleanup".into()))
            .await
            .unwrap();
    }
}

/// A processing job whose heartbeat is older than the lease is reclaimed, and
/// the previous owner loses write access.
#[tokio::test]
#[ignore]
async fn test_stale_claim_is_reclaimed() {
    let store = pg_store().await;
    let id = create_job(&store).await;
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    // Claim with a generous lease until our job comes up.
    loop {
        let job = store
            .claim(first, Duration::from_secs(600))
            .await
            .unwrap()
            .expect("Job was never claimed");
        if job.id == id {
            break;
        }
        store
            .finish(job.id, first, &JobOutcome::Failed("integration test drain".into()))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let mut reclaimed = None;
    while let Some(job) = store.claim(second, Duration::from_secs(1)).await.unwrap() {
        if job.id == id {
            reclaimed = Some(job);
            break;
        }
        store
            .finish(job.id, second, &JobOutcome::Failed("integration test drain".into()))
            .await
            .unwrap();
    }
    assert_eq!(reclaimed.expect("Stale job not reclaimed").claimed_by, Some(second));

    assert!(matches!(
        store.set_total(id, first, 1).await,
        Err(StoreError::LostClaim(_))
    ));
    store.finish(id, second, &JobOutcome::Completed).await.unwrap();
}

/// Sealed blob round-trip through R2.
///
/// Note: This requires R2 credentials and the full service configuration in
/// the environment.
#[tokio::test]
#[ignore]
async fn test_sealed_r2_round_trip() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let r2_client = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2");
    let r2: Arc<dyn BlobStore> = Arc::new(r2_client);
    let encryption =
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption");
    let sealed = SealedBlobStore::new(r2.clone(), encryption);

    let key = format!("test/{}", Uuid::new_v4());
    let plaintext = b"query face bytes";
    sealed
        .put(&key, plaintext, "image/png")
        .await
        .expect("R2 upload failed");

    let raw = r2.get(&key).await.expect("R2 download failed");
    assert_ne!(raw, plaintext.to_vec());
    assert_eq!(sealed.get(&key).await.unwrap(), plaintext.to_vec());
}

/// Test encryption round-trip
#[test]
fn test_encryption_roundtrip() {
    let key = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [0u8; 32]);
    let encryption = EncryptionService::new(&key).expect("Failed to create encryption service");

    let plaintext = b"sensitive query face";
    let sealed = encryption
        .seal("search-queries/a", plaintext)
        .expect("Encryption failed");
    let opened = encryption
        .open("search-queries/a", &sealed)
        .expect("Decryption failed");

    assert_eq!(plaintext.as_slice(), opened.as_slice());
    assert_ne!(sealed, plaintext.to_vec());
    // Ciphertext is bound to its storage key.
    assert!(encryption.open("search-queries/b", &sealed).is_err());
}
