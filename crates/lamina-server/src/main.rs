//! Entry point: parse config, validate it (non-zero exit on failure, per
//! spec §6), wire the concrete storage/lock backends behind the facade's
//! trait objects, and serve. Shutdown is a plain `ctrl_c` wait -- simpler
//! than the teacher's `local_backend::main`, which layers a custom
//! broadcast-based preempt/drain sequence this server has no equivalent
//! need for (no in-flight background jobs to drain besides the janitor,
//! which ties its own lifetime to the same cancellation token).

use std::sync::Arc;

use clap::Parser;
use lamina_facade::ObjectStorageFacade;
use lamina_lock::{InProcessLockManager, LockManager, RedisLockConfig, RedisLockManager};
use lamina_server::config::{LockBackendKind, MetadataBackendKind, ServerConfig};
use lamina_server::{auth, janitor, router};
use lamina_storage::metadata::{DataProbe, InMemoryMetadataStorage, JsonFileMetadataStorage, ObjectMetadataStorage, SqliteMetadataStorage};
use lamina_storage::multipart::{FilesystemMultipartStorage, MultipartUploadStorage};
use lamina_storage::{BucketStorage, DataStorageProbe, FilesystemBucketStorage, FilesystemDataStorage, ObjectDataStorage};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() {
    let config = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    if let Err(err) = config.validate() {
        eprintln!("invalid configuration: {err}");
        std::process::exit(1);
    }

    if let Err(err) = run(config).await {
        eprintln!("server error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_root)?;
    info!(?config, "starting");

    let data: Arc<dyn ObjectDataStorage> = Arc::new(FilesystemDataStorage::new(config.data_root.clone()));

    let metadata: Arc<dyn ObjectMetadataStorage> = match config.metadata_backend {
        MetadataBackendKind::Memory => Arc::new(InMemoryMetadataStorage::new()),
        MetadataBackendKind::Json => Arc::new(JsonFileMetadataStorage::new(config.data_root.clone())),
        MetadataBackendKind::Sqlite => Arc::new(SqliteMetadataStorage::open(
            config.sqlite_path().to_str().ok_or_else(|| anyhow::anyhow!("sqlite path must be valid UTF-8"))?,
        )?),
    };

    let multipart: Arc<dyn MultipartUploadStorage> = Arc::new(FilesystemMultipartStorage::new(config.data_root.clone()));
    let buckets: Arc<dyn BucketStorage> = Arc::new(FilesystemBucketStorage::new(config.data_root.clone(), data.clone()));
    let probe: Arc<dyn DataProbe> = Arc::new(DataStorageProbe::new(data.clone()));

    let lock: Arc<dyn LockManager> = match config.lock_backend {
        LockBackendKind::InProcess => Arc::new(InProcessLockManager::new(config.lock_key_prefix.clone())),
        LockBackendKind::Redis => {
            let redis_url = config
                .redis_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--redis-url is required when --lock-backend=redis"))?;
            let redis_config = RedisLockConfig {
                key_prefix: config.lock_key_prefix.clone(),
                ..RedisLockConfig::default()
            };
            Arc::new(RedisLockManager::connect(&redis_url, redis_config).await?)
        },
    };

    let facade = Arc::new(ObjectStorageFacade::new(
        data,
        metadata,
        multipart,
        buckets,
        lock,
        probe,
        config.temp_file_prefix.clone(),
    ));

    let shutdown = CancellationToken::new();
    let janitor_config = janitor::JanitorConfig {
        sweep_interval: std::time::Duration::from_secs(config.janitor_interval_secs),
        multipart_expiry: chrono::Duration::seconds(config.multipart_expiry_secs as i64),
    };
    let janitor_handle = tokio::spawn(janitor::run(facade.clone(), janitor_config, shutdown.clone()));

    let state = Arc::new(router::AppState {
        facade,
        authorizer: Arc::new(auth::AllowAllAuthorizer),
        config: config.clone(),
    });
    let app = router::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!(address = %config.bind_address(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    shutdown.cancel();
    let _ = janitor_handle.await;
    Ok(())
}
