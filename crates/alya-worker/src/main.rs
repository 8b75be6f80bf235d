//! alya-worker entry point.
//!
//! Boots a `JobManager` against the configured store/cache/object-store,
//! spawns the worker loop (which itself spawns the heartbeat refresher and
//! recovery sweeper), and runs until Ctrl-C. Domain-specific processors are
//! an external collaborator's concern (out of scope here, per §1) — this
//! binary ships with an empty registry; embedding applications link their
//! own `main` that registers processors before calling into `alya_engine`.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use alya_engine::{JobManager, Worker};
use alya_registry::Registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // dev-time .env.local bootstrap, silent if absent — production injects
    // env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = alya_config::EngineConfig::from_env().context("loading configuration")?;
    info!(bucket = %config.object_store_bucket, "configuration loaded");

    let db = alya_db::connect_from_env().await.context("connecting to Postgres")?;
    alya_db::migrate(&db).await.context("running migrations")?;

    let cache = alya_cache::connect_from_env().await.context("connecting to Redis")?;

    let object_store =
        Arc::new(alya_objectstore::ObjectStoreFacade::connect_from_env().context("initializing object store")?);

    let registry = Arc::new(Registry::new());

    let manager = Arc::new(JobManager::new(db, cache, object_store, registry));
    info!(instance_id = %manager.instance_id(), "alya-worker starting");

    let token = CancellationToken::new();
    let worker = Worker::new(manager);

    let run_token = token.clone();
    let worker_handle = tokio::spawn(async move { worker.run(run_token).await });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    token.cancel();

    worker_handle.await.context("worker task panicked")??;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
