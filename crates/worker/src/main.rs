//! Worker process: runs the worker pool and the scheduler against Redis until
//! SIGINT/SIGTERM, then shuts down without losing in-flight jobs.
//!
//! Configuration comes from `DEPOT__*` environment variables (a `.env` file is
//! honored) and, when `DEPOT_CONFIG_FILE` is set, from that file first.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use depot_infra::config::DepotConfig;
use depot_infra::jobs::{register_builtin_tasks, JobRuntime, KeySpace, ResultLedger, TaskRegistry};
use depot_infra::store::{RedisStore, SharedStore};
use depot_observability::tracing::LogOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_file = std::env::var_os("DEPOT_CONFIG_FILE").map(PathBuf::from);
    let config = DepotConfig::load_from(config_file.as_deref()).context("failed to load configuration")?;

    depot_observability::init_with(LogOptions {
        default_directive: config.log.level.clone(),
        json: config.log.json,
    });

    let store = RedisStore::connect(&config.redis.url)
        .await
        .with_context(|| format!("failed to connect to Redis at {}", config.redis.url))?;

    let store: Arc<dyn SharedStore> = Arc::new(store);

    let mut registry = TaskRegistry::new();
    let ledger = ResultLedger::new(
        store.clone(),
        KeySpace::new(config.namespace.as_str()),
        config.ledger_config(),
    );
    register_builtin_tasks(&mut registry, ledger)?;
    let runtime = JobRuntime::new(store, registry, &config);

    let handle = runtime.start();
    shutdown_signal().await;
    handle.shutdown().await;

    tracing::info!("worker shutdown complete");
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
