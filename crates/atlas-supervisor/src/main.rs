use std::sync::Arc;

use anyhow::Context;
use atlas_db::Registry;
use atlas_migration::{Migrator, MigratorTrait};
use atlas_supervisor::{Supervisor, SupervisorConfig, reconcile::StatusPoller};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Console output always; a daily-rolling file as well when `log_dir` is set.
/// The returned guard must live until shutdown so buffered lines are flushed.
fn init_tracing(cfg: &SupervisorConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "atlas-supervisor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(EnvFilter::from_default_env())
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SupervisorConfig::load().context("load configuration")?;
    let _log_guard = init_tracing(&config);

    let db = atlas_db::connect(&config.database_url)
        .await
        .with_context(|| format!("connect {}", config.database_url))?;
    Migrator::up(&db, None).await.context("run migrations")?;

    let config = Arc::new(config);
    let supervisor = Supervisor::new(Registry::new(Arc::new(db)), config.clone());
    tracing::info!(
        ports = ?config.port_range(),
        stop_timeout_secs = config.stop_timeout_secs,
        "atlas-supervisor ready"
    );

    let shutdown = CancellationToken::new();
    let poller = config
        .reconcile_interval()
        .map(|every| StatusPoller::new(supervisor.clone(), every).spawn(shutdown.clone()));

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down; managed applications keep running");
    shutdown.cancel();
    if let Some(poller) = poller {
        let _ = poller.await;
    }
    Ok(())
}
