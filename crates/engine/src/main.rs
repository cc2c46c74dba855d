use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use persistence::repositories::{PgExportJobStore, PgToolRegistry};
use tool_export_engine::config::Config;
use tool_export_engine::jobs::{ExportWorkerJob, JobScheduler, RetentionCleanupJob};
use tool_export_engine::logging::init_logging;
use tool_export_engine::services::{ExportService, ExportSettings};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().context("Failed to load configuration")?;

    init_logging(&config.logging).context("Failed to initialize logging")?;
    info!("Starting tool export engine v{}", env!("CARGO_PKG_VERSION"));

    if config.metrics.enabled {
        let addr = config.metrics_addr()?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(addr = %addr, "Metrics exporter listening");
    }

    let pool = persistence::db::create_pool(&config.database).await?;

    info!("Running database migrations...");
    persistence::db::run_migrations(&pool).await?;
    info!("Migrations completed");

    tokio::fs::create_dir_all(&config.storage.root)
        .await
        .with_context(|| format!("Failed to create {}", config.storage.root.display()))?;

    let service = ExportService::new(
        Arc::new(PgExportJobStore::new(pool.clone())),
        Arc::new(PgToolRegistry::new(pool.clone())),
        ExportSettings::from_config(&config),
    );

    let shutdown_timeout = Duration::from_secs(config.worker.shutdown_timeout_secs);

    let mut scheduler = JobScheduler::new();
    scheduler.register(ExportWorkerJob::new(
        service.clone(),
        config.worker.poll_interval_secs,
        config.worker.batch_size,
        shutdown_timeout,
    ));
    scheduler.register(RetentionCleanupJob::new(
        service,
        config.retention.sweep_interval_minutes,
    ));
    scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    scheduler.shutdown();
    // Leave the worker its own drain window plus a margin for the sweep.
    scheduler
        .wait_for_shutdown(shutdown_timeout + Duration::from_secs(5))
        .await;

    pool.close().await;
    info!("Tool export engine stopped");
    Ok(())
}
