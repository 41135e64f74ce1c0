use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use clinicsched::config::Config;
use clinicsched::engine::{now_ms, Engine};
use clinicsched::notify::NotifyHub;
use clinicsched::{observability, reconciler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("clinicsched=info".parse()?))
        .init();

    let config = Config::from_env();
    observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(Engine::new(config.wal_path(), Arc::new(NotifyHub::new()))?);
    info!("clinicsched started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  reconcile_interval: {:?}", config.reconcile_interval);
    info!("  compact_threshold: {}", config.compact_threshold);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let reconcile_task = tokio::spawn(reconciler::run_reconciler(engine.clone(), config.reconcile_interval));
    let compact_task = tokio::spawn(reconciler::run_compactor(engine.clone(), config.compact_threshold));

    // Graceful shutdown on SIGTERM/ctrl-c
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutdown signal received, stopping background tasks");
    reconcile_task.abort();
    compact_task.abort();
    let _ = reconcile_task.await;
    let _ = compact_task.await;

    // A last pass so nothing past due is left open across the restart.
    let report = reconciler::reconcile_once(&engine, now_ms()).await;
    info!(
        updated = report.updated.len(),
        failed = report.failed.len(),
        "final reconciliation"
    );

    info!("clinicsched stopped");
    Ok(())
}
