use std::sync::Arc;

use tracing::info;

use reserva::config::Config;
use reserva::engine::{Engine, Store};
use reserva::identity::InMemoryDirectory;
use reserva::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    reserva::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(Store::open(&config.wal_path())?);
    let directory = Arc::new(InMemoryDirectory::new());
    let engine = Arc::new(Engine::new(store, directory, config.engine.clone()));

    info!("reserva started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  loan period: {} days", config.engine.loan_period_ms / 86_400_000);
    info!(
        "  sweeper: every {}s, auto-release {}",
        config.sweep_interval.as_secs(),
        if config.auto_release_overdue { "on" } else { "off" }
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let sweeper_engine = engine.clone();
    let (every, auto_release) = (config.sweep_interval, config.auto_release_overdue);
    let sweeper = tokio::spawn(async move {
        sweeper::run_sweeper(sweeper_engine, every, auto_release).await;
    });
    let compactor_engine = engine.clone();
    let threshold = config.compact_threshold;
    let compactor = tokio::spawn(async move {
        sweeper::run_compactor(compactor_engine, threshold).await;
    });

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping background tasks");
    sweeper.abort();
    compactor.abort();

    if let Err(e) = engine.compact().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("reserva stopped");
    Ok(())
}
