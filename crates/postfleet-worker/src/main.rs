mod handler;

use anyhow::{Context, Result};
use postfleet_browser::{BrowserEngine, PlaywrightEngine};
use postfleet_core::config::WorkerConfig;
use postfleet_core::dispatcher::Dispatcher;
use postfleet_core::pool::InstancePool;
use postfleet_core::queue::PriorityQueue;
use postfleet_core::security::SignedTaskCodec;
use postfleet_storage::Storage;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,postfleet_worker=debug".into()),
        )
        .with_target(false)
        .init();

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;
    info!(worker_id = %config.worker_id, db_path = %config.db_path, "Starting postfleet worker");

    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory for {}", config.db_path))?;
    }
    let storage = Arc::new(
        Storage::open(&config.db_path, &config.worker_secret)
            .context("Failed to open worker database")?,
    );

    let engine = Arc::new(PlaywrightEngine::with_default_root()?);
    match engine.probe().await {
        Ok(probe) if probe.ready => {
            info!(node = probe.node_version.as_deref().unwrap_or("unknown"), "Browser runtime ready");
        }
        Ok(probe) => {
            for note in &probe.notes {
                warn!(%note, "Browser runtime not ready");
            }
        }
        Err(e) => warn!(error = %e, "Browser runtime probe failed"),
    }

    let sessions = Arc::new(storage.sessions.clone());
    let pool = Arc::new(InstancePool::new(
        engine.clone(),
        sessions.clone(),
        config.pool_config(),
    ));
    let codec = Arc::new(SignedTaskCodec::new(
        &config.worker_secret,
        config.signature_max_age_ms(),
    )?);
    let queue = Arc::new(PriorityQueue::new(
        storage.queue.clone(),
        config.queue_config(),
    ));
    let handler = Arc::new(handler::MaintenanceHandler::new(
        engine.clone(),
        sessions.clone(),
        config.portal_url.clone(),
    ));

    let dispatcher = Dispatcher::new(
        queue.clone(),
        pool.clone(),
        codec,
        handler,
        config.dispatcher_config(),
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let dispatcher_rx = shutdown_tx.subscribe();
    let reaper_rx = shutdown_tx.subscribe();

    let reaper = tokio::spawn(pool.clone().run_reaper(reaper_rx));

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(error = %e, "Signal handler failed, shutting down"),
            }
            let _ = shutdown_tx.send(());
        });
    }

    // Runs until shutdown: drains in-flight work, persists sessions
    dispatcher.run(dispatcher_rx).await;
    let _ = reaper.await;

    info!("Worker stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
