use std::sync::Arc;
use std::time::Duration;

use logos_worker::{Mode, Runtime, WorkerConfig};
use logos_rs::memory::spawn_decay_sweeper;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("logos_worker=info".parse()?)
                .add_directive("logos_rs=info".parse()?),
        )
        .json()
        .init();

    info!("logos-worker starting");

    // ── Config ────────────────────────────────────────────────────────────────
    let config = WorkerConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        kb = %config.logos.kb_path().display(),
        workflow = %config.workflow,
        mode = ?config.mode,
        "configuration loaded"
    );

    // ── Runtime ───────────────────────────────────────────────────────────────
    let runtime = Arc::new(Runtime::bootstrap(config).map_err(|e| {
        error!("Bootstrap failed: {:#}", e);
        e
    })?);

    match runtime.config().mode {
        Mode::Once => {
            let run = runtime.run_once().await.map_err(|e| {
                error!("Run failed: {:#}", e);
                e
            })?;
            info!(run_id = %run.log.run_id, stages = run.log.stages.len(), "run finished");
        }
        Mode::Daemon => daemon(runtime).await?,
    }

    info!("logos-worker stopped");
    Ok(())
}

/// Sweep memory and watch the knowledgebase until a shutdown signal arrives.
async fn daemon(runtime: Arc<Runtime>) -> anyhow::Result<()> {
    runtime.check_store().await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = spawn_decay_sweeper(
        runtime.services().memory.clone(),
        runtime.config().logos.sweep_interval(),
        shutdown_rx.clone(),
    );

    let reloader = {
        let runtime = runtime.clone();
        let mut shutdown = shutdown_rx;
        let period = Duration::from_secs(runtime.config().reload_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = runtime.reload() {
                            warn!(error = %e, "knowledgebase reload failed; keeping previous state");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    info!("daemon running");
    shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(sweeper, reloader);
    runtime.save_snapshot()?;
    Ok(())
}

/// Graceful shutdown on SIGTERM or Ctrl-C.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl-C, shutting down"); }
        _ = terminate => { info!("received SIGTERM, shutting down"); }
    }
}
