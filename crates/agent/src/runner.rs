//! Worker wiring: build the shared state, start every long-lived task, and
//! wait for a shutdown signal (external or internal).

use std::net::SocketAddr;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::challenge::{self, ChallengeStore};
use crate::config::AppConfig;
use crate::control::{self, dispatch::DispatchContext};
use crate::{identity, server, state, telemetry, version};

/// Run the worker until SIGINT/SIGTERM or an internally requested exit
/// (e.g. after a self-update).
pub async fn run(config_path: &str) -> anyhow::Result<()> {
    let cfg = AppConfig::load(config_path)?;
    run_with_config(cfg).await
}

pub async fn run_with_config(cfg: AppConfig) -> anyhow::Result<()> {
    if anssl_updater::consume_update_marker() {
        info!("update applied");
    }

    let client_id = identity::client_id().await;
    let state = state::new_state(cfg, client_id)?;
    let store = ChallengeStore::new();

    info!(
        client_id = %state.client_id,
        server = %state.cfg.server_url(),
        version = version::VERSION,
        "worker starting"
    );

    // Bind before spawning anything: a taken challenge port is fatal.
    let listener = server::bind(state.cfg.server.port).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = DispatchContext::new(state.clone(), store.clone(), shutdown_tx.clone());

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if state.cfg.server.metrics_port > 0 {
        let handle = telemetry::init_metrics_recorder();
        let addr = SocketAddr::from(([127, 0, 0, 1], state.cfg.server.metrics_port));
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown_fut = async move {
                if !*shutdown.borrow() {
                    let _ = shutdown.changed().await;
                }
            };
            if let Err(err) = telemetry::serve_metrics(handle, addr, shutdown_fut).await {
                error!(?err, "metrics server exited with error");
            }
        }));
    }

    {
        let store = store.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = server::serve_on(listener, store, shutdown).await {
                error!(?err, "http-01 responder exited with error");
            }
        }));
    }

    {
        let store = store.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            challenge::sweep_loop(store, shutdown).await;
        }));
    }

    {
        let ctx = ctx.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = control::control_loop(ctx, shutdown).await {
                error!(?err, "control loop exited with error");
            }
        }));
    }

    let mut internal_shutdown = shutdown_rx.clone();
    tokio::select! {
        _ = wait_for_shutdown_signal() => info!("shutdown signal received, stopping worker"),
        _ = internal_shutdown.changed() => info!("internal shutdown requested, stopping worker"),
    }

    let _ = shutdown_tx.send(true);
    for handle in tasks {
        let _ = handle.await;
    }

    info!("worker stopped");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
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
}
