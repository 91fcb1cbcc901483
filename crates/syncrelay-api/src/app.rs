//! Application builder: wires backends, the sync manager, and the router
//! into a running server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio_util::sync::CancellationToken;

use syncrelay_cache::Backends;
use syncrelay_core::config::AppConfig;
use syncrelay_core::error::{AppError, ErrorKind};
use syncrelay_realtime::{SyncManager, SyncState};

use crate::middleware::rate_limit::run_cleanup;
use crate::router::build_router;
use crate::state::AppState;

/// Builds the complete Axum application with all routes and middleware.
pub fn build_app(state: AppState) -> Router {
    build_router(state)
}

/// Runs the SyncRelay server until SIGINT or SIGTERM, then drains.
pub async fn run_server(config: AppConfig) -> Result<(), AppError> {
    tracing::info!(
        instance_id = %config.sync.instance_id,
        "Starting SyncRelay server..."
    );
    let shutdown = CancellationToken::new();

    // ── Step 1: Connect backends ─────────────────────────────────
    tracing::info!(provider = %config.bus.provider, "Initializing backends...");
    let backends = Backends::from_config(&config.bus).await?;

    // ── Step 2: Start the sync manager ───────────────────────────
    let sync = Arc::new(SyncManager::new(config.sync.clone(), &config.bus, backends).await);
    sync.start(shutdown.child_token()).await?;

    // ── Step 3: Build application state ──────────────────────────
    let grace = Duration::from_secs(config.server.shutdown_grace_seconds);
    let cleanup_interval = Duration::from_secs(config.rate_limit.cleanup_interval_seconds.max(1));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config, sync.clone());

    // ── Step 4: Background limiter cleanup ───────────────────────
    tokio::spawn(run_cleanup(
        vec![state.ws_limiter.clone(), state.api_limiter.clone()],
        cleanup_interval,
        shutdown.child_token(),
    ));

    // ── Step 5: Serve ────────────────────────────────────────────
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        AppError::with_source(
            ErrorKind::Internal,
            format!("Failed to bind {addr}"),
            e,
        )
    })?;
    tracing::info!("SyncRelay server listening on {}", addr);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal_token.cancel();
    });

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let forced = {
        let token = shutdown.clone();
        async move {
            token.cancelled().await;
            tokio::time::sleep(grace).await;
        }
    };

    tokio::select! {
        result = async move { server.await } => {
            result.map_err(|e| AppError::internal(format!("Server error: {e}")))?;
        }
        _ = forced => {
            tracing::warn!(grace_secs = grace.as_secs(), "Grace period elapsed, forcing exit");
        }
    }

    shutdown.cancel();
    sync.shutdown().await;
    let drained = tokio::time::timeout(grace, async {
        while sync.state() != SyncState::Stopped {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Sync manager did not finish draining");
    }
    tracing::info!("SyncRelay server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
