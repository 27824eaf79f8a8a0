//! Gateway process lifecycle
//!
//! Serves the gateway until a shutdown future resolves, then tears down every
//! tenant instance exactly once, whether the server stopped cleanly or failed.

use crate::routes::gateway_router;
use crate::AppState;
use std::future::Future;
use tokio::net::TcpListener;

/// Runs the gateway on `listener` until `shutdown` resolves
///
/// `InstanceManager::cleanup` always runs before this returns.
///
/// # Errors
///
/// Returns the I/O error that stopped the server, after cleanup.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let manager = state.manager.clone();
    let app = gateway_router(state);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Gateway listening on http://{}", addr);
    }

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    if let Err(e) = &served {
        tracing::error!(error = %e, "Gateway server stopped with an error");
    }

    manager.cleanup().await;
    served
}

/// Resolves on SIGINT, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
