//! HTTP server plumbing
//!
//! Binding is separated from serving so startup can surface a port
//! conflict as its own exit code and tests can grab an ephemeral port.

use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Binds the listener for the given address.
///
/// # Errors
///
/// Returns an error when the address cannot be bound.
pub async fn bind(host: &str, port: u16) -> std::io::Result<(TcpListener, SocketAddr)> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = TcpListener::bind(addr).await?;
    let actual = listener.local_addr()?;
    Ok((listener, actual))
}

/// Binds any available local port (tests)
///
/// # Errors
///
/// Returns an error when no port can be bound.
pub async fn bind_ephemeral() -> std::io::Result<(TcpListener, SocketAddr)> {
    bind("127.0.0.1", 0).await
}

/// Serves the router until the cancellation token fires.
///
/// # Errors
///
/// Returns an error if the server fails while running.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let shutdown_signal = async move {
        shutdown.cancelled().await;
        info!("shutdown signal received, draining connections");
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(std::io::Error::other)
}
