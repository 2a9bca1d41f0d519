//! HTTP server implementation.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::{router, AppState};
use crate::error::{Result, TurnstileError};

/// HTTP server fronting the rate limiter.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AppState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Starting HTTP server");

        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TurnstileError::Io(e)
            })
    }
}
