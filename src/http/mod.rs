//! HTTP transport for the rate limiter.
//!
//! Extracts the client IP and token, asks the limiter, and renders the
//! decision. All admission logic lives in [`crate::ratelimit`].

mod handlers;
mod middleware;
mod server;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub use middleware::{client_ip, ClientIdentity, REMAINING_HEADER, TOKEN_HEADER};
pub use server::HttpServer;

use crate::ratelimit::RateLimiter;

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    /// Budget for the limiter calls made on behalf of one request.
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(limiter: Arc<RateLimiter>, request_timeout: Duration) -> Self {
        Self {
            limiter,
            request_timeout,
        }
    }
}

/// Build the application router.
///
/// `/api/*` is rate limited; `/health` and `/admin/*` are not.
pub fn router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/test", get(handlers::echo))
        .route("/status", get(handlers::status))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", limited)
        .route("/admin/unblock", post(handlers::unblock))
        .route("/admin/block", post(handlers::block))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
