//! Admission middleware: turns limiter decisions into HTTP responses.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error};

use super::AppState;
use crate::context::Context;

/// Header carrying the caller's access token.
pub const TOKEN_HEADER: &str = "api_key";
/// Advisory header with the requests left in the current window.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

const LIMITED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Who a request is from, as far as rate limiting is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub ip: String,
    /// Empty when no token was presented.
    pub token: String,
}

impl ClientIdentity {
    pub fn from_request(request: &Request) -> Self {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        Self {
            ip: client_ip(request.headers(), peer),
            token: request
                .headers()
                .get(TOKEN_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .trim()
                .to_string(),
        }
    }
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    let value = headers.get(name)?.to_str().ok()?;
    value.split(',').next()?.trim().parse().ok()
}

/// Resolve the client address: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the socket peer. Unparseable headers are ignored.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    header_ip(headers, "x-forwarded-for")
        .or_else(|| header_ip(headers, "x-real-ip"))
        .or(peer)
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
}

/// Admit or reject a request before it reaches its handler.
///
/// Store failures become a 500, never an implicit allow or deny.
pub async fn rate_limit(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let identity = ClientIdentity::from_request(&request);
    let ctx = Context::with_timeout(state.request_timeout);

    let decision = match state
        .limiter
        .check_request(&ctx, &identity.ip, &identity.token)
        .await
    {
        Ok(decision) => decision,
        Err(e) => {
            error!(ip = %identity.ip, error = %e, "Rate limit check failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response();
        }
    };

    if !decision.allowed {
        debug!(ip = %identity.ip, reason = %decision.reason, "Request rejected");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": LIMITED_MESSAGE, "reason": decision.reason })),
        )
            .into_response();
    }

    let remaining = state
        .limiter
        .remaining_requests(&ctx, &identity.ip, &identity.token)
        .await;

    request.extensions_mut().insert(identity);
    let mut response = next.run(request).await;

    if let Ok(remaining) = remaining {
        response
            .headers_mut()
            .insert(REMAINING_HEADER, HeaderValue::from(remaining));
    }

    response
}
