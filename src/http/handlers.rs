//! Route handlers.

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use super::middleware::ClientIdentity;
use super::AppState;
use crate::context::Context;

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "time": now_rfc3339(),
    }))
}

pub async fn echo(Extension(identity): Extension<ClientIdentity>) -> impl IntoResponse {
    Json(json!({
        "message": "Request successful",
        "ip": identity.ip,
        "token": identity.token,
        "time": now_rfc3339(),
    }))
}

pub async fn status(
    State(state): State<AppState>,
    Extension(identity): Extension<ClientIdentity>,
) -> Response {
    let ctx = Context::with_timeout(state.request_timeout);

    let remaining = match state
        .limiter
        .remaining_requests(&ctx, &identity.ip, &identity.token)
        .await
    {
        Ok(remaining) => remaining,
        Err(e) => {
            error!(error = %e, "Failed to get remaining requests");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to get remaining requests",
            );
        }
    };

    let blocked = match state
        .limiter
        .is_blocked(&ctx, &identity.ip, &identity.token)
        .await
    {
        Ok(blocked) => blocked,
        Err(e) => {
            error!(error = %e, "Failed to check block status");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to check block status");
        }
    };

    Json(json!({
        "remaining_requests": remaining,
        "blocked": blocked,
        "ip": identity.ip,
        "token": identity.token,
    }))
    .into_response()
}

/// Body of the admin block/unblock endpoints.
#[derive(Debug, Deserialize)]
pub struct AdminRequest {
    /// "ip" or "token"
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    /// Block length; only read by the block endpoint.
    #[serde(default)]
    pub duration_minutes: Option<u64>,
}

impl AdminRequest {
    fn validate(&self) -> Result<(), Response> {
        if self.key.is_empty() {
            return Err(error_response(StatusCode::BAD_REQUEST, "Invalid request"));
        }
        if self.kind != "ip" && self.kind != "token" {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "Invalid type. Must be 'ip' or 'token'",
            ));
        }
        Ok(())
    }
}

fn admin_body(body: Result<Json<AdminRequest>, JsonRejection>) -> Result<AdminRequest, Response> {
    let Json(request) = body.map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid request"))?;
    request.validate()?;
    Ok(request)
}

pub async fn unblock(
    State(state): State<AppState>,
    body: Result<Json<AdminRequest>, JsonRejection>,
) -> Response {
    let request = match admin_body(body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let ctx = Context::with_timeout(state.request_timeout);
    if let Err(e) = state.limiter.unblock(&ctx, &request.key).await {
        error!(kind = %request.kind, error = %e, "Failed to unblock");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to unblock");
    }

    info!(kind = %request.kind, key = %request.key, "Unblocked");
    Json(json!({
        "message": format!("{} {} unblocked successfully", request.kind, request.key),
    }))
    .into_response()
}

pub async fn block(
    State(state): State<AppState>,
    body: Result<Json<AdminRequest>, JsonRejection>,
) -> Response {
    let request = match admin_body(body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let Some(minutes) = request.duration_minutes.filter(|m| *m > 0) else {
        return error_response(StatusCode::BAD_REQUEST, "duration_minutes must be greater than zero");
    };

    let ctx = Context::with_timeout(state.request_timeout);
    let duration = Duration::from_secs(minutes.saturating_mul(60));
    if let Err(e) = state.limiter.block(&ctx, &request.key, duration).await {
        error!(kind = %request.kind, error = %e, "Failed to block");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to block");
    }

    info!(kind = %request.kind, key = %request.key, minutes, "Blocked");
    Json(json!({
        "message": format!("{} {} blocked for {} minutes", request.kind, request.key, minutes),
    }))
    .into_response()
}
