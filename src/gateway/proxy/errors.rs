//! Usage: Failure classification + standardized gateway error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Why a single upstream attempt did not produce a relayable response.
///
/// Client aborts never reach this type: when the inbound connection drops the
/// handler future is cancelled, so no failure is attributed to the provider
/// (the abort guard writes the log row instead).
#[derive(Debug, Clone)]
pub(crate) enum ForwardFailure {
    /// Upstream answered with a non-2xx status; a capped prefix of the error
    /// body is kept for diagnostics.
    Status { status: u16, body_prefix: String },
    /// The request never completed at the transport level (after the
    /// network-level retry already ran its course).
    Transport(String),
}

impl ForwardFailure {
    pub(crate) fn status(&self) -> Option<u16> {
        match self {
            ForwardFailure::Status { status, .. } => Some(*status),
            ForwardFailure::Transport(_) => None,
        }
    }

    pub(crate) fn message(&self) -> String {
        match self {
            ForwardFailure::Status { status, .. } => format!("upstream status {status}"),
            ForwardFailure::Transport(message) => message.clone(),
        }
    }
}

impl std::fmt::Display for ForwardFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

pub(crate) fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

pub(crate) fn internal_error(message: impl Into<String>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

pub(crate) fn no_candidates(requested_model: &str, skipped: usize) -> Response {
    let message = if requested_model.is_empty() {
        "no providers available".to_string()
    } else {
        format!(
            "no available provider supports model '{requested_model}' ({skipped} incompatible providers skipped)"
        )
    };
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

pub(crate) fn all_failed_failover(
    total_attempts: usize,
    last_provider: &str,
    last_duration_sec: f64,
    last_error: &str,
) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({
            "error": format!("all {total_attempts} providers failed, last error: {last_error}"),
            "last_provider": last_provider,
            "last_duration": format!("{last_duration_sec:.2}s"),
            "total_attempts": total_attempts,
        })),
    )
        .into_response()
}

pub(crate) fn all_failed_blacklist_retry(
    total_attempts: usize,
    last_provider: &str,
    last_error: &str,
) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({
            "error": format!(
                "all providers failed or were blacklisted, last attempt: {last_provider} - {last_error}"
            ),
            "lastProvider": last_provider,
            "totalAttempts": total_attempts,
            "mode": "blacklist_retry",
            "hint": "fixed mode retries the same provider until suspension; disable it for immediate failover",
        })),
    )
        .into_response()
}
