//! Usage: One upstream attempt for the message dialects: compose the target
//! URL, rewrite headers, send, and turn a 2xx into a teed relay response.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::time::Instant;

use crate::domain::providers::Provider;
use crate::gateway::dialect::Dialect;
use crate::gateway::headers::build_forward_headers;
use crate::gateway::http_client::{send_with_retry, UPSTREAM_DEADLINE};
use crate::gateway::manager::GatewayAppState;
use crate::gateway::streams::{BodyBufferTeeStream, FinalizeCtx, SseUsageTeeStream};
use crate::gateway::util::{build_target_url, strip_hop_headers, AuthStyle};
use crate::infra::request_details::{
    sanitize_headers, truncate_body, RequestDetail, MAX_REQUEST_BODY_SIZE,
};
use crate::shared::time::now_unix_millis;

use super::errors::ForwardFailure;

const ERROR_BODY_PREFIX_BYTES: usize = 2 * 1024;

pub(super) struct AttemptRequest<'a> {
    pub state: &'a GatewayAppState,
    pub dialect: &'a Dialect,
    pub platform: &'a str,
    pub provider: &'a Provider,
    pub endpoint: &'a str,
    pub query: &'a [(String, String)],
    pub inbound_headers: &'a HeaderMap,
    pub auth_style: AuthStyle,
    pub body: Bytes,
    pub is_stream: bool,
    pub model: &'a str,
    /// `None` when affinity is out of play (blacklist-retry mode).
    pub affinity_key: Option<&'a str>,
    pub started: Instant,
    pub created_at: i64,
}

pub(super) enum AttemptOutcome {
    /// 2xx committed; the returned response owns the log row via its tee.
    Success(Response),
    Failure(ForwardFailure),
}

pub(super) async fn forward_attempt(req: AttemptRequest<'_>) -> AttemptOutcome {
    let url = match build_target_url(&req.provider.api_url, req.endpoint, req.query) {
        Ok(url) => url,
        Err(err) => return AttemptOutcome::Failure(ForwardFailure::Transport(err)),
    };
    let request_url = url.to_string();

    let outbound_headers =
        build_forward_headers(req.inbound_headers, Some(req.provider), req.auth_style, req.dialect);

    let response = match send_with_retry(
        &req.state.client,
        reqwest::Method::POST,
        url,
        outbound_headers.clone(),
        req.body.clone(),
        UPSTREAM_DEADLINE,
    )
    .await
    {
        Ok(response) => response,
        Err(err) => {
            return AttemptOutcome::Failure(ForwardFailure::Transport(format!(
                "request failed: {err}"
            )))
        }
    };

    let status = response.status();
    if !status.is_success() {
        let response_headers = headers_to_map(response.headers());
        let body_prefix = drain_error_body(response, ERROR_BODY_PREFIX_BYTES).await;
        store_failure_detail(FailureDetail {
            state: req.state,
            platform: req.platform,
            provider_name: &req.provider.name,
            model: req.model,
            status: status.as_u16(),
            request_url: &request_url,
            request_body: &req.body,
            outbound_headers: &outbound_headers,
            response_headers,
            body_prefix: &body_prefix,
            started: req.started,
            created_at: req.created_at,
        });
        return AttemptOutcome::Failure(ForwardFailure::Status {
            status: status.as_u16(),
            body_prefix,
        });
    }

    AttemptOutcome::Success(relay_success_response(req, response, request_url, outbound_headers))
}

pub(super) struct FailureDetail<'a> {
    pub state: &'a GatewayAppState,
    pub platform: &'a str,
    pub provider_name: &'a str,
    pub model: &'a str,
    pub status: u16,
    pub request_url: &'a str,
    pub request_body: &'a Bytes,
    pub outbound_headers: &'a HeaderMap,
    pub response_headers: HashMap<String, String>,
    pub body_prefix: &'a str,
    pub started: Instant,
    pub created_at: i64,
}

/// Failed attempts are captured too (mode `fail` exists for exactly this);
/// the error body prefix stands in for the response body.
pub(super) fn store_failure_detail(detail: FailureDetail<'_>) {
    if !detail.state.details.should_record(detail.status as i64) {
        return;
    }

    let request_body_text = String::from_utf8_lossy(detail.request_body);
    let (request_body_text, request_truncated) =
        truncate_body(&request_body_text, MAX_REQUEST_BODY_SIZE);

    detail.state.details.store(RequestDetail {
        sequence_id: now_unix_millis(),
        platform: detail.platform.to_string(),
        provider: detail.provider_name.to_string(),
        model: detail.model.to_string(),
        request_url: detail.request_url.to_string(),
        request_body: request_body_text,
        response_body: detail.body_prefix.to_string(),
        headers: sanitize_headers(&headers_to_map(detail.outbound_headers)),
        response_headers: detail.response_headers,
        http_code: detail.status as i64,
        duration_ms: detail.started.elapsed().as_millis().min(i64::MAX as u128) as i64,
        truncated: request_truncated,
        request_size: detail.request_body.len(),
        response_size: detail.body_prefix.len(),
        created_at: detail.created_at,
    });
}

/// Build the client-facing response around a tee of the upstream body. From
/// here on the log row belongs to the tee: it fires on EOF, on a mid-stream
/// upstream error, or on drop (client abort).
fn relay_success_response(
    req: AttemptRequest<'_>,
    response: reqwest::Response,
    request_url: String,
    outbound_headers: HeaderMap,
) -> Response {
    let status = response.status();
    let mut response_headers = response.headers().clone();
    strip_hop_headers(&mut response_headers);

    let response_gzip = has_gzip_content_encoding(&response_headers);
    let is_event_stream = is_event_stream(&response_headers);

    let ctx = FinalizeCtx {
        log_tx: req.state.log_tx.clone(),
        details: req.state.details.clone(),
        blacklist: req.state.blacklist.clone(),
        affinity: req.state.affinity.clone(),
        affinity_key: req.affinity_key.map(str::to_string),
        dialect: req.dialect.clone(),
        platform: req.platform.to_string(),
        provider_name: req.provider.name.clone(),
        provider_level: req.provider.level,
        model: req.model.to_string(),
        is_stream: req.is_stream,
        status: status.as_u16(),
        started: req.started,
        created_at: req.created_at,
        request_url,
        request_body: req.body.clone(),
        request_headers: headers_to_map(&outbound_headers),
        response_headers: headers_to_map(&response_headers),
        response_gzip,
    };

    let body = if is_event_stream {
        Body::from_stream(SseUsageTeeStream::new(response.bytes_stream(), ctx))
    } else {
        Body::from_stream(BodyBufferTeeStream::new(response.bytes_stream(), ctx))
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }
    match builder.body(body) {
        Ok(resp) => resp,
        Err(_) => {
            let mut fallback =
                (StatusCode::INTERNAL_SERVER_ERROR, "response build error").into_response();
            fallback
                .headers_mut()
                .insert("x-relay-error", HeaderValue::from_static("build"));
            fallback
        }
    }
}

/// Read a capped prefix of an error body for diagnostics, then drop the rest.
pub(super) async fn drain_error_body(mut response: reqwest::Response, cap: usize) -> String {
    let mut collected: Vec<u8> = Vec::with_capacity(cap.min(1024));
    while collected.len() < cap {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = cap - collected.len();
                collected.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&collected).to_string()
}

pub(super) fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

pub(super) fn has_gzip_content_encoding(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .any(|enc| enc.eq_ignore_ascii_case("gzip"))
        })
        .unwrap_or(false)
}

pub(super) fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_stream_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("Text/Event-Stream; charset=utf-8"),
        );
        assert!(is_event_stream(&headers));

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        assert!(!is_event_stream(&headers));
    }

    #[test]
    fn gzip_detection_handles_encoding_lists() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_ENCODING,
            HeaderValue::from_static("br, GZIP"),
        );
        assert!(has_gzip_content_encoding(&headers));

        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("identity"));
        assert!(!has_gzip_content_encoding(&headers));
    }
}
