//! Usage: Gemini dialect forwarding. Non-streaming responses are fully read
//! before any byte reaches the client so a failed read can still fail over;
//! once a streaming response is committed no further provider may be tried.

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::time::Instant;

use crate::domain::providers::GeminiProvider;
use crate::gateway::dialect::Dialect;
use crate::gateway::headers::build_forward_headers;
use crate::gateway::http_client::send_with_retry;
use crate::gateway::manager::GatewayAppState;
use crate::gateway::streams::{gunzip_with_limit, FinalizeCtx, SseUsageTeeStream, StreamOutcome};
use crate::gateway::usage::UsageAccumulator;
use crate::gateway::util::{build_target_url, strip_hop_headers, AuthStyle};

use super::errors::ForwardFailure;
use super::forward::{
    drain_error_body, has_gzip_content_encoding, headers_to_map, store_failure_detail,
    FailureDetail,
};
use super::AttemptOutcome;

const ERROR_BODY_PREFIX_BYTES: usize = 2 * 1024;
// Gemini upstreams do not hold connections open for hours the way the message
// dialects do; the reference bounds each attempt tightly.
const GEMINI_DEADLINE: std::time::Duration = std::time::Duration::from_secs(300);

pub(super) struct GeminiAttemptRequest<'a> {
    pub state: &'a GatewayAppState,
    pub provider: &'a GeminiProvider,
    pub endpoint: &'a str,
    pub query: &'a [(String, String)],
    pub inbound_headers: &'a HeaderMap,
    pub is_stream: bool,
    pub body: Bytes,
    pub model: &'a str,
    pub affinity_key: Option<&'a str>,
    pub started: Instant,
    pub created_at: i64,
}

pub(super) async fn forward_gemini_attempt(req: GeminiAttemptRequest<'_>) -> AttemptOutcome {
    let url = match build_target_url(&req.provider.base_url, req.endpoint, req.query) {
        Ok(url) => url,
        Err(err) => return AttemptOutcome::Failure(ForwardFailure::Transport(err)),
    };
    let request_url = url.to_string();

    let mut outbound_headers = build_forward_headers(
        req.inbound_headers,
        None,
        AuthStyle::XApiKey,
        &Dialect::Gemini,
    );
    if !req.provider.api_key.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&req.provider.api_key) {
            outbound_headers.insert("x-goog-api-key", value);
        }
    }

    let response = match send_with_retry(
        &req.state.client,
        reqwest::Method::POST,
        url,
        outbound_headers.clone(),
        req.body.clone(),
        GEMINI_DEADLINE,
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
            platform: "gemini",
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

    let mut response_headers = response.headers().clone();
    strip_hop_headers(&mut response_headers);
    let response_gzip = has_gzip_content_encoding(&response_headers);

    let ctx = FinalizeCtx {
        log_tx: req.state.log_tx.clone(),
        details: req.state.details.clone(),
        blacklist: req.state.blacklist.clone(),
        affinity: req.state.affinity.clone(),
        affinity_key: req.affinity_key.map(str::to_string),
        dialect: Dialect::Gemini,
        platform: "gemini".to_string(),
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

    if req.is_stream {
        // Committing this response flushes the 2xx header; from the first byte
        // on, mid-stream errors are charged to the provider by the tee but the
        // router can no longer fail over.
        let body = Body::from_stream(SseUsageTeeStream::new(response.bytes_stream(), ctx));
        return AttemptOutcome::Success(build_response(status, &response_headers, body));
    }

    // Non-streaming: read the whole upstream body first. A read failure here
    // has written nothing to the client, so the caller may try the next
    // provider.
    let full_body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            return AttemptOutcome::Failure(ForwardFailure::Transport(format!(
                "failed to read upstream body: {err}"
            )))
        }
    };

    let mut usage = UsageAccumulator::default();
    let parse_source = if response_gzip {
        gunzip_with_limit(&full_body, 4 * 1024 * 1024).unwrap_or_default()
    } else {
        full_body.to_vec()
    };
    if let Ok(text) = std::str::from_utf8(&parse_source) {
        usage.apply_gemini_payload(text);
    }
    ctx.finish(StreamOutcome::Eof, usage, Some(full_body.to_vec()), false);

    AttemptOutcome::Success(build_response(
        status,
        &response_headers,
        Body::from(full_body),
    ))
}

fn build_response(status: reqwest::StatusCode, headers: &HeaderMap, body: Body) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response build error").into_response()
    })
}
