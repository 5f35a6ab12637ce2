//! Usage: Shared end-of-relay bookkeeping: the single request_log row, detail
//! capture, and failure attribution for mid-stream errors.

use axum::body::Bytes;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::gateway::affinity::AffinityCache;
use crate::gateway::dialect::Dialect;
use crate::gateway::usage::UsageAccumulator;
use crate::infra::blacklist::BlacklistStore;
use crate::infra::request_details::{
    sanitize_headers, truncate_body, RequestDetail, RequestDetailCache, MAX_REQUEST_BODY_SIZE,
    MAX_RESPONSE_BODY_SIZE,
};
use crate::infra::request_logs::{spawn_enqueue, RequestLogInsert};
use crate::shared::time::now_unix_millis;

const GUNZIP_OUTPUT_LIMIT: usize = 4 * 1024 * 1024;

/// How the relay ended, as observed by the tee adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamOutcome {
    /// Upstream EOF reached, every byte offered to the client.
    Eof,
    /// Upstream failed after the 2xx header was already committed. Counts as
    /// a provider failure but can no longer fail over.
    UpstreamError(String),
    /// The client went away. Never attributed to the provider.
    ClientAbort,
}

/// Everything the tee needs to close out the request once the router has
/// already returned the response to the HTTP layer.
pub(crate) struct FinalizeCtx {
    pub log_tx: mpsc::Sender<RequestLogInsert>,
    pub details: Arc<RequestDetailCache>,
    pub blacklist: Arc<BlacklistStore>,
    pub affinity: Arc<AffinityCache>,
    /// `None` when the affinity cache was not consulted (blacklist-retry mode).
    pub affinity_key: Option<String>,
    pub dialect: Dialect,
    pub platform: String,
    pub provider_name: String,
    pub provider_level: i64,
    pub model: String,
    pub is_stream: bool,
    pub status: u16,
    pub started: Instant,
    pub created_at: i64,
    pub request_url: String,
    pub request_body: Bytes,
    pub request_headers: HashMap<String, String>,
    pub response_headers: HashMap<String, String>,
    pub response_gzip: bool,
}

impl FinalizeCtx {
    pub(crate) fn finish(
        &self,
        outcome: StreamOutcome,
        usage: UsageAccumulator,
        collected: Option<Vec<u8>>,
        collect_truncated: bool,
    ) {
        let duration_sec = self.started.elapsed().as_secs_f64();

        if let StreamOutcome::UpstreamError(reason) = &outcome {
            tracing::warn!(
                platform = %self.platform,
                provider = %self.provider_name,
                "mid-stream upstream failure (response already committed): {reason}"
            );
            self.blacklist
                .record_failure(&self.platform, &self.provider_name, self.provider_level);
            if let Some(key) = self.affinity_key.as_deref() {
                self.affinity.invalidate(key);
            }
        }

        spawn_enqueue(
            self.log_tx.clone(),
            RequestLogInsert {
                platform: self.platform.clone(),
                model: self.model.clone(),
                provider: self.provider_name.clone(),
                http_code: self.status as i64,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_create_tokens: usage.cache_create_tokens,
                cache_read_tokens: usage.cache_read_tokens,
                reasoning_tokens: usage.reasoning_tokens,
                is_stream: self.is_stream,
                duration_sec,
                created_at: self.created_at,
            },
        );

        if let Some(collected) = collected {
            self.store_detail(collected, collect_truncated, duration_sec);
        }
    }

    fn store_detail(&self, collected: Vec<u8>, collect_truncated: bool, duration_sec: f64) {
        if !self.details.should_record(self.status as i64) {
            return;
        }

        let collected = if self.response_gzip {
            match gunzip_with_limit(&collected, GUNZIP_OUTPUT_LIMIT) {
                Ok(decoded) => decoded,
                // Keep the raw bytes; garbled is better than empty for debugging.
                Err(_) => collected,
            }
        } else {
            collected
        };

        let request_body = String::from_utf8_lossy(&self.request_body);
        let (request_body, request_truncated) =
            truncate_body(&request_body, MAX_REQUEST_BODY_SIZE);
        let response_body = String::from_utf8_lossy(&collected);
        let (response_body, response_truncated) =
            truncate_body(&response_body, MAX_RESPONSE_BODY_SIZE);

        let response_size = response_body.len();
        self.details.store(RequestDetail {
            sequence_id: now_unix_millis(),
            platform: self.platform.clone(),
            provider: self.provider_name.clone(),
            model: self.model.clone(),
            request_url: self.request_url.clone(),
            request_body,
            response_body,
            headers: sanitize_headers(&self.request_headers),
            response_headers: self.response_headers.clone(),
            http_code: self.status as i64,
            duration_ms: (duration_sec * 1000.0) as i64,
            truncated: request_truncated || response_truncated || collect_truncated,
            request_size: self.request_body.len(),
            response_size,
            created_at: self.created_at,
        });
    }
}

/// One-shot gunzip with an output ceiling, for detail capture only; transport
/// bytes are never decompressed.
pub(crate) fn gunzip_with_limit(input: &[u8], max_output_bytes: usize) -> Result<Vec<u8>, String> {
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let mut decoder = flate2::read::GzDecoder::new(input);
    let mut out: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    let mut had_any_output = false;

    loop {
        match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                had_any_output = true;
                if out.len().saturating_add(n) > max_output_bytes {
                    return Err(format!(
                        "gunzip output exceeded limit: limit={max_output_bytes} bytes"
                    ));
                }
                out.extend_from_slice(&buf[..n]);
            }
            Err(err) => {
                // Truncated gzip streams are common on aborted upstreams; keep
                // whatever already decoded.
                if !had_any_output {
                    return Err(format!("failed to gunzip: {err}"));
                }
                break;
            }
        }
    }

    Ok(out)
}
