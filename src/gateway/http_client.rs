//! Usage: Shared upstream HTTP client with one network-level retry for
//! transient errors (TCP resets, truncated TLS handshakes, timeouts).
//!
//! Application-level retries are the router's job; this layer only absorbs
//! wire-level flakes so they do not pollute provider failure counters.

use axum::body::Bytes;
use axum::http::HeaderMap;
use std::sync::OnceLock;
use std::time::Duration;

const MAX_RETRIES: u32 = 1;
const RETRY_DELAY: Duration = Duration::from_millis(500);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Upstream deadline: model thinking time dominates, so the per-attempt
/// deadline is effectively "very long"; real timeouts are enforced elsewhere.
pub(crate) const UPSTREAM_DEADLINE: Duration = Duration::from_secs(32 * 60 * 60);

/// Process-wide client. Per-request deadlines go through
/// `RequestBuilder::timeout`; nobody reconfigures the shared client.
pub(crate) fn shared_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .expect("failed to build shared http client")
    })
}

/// Send with at most one retry on transient network errors. The body is a
/// `Bytes` handle, so replaying it for the retry is a refcount bump, not a copy.
pub(crate) async fn send_with_retry(
    client: &reqwest::Client,
    method: reqwest::Method,
    url: reqwest::Url,
    headers: HeaderMap,
    body: Bytes,
    deadline: Duration,
) -> Result<reqwest::Response, reqwest::Error> {
    for attempt in 0..MAX_RETRIES {
        let result = client
            .request(method.clone(), url.clone())
            .headers(headers.clone())
            .body(body.clone())
            .timeout(deadline)
            .send()
            .await;

        match result {
            Ok(resp) => return Ok(resp),
            Err(err) if is_transient_network_error(&err) => {
                tracing::warn!(
                    "transient network error, retrying in {}ms ({}/{}): {err}",
                    RETRY_DELAY.as_millis(),
                    attempt + 1,
                    MAX_RETRIES,
                );
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err) => return Err(err),
        }
    }

    client
        .request(method, url)
        .headers(headers)
        .body(body)
        .timeout(deadline)
        .send()
        .await
}

/// Worth one retry: connect-phase timeouts and the classic mid-handshake /
/// mid-read resets. Refused connections are not retried (the server is gone,
/// not flaky), and request-build errors are never transient.
pub(crate) fn is_transient_network_error(err: &reqwest::Error) -> bool {
    if err.is_builder() || err.is_redirect() || err.is_status() || err.is_decode() {
        return false;
    }
    if err.is_timeout() {
        return true;
    }
    error_chain_matches_transient(err)
}

fn error_chain_matches_transient(err: &(dyn std::error::Error + 'static)) -> bool {
    const TRANSIENT_PATTERNS: [&str; 5] = [
        "unexpected eof",
        "unexpected end of file",
        "broken pipe",
        "connection reset",
        "tls handshake timeout",
    ];

    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        let message = e.to_string().to_ascii_lowercase();
        if message.contains("connection refused") {
            return false;
        }
        if TRANSIENT_PATTERNS.iter().any(|p| message.contains(p)) {
            return true;
        }
        current = e.source();
    }
    false
}
