//! Usage: Request-path helpers (trace ids, URL composition, auth/model detection).

use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::shared::time::now_unix_seconds;

pub(crate) const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

static TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn new_trace_id() -> String {
    let ts = now_unix_seconds();
    let seq = TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{ts}-{seq}")
}

/// Hop-by-hop headers must not cross the proxy (RFC 7230 §6.1).
pub(crate) fn strip_hop_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONNECTION);
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
    headers.remove(header::PROXY_AUTHENTICATE);
    headers.remove(header::PROXY_AUTHORIZATION);
    headers.remove(header::TE);
    headers.remove(header::TRAILER);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::UPGRADE);
}

/// Flatten an inbound query string; for repeated keys the last value wins.
pub(crate) fn flatten_query(query: &str) -> Vec<(String, String)> {
    let mut order: Vec<String> = Vec::new();
    let mut values: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        let key = url_decode_component(key);
        let value = url_decode_component(value);
        if !values.contains_key(&key) {
            order.push(key.clone());
        }
        values.insert(key, value);
    }

    order
        .into_iter()
        .map(|key| {
            let value = values.remove(&key).unwrap_or_default();
            (key, value)
        })
        .collect()
}

/// `trim(apiURL, '/') + ensureLeadingSlash(endpoint)`, then the flattened
/// inbound query merged on top of any query already present in the endpoint.
pub(crate) fn build_target_url(
    api_url: &str,
    endpoint: &str,
    query: &[(String, String)],
) -> Result<reqwest::Url, String> {
    let base = api_url.trim_end_matches('/');
    let endpoint = if endpoint.starts_with('/') || endpoint.is_empty() {
        endpoint.to_string()
    } else {
        format!("/{endpoint}")
    };

    let mut url = reqwest::Url::parse(&format!("{base}{endpoint}"))
        .map_err(|e| format!("invalid target url: {e}"))?;

    if !query.is_empty() {
        let mut merged: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        for (key, value) in query {
            if let Some(existing) = merged.iter_mut().find(|(k, _)| k == key) {
                existing.1 = value.clone();
            } else {
                merged.push((key.clone(), value.clone()));
            }
        }
        url.query_pairs_mut().clear().extend_pairs(merged);
    }

    Ok(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthStyle {
    XApiKey,
    Bearer,
}

/// Mirror whatever auth shape the CLI used; fall back to the platform default
/// when the inbound request carried neither header.
pub(crate) fn detect_auth_style(headers: &HeaderMap, platform_default: AuthStyle) -> AuthStyle {
    if headers.contains_key("x-api-key") {
        return AuthStyle::XApiKey;
    }
    if headers.contains_key(header::AUTHORIZATION) {
        return AuthStyle::Bearer;
    }
    platform_default
}

/// Stable per-user identifier for affinity keys: a sha256 prefix of the
/// client's API key, never the key itself.
pub(crate) fn extract_user_id(headers: &HeaderMap) -> String {
    let raw = headers
        .get(header::AUTHORIZATION)
        .or_else(|| headers.get("x-api-key"))
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");

    if raw.is_empty() {
        return "anonymous".to_string();
    }

    let api_key = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    if api_key.is_empty() {
        return "anonymous".to_string();
    }
    hash_api_key(api_key)
}

pub(crate) fn hash_api_key(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    hex::encode(&digest[..8])
}

/// `{user}:{platform}:{model}`; the empty model uses a sentinel so it cannot
/// collide with a real model name.
pub(crate) fn affinity_key(user_id: &str, platform: &str, model: &str) -> String {
    let model = if model.is_empty() { "_default" } else { model };
    format!("{user_id}:{platform}:{model}")
}

/// `/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse` → `gemini-2.5-pro`
pub(crate) fn extract_gemini_model_from_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.split('?').next().unwrap_or(endpoint);
    let Some(idx) = endpoint.find("models/") else {
        return String::new();
    };
    let rest = &endpoint[idx + "models/".len()..];
    let end = rest.find([':', '/']).unwrap_or(rest.len());
    rest[..end].trim().to_string()
}

pub(crate) fn is_gemini_stream_endpoint(endpoint: &str, query: &str) -> bool {
    endpoint.contains(":streamGenerateContent") || query.contains("alt=sse")
}

fn url_decode_component(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(input.len());
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = |b: u8| -> Option<u8> {
                    match b {
                        b'0'..=b'9' => Some(b - b'0'),
                        b'a'..=b'f' => Some(b - b'a' + 10),
                        b'A'..=b'F' => Some(b - b'A' + 10),
                        _ => None,
                    }
                };
                if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    out.push(hi * 16 + lo);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).to_string()
}
