//! Usage: In-memory request detail cache (fixed-capacity ring keyed by log sequence id).

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::infra::settings::RequestDetailMode;
use crate::shared::mutex_ext::MutexExt;

pub const DEFAULT_CACHE_CAPACITY: usize = 100;
pub const MAX_REQUEST_BODY_SIZE: usize = 300 * 1024;
pub const MAX_RESPONSE_BODY_SIZE: usize = 300 * 1024;
pub const MAX_STREAM_RESPONSE_SIZE: usize = 500 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct RequestDetail {
    pub sequence_id: i64,
    pub platform: String,
    pub provider: String,
    pub model: String,
    pub request_url: String,
    pub request_body: String,
    pub response_body: String,
    pub headers: HashMap<String, String>,
    pub response_headers: HashMap<String, String>,
    pub http_code: i64,
    pub duration_ms: i64,
    pub truncated: bool,
    pub request_size: usize,
    pub response_size: usize,
    pub created_at: i64,
}

pub struct RequestDetailCache {
    mode: RwLock<RequestDetailMode>,
    inner: Mutex<Ring>,
}

struct Ring {
    buffer: Vec<Option<RequestDetail>>,
    head: usize,
    count: usize,
}

impl RequestDetailCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CACHE_CAPACITY
        } else {
            capacity
        };
        Self {
            mode: RwLock::new(RequestDetailMode::Off),
            inner: Mutex::new(Ring {
                buffer: (0..capacity).map(|_| None).collect(),
                head: 0,
                count: 0,
            }),
        }
    }

    pub fn set_mode(&self, mode: RequestDetailMode) {
        if let Ok(mut guard) = self.mode.write() {
            *guard = mode;
        }
    }

    pub fn mode(&self) -> RequestDetailMode {
        self.mode
            .read()
            .map(|guard| *guard)
            .unwrap_or(RequestDetailMode::Off)
    }

    pub fn should_record(&self, http_code: i64) -> bool {
        match self.mode() {
            RequestDetailMode::Off => false,
            RequestDetailMode::Fail => !(200..300).contains(&http_code),
            RequestDetailMode::All => true,
        }
    }

    pub fn store(&self, detail: RequestDetail) {
        let mut ring = self.inner.lock_or_recover();
        let capacity = ring.buffer.len();
        let head = ring.head;
        ring.buffer[head] = Some(detail);
        ring.head = (head + 1) % capacity;
        if ring.count < capacity {
            ring.count += 1;
        }
    }

    pub fn get(&self, sequence_id: i64) -> Option<RequestDetail> {
        let ring = self.inner.lock_or_recover();
        ring.buffer
            .iter()
            .flatten()
            .find(|d| d.sequence_id == sequence_id)
            .cloned()
    }

    pub fn get_recent(&self, limit: usize) -> Vec<RequestDetail> {
        let ring = self.inner.lock_or_recover();
        let capacity = ring.buffer.len();
        let take = limit.min(ring.count);
        let mut out = Vec::with_capacity(take);
        for i in 0..take {
            let idx = (ring.head + capacity - 1 - i) % capacity;
            if let Some(detail) = ring.buffer[idx].as_ref() {
                out.push(detail.clone());
            }
        }
        out
    }

    pub fn clear(&self) {
        let mut ring = self.inner.lock_or_recover();
        for slot in ring.buffer.iter_mut() {
            *slot = None;
        }
        ring.head = 0;
        ring.count = 0;
    }

    pub fn stats(&self) -> (usize, usize) {
        let ring = self.inner.lock_or_recover();
        (ring.count, ring.buffer.len())
    }
}

/// Truncation is stable: truncating already-truncated content is a no-op.
pub fn truncate_body(body: &str, max_size: usize) -> (String, bool) {
    if body.len() <= max_size {
        return (body.to_string(), false);
    }
    let mut end = max_size;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    (body[..end].to_string(), true)
}

/// Redact auth-bearing header values. Redaction is stable: applying it twice
/// yields the same output as applying it once.
pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    let mut sanitized = HashMap::with_capacity(headers.len());
    for (key, value) in headers {
        if is_sensitive_header(key) {
            sanitized.insert(key.clone(), mask_secret(value));
        } else {
            sanitized.insert(key.clone(), value.clone());
        }
    }
    sanitized
}

fn is_sensitive_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "authorization" | "x-api-key" | "x-goog-api-key" | "api-key" | "bearer"
    )
}

fn mask_secret(value: &str) -> String {
    if value.contains("****") {
        return value.to_string();
    }
    if value.len() > 12 {
        format!("{}****{}", &value[..8], &value[value.len() - 4..])
    } else if value.len() > 4 {
        format!("{}****", &value[..4])
    } else {
        "****".to_string()
    }
}
