//! Usage: Drop guard that logs requests whose handler future was cancelled by
//! a client disconnect. While the guard is armed, no failure has been
//! attributed yet, so a cancelled attempt leaves provider counters untouched.

use std::time::Instant;
use tokio::sync::mpsc;

use crate::infra::request_logs::{spawn_enqueue, RequestLogInsert};

pub(super) struct RequestAbortGuard {
    log_tx: mpsc::Sender<RequestLogInsert>,
    platform: String,
    model: String,
    provider: String,
    http_code: i64,
    is_stream: bool,
    started: Instant,
    created_at: i64,
    armed: bool,
}

impl RequestAbortGuard {
    pub(super) fn new(
        log_tx: mpsc::Sender<RequestLogInsert>,
        platform: String,
        model: String,
        is_stream: bool,
        started: Instant,
        created_at: i64,
    ) -> Self {
        Self {
            log_tx,
            platform,
            model,
            provider: String::new(),
            http_code: 0,
            is_stream,
            started,
            created_at,
            armed: true,
        }
    }

    /// Record which provider is currently being attempted, so an abort mid-
    /// attempt is logged against it.
    pub(super) fn note_attempt(&mut self, provider: &str, model: &str) {
        self.provider = provider.to_string();
        self.model = model.to_string();
        self.http_code = 0;
    }

    pub(super) fn note_status(&mut self, code: u16) {
        self.http_code = code as i64;
    }

    /// Responsibility for the log row has moved elsewhere (a stream tee or an
    /// explicit enqueue).
    pub(super) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RequestAbortGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::info!(
            platform = %self.platform,
            provider = %self.provider,
            "client aborted before a response was committed"
        );
        spawn_enqueue(
            self.log_tx.clone(),
            RequestLogInsert {
                platform: self.platform.clone(),
                model: self.model.clone(),
                provider: self.provider.clone(),
                http_code: self.http_code,
                is_stream: self.is_stream,
                duration_sec: self.started.elapsed().as_secs_f64(),
                created_at: self.created_at,
                ..Default::default()
            },
        );
    }
}
