//! Usage: Provider switch / blacklist notifications (throttled, broadcast to subscribers).
//!
//! The relay itself only logs these; an external notification emitter can
//! subscribe to the broadcast channel and surface OS notifications.

use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::shared::mutex_ext::MutexExt;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(3);
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NoticeEvent {
    ProviderSwitch {
        platform: String,
        from_provider: String,
        to_provider: String,
        reason: String,
    },
    ProviderBlacklisted {
        platform: String,
        provider: String,
        level: i64,
        duration_minutes: i64,
    },
}

pub struct Notifier {
    min_interval: Duration,
    last_switch_notify: Mutex<Option<Instant>>,
    tx: broadcast::Sender<NoticeEvent>,
}

impl Notifier {
    pub fn new(min_interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            min_interval,
            last_switch_notify: Mutex::new(None),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NoticeEvent> {
        self.tx.subscribe()
    }

    /// Throttled: at most one switch notification per `min_interval`.
    /// Returns whether the event was emitted.
    pub fn notify_provider_switch(
        &self,
        platform: &str,
        from_provider: &str,
        to_provider: &str,
        reason: &str,
    ) -> bool {
        {
            let mut last = self.last_switch_notify.lock_or_recover();
            if let Some(at) = *last {
                if at.elapsed() < self.min_interval {
                    return false;
                }
            }
            *last = Some(Instant::now());
        }

        tracing::info!(
            platform,
            from = from_provider,
            to = to_provider,
            "provider switched: {reason}"
        );
        let _ = self.tx.send(NoticeEvent::ProviderSwitch {
            platform: platform.to_string(),
            from_provider: from_provider.to_string(),
            to_provider: to_provider.to_string(),
            reason: reason.to_string(),
        });
        true
    }

    /// Blacklist triggers are rare enough to skip the throttle; callers apply
    /// the notification toggle.
    pub fn notify_provider_blacklisted(
        &self,
        platform: &str,
        provider: &str,
        level: i64,
        duration_minutes: i64,
    ) {
        tracing::warn!(
            platform,
            provider,
            level,
            duration_minutes,
            "provider blacklisted"
        );
        let _ = self.tx.send(NoticeEvent::ProviderBlacklisted {
            platform: platform.to_string(),
            provider: provider.to_string(),
            level,
            duration_minutes,
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}
