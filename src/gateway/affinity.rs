//! Usage: Five-minute same-origin affinity cache. Successful forwards pin a
//! (user, platform, model) key to a provider so upstream prompt caches are not
//! invalidated by churn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

pub(crate) const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct AffinityEntry {
    provider_name: String,
    expire_at: Instant,
    hits: AtomicI64,
}

pub(crate) struct AffinityCache {
    store: RwLock<HashMap<String, Arc<AffinityEntry>>>,
    ttl: Duration,
    sweeper_started: AtomicBool,
    stopped: AtomicBool,
    stop: Notify,
}

impl AffinityCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            ttl: if ttl.is_zero() { DEFAULT_TTL } else { ttl },
            sweeper_started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
        }
    }

    /// Returns the pinned provider while the entry is fresh. The hit counter
    /// uses an atomic so the hot path never takes the write lock; expired
    /// entries are removed lazily here and by the background sweeper.
    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<String> {
        {
            let store = self.store.read().ok()?;
            if let Some(entry) = store.get(key) {
                if entry.expire_at > now {
                    entry.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.provider_name.clone());
                }
            } else {
                return None;
            }
        }

        // Expired: upgrade to the write lock with a re-check, another task may
        // have replaced the entry in between.
        if let Ok(mut store) = self.store.write() {
            if let Some(entry) = store.get(key) {
                if entry.expire_at > now {
                    entry.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.provider_name.clone());
                }
                store.remove(key);
            }
        }
        None
    }

    pub(crate) fn set(&self, key: &str, provider_name: &str) {
        if let Ok(mut store) = self.store.write() {
            store.insert(
                key.to_string(),
                Arc::new(AffinityEntry {
                    provider_name: provider_name.to_string(),
                    expire_at: Instant::now() + self.ttl,
                    hits: AtomicI64::new(1),
                }),
            );
        }
    }

    pub(crate) fn invalidate(&self, key: &str) {
        if let Ok(mut store) = self.store.write() {
            store.remove(key);
        }
    }

    /// (total entries, expired-but-not-yet-swept entries)
    pub(crate) fn stats(&self) -> (usize, usize) {
        let now = Instant::now();
        let Ok(store) = self.store.read() else {
            return (0, 0);
        };
        let total = store.len();
        let expired = store.values().filter(|e| e.expire_at <= now).count();
        (total, expired)
    }

    fn sweep(&self) {
        let now = Instant::now();
        if let Ok(mut store) = self.store.write() {
            store.retain(|_, entry| entry.expire_at > now);
        }
    }

    /// Starts the background sweeper at most once.
    pub(crate) fn start_sweeper(self: &Arc<Self>) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of `interval` fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => cache.sweep(),
                    _ = cache.stop.notified() => return,
                }
            }
        });
    }

    /// Stopping twice is a no-op.
    pub(crate) fn stop_sweeper(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.notify_waiters();
    }
}
