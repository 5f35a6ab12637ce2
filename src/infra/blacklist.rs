//! Usage: Provider blacklist store (rolling failure counters + timed suspensions,
//! sqlite-persisted through a buffered writer).
//!
//! All deadlines are unix seconds in UTC; comparisons never involve local time.

use rusqlite::params;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::app::notice::Notifier;
use crate::infra::db::Db;
use crate::infra::settings::SettingsStore;
use crate::shared::mutex_ext::MutexExt;
use crate::shared::time::now_unix_seconds;

const WRITE_BUFFER_CAPACITY: usize = 512;
const WRITE_BATCH_MAX: usize = 200;
const MAX_SUSPENSION_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Default)]
pub struct BlacklistEntry {
    pub failure_count: u32,
    pub blacklisted_until: Option<i64>,
    pub level: i64,
    pub auto_recovered: bool,
}

#[derive(Debug, Clone)]
pub struct PersistedBlacklistState {
    pub platform: String,
    pub provider_name: String,
    pub entry: BlacklistEntry,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub failure_threshold: u32,
    pub retry_wait_seconds: u64,
}

pub struct BlacklistStore {
    settings: SettingsStore,
    notifier: Arc<Notifier>,
    entries: Mutex<HashMap<(String, String), BlacklistEntry>>,
    persist_tx: Option<mpsc::Sender<PersistedBlacklistState>>,
}

impl BlacklistStore {
    /// In-memory only; used by tests and by deployments that opt out of persistence.
    pub fn new(settings: SettingsStore, notifier: Arc<Notifier>) -> Self {
        Self {
            settings,
            notifier,
            entries: Mutex::new(HashMap::new()),
            persist_tx: None,
        }
    }

    /// Load persisted counters and start the buffered writer.
    pub fn with_persistence(
        db: Db,
        settings: SettingsStore,
        notifier: Arc<Notifier>,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let loaded = load_all(&db)?;
        let (tx, task) = start_buffered_writer(db);
        Ok((
            Self {
                settings,
                notifier,
                entries: Mutex::new(loaded),
                persist_tx: Some(tx),
            },
            task,
        ))
    }

    pub fn should_use_fixed_mode(&self) -> bool {
        self.settings.read().blacklist.enabled
    }

    pub fn retry_config(&self) -> RetryConfig {
        let cfg = self.settings.read().blacklist;
        RetryConfig {
            failure_threshold: cfg.failure_threshold.max(1),
            retry_wait_seconds: cfg.retry_wait_seconds,
        }
    }

    /// Returns the suspension deadline when the provider is currently blacklisted.
    pub fn is_blacklisted(&self, platform: &str, name: &str) -> Option<i64> {
        self.is_blacklisted_at(platform, name, now_unix_seconds())
    }

    pub fn is_blacklisted_at(&self, platform: &str, name: &str, now: i64) -> Option<i64> {
        let key = (platform.to_string(), name.to_string());
        let mut entries = self.entries.lock_or_recover();
        let entry = entries.get_mut(&key)?;
        let until = entry.blacklisted_until?;
        if until > now {
            return Some(until);
        }
        // Expired suspension: flip to auto-recovered so the UI can tell a manual
        // reset apart from a timeout, keep the failure counter as-is.
        if !entry.auto_recovered {
            entry.auto_recovered = true;
            entry.blacklisted_until = None;
            let snapshot = entry.clone();
            drop(entries);
            self.persist(platform, name, snapshot, now);
        }
        None
    }

    pub fn record_success(&self, platform: &str, name: &str) {
        let now = now_unix_seconds();
        let key = (platform.to_string(), name.to_string());
        let snapshot = {
            let mut entries = self.entries.lock_or_recover();
            let entry = entries.entry(key).or_default();
            entry.failure_count = 0;
            entry.blacklisted_until = None;
            entry.auto_recovered = false;
            entry.clone()
        };
        self.persist(platform, name, snapshot, now);
    }

    /// Increments the rolling failure counter; once it reaches the configured
    /// threshold the provider is suspended for `duration_for_level(level)`.
    /// Returns true when this call triggered (or extended) a suspension.
    pub fn record_failure(&self, platform: &str, name: &str, level: i64) -> bool {
        self.record_failure_at(platform, name, level, now_unix_seconds())
    }

    pub fn record_failure_at(&self, platform: &str, name: &str, level: i64, now: i64) -> bool {
        let threshold = self.retry_config().failure_threshold;
        let base_minutes = self.settings.read().blacklist.base_duration_minutes;
        let key = (platform.to_string(), name.to_string());

        let (snapshot, just_suspended, duration_secs) = {
            let mut entries = self.entries.lock_or_recover();
            let entry = entries.entry(key).or_default();
            entry.failure_count = entry.failure_count.saturating_add(1);
            entry.level = level.max(1);

            let mut just_suspended = false;
            let mut duration_secs = 0;
            if entry.failure_count >= threshold {
                duration_secs = duration_for_level(base_minutes, entry.level);
                let until = now + duration_secs;
                just_suspended = entry
                    .blacklisted_until
                    .map(|existing| existing <= now)
                    .unwrap_or(true);
                entry.blacklisted_until = Some(until);
                entry.auto_recovered = false;
            }
            (entry.clone(), just_suspended, duration_secs)
        };

        self.persist(platform, name, snapshot, now);

        if just_suspended && self.settings.read().enable_switch_notify {
            self.notifier.notify_provider_blacklisted(
                platform,
                name,
                level.max(1),
                duration_secs / 60,
            );
        }
        just_suspended
    }

    pub fn entry(&self, platform: &str, name: &str) -> Option<BlacklistEntry> {
        let key = (platform.to_string(), name.to_string());
        self.entries.lock_or_recover().get(&key).cloned()
    }

    fn persist(&self, platform: &str, name: &str, entry: BlacklistEntry, now: i64) {
        let Some(tx) = self.persist_tx.as_ref() else {
            return;
        };
        // Lossy by design: a full buffer drops the snapshot, the next state
        // change re-enqueues the latest value.
        let _ = tx.try_send(PersistedBlacklistState {
            platform: platform.to_string(),
            provider_name: name.to_string(),
            entry,
            updated_at: now,
        });
    }
}

/// Suspension length doubles per level and is capped at a day.
pub fn duration_for_level(base_minutes: u32, level: i64) -> i64 {
    let level = level.clamp(1, 16) as u32;
    let minutes = (base_minutes.max(1) as i64).saturating_mul(1i64 << (level - 1));
    (minutes * 60).min(MAX_SUSPENSION_SECS)
}

fn start_buffered_writer(
    db: Db,
) -> (mpsc::Sender<PersistedBlacklistState>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<PersistedBlacklistState>(WRITE_BUFFER_CAPACITY);
    let task = tokio::task::spawn_blocking(move || {
        writer_loop(db, rx);
    });
    (tx, task)
}

fn writer_loop(db: Db, mut rx: mpsc::Receiver<PersistedBlacklistState>) {
    let mut buffer: Vec<PersistedBlacklistState> = Vec::with_capacity(WRITE_BATCH_MAX);

    while let Some(item) = rx.blocking_recv() {
        buffer.push(item);

        while buffer.len() < WRITE_BATCH_MAX {
            match rx.try_recv() {
                Ok(next) => buffer.push(next),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }

        if let Err(err) = insert_batch(&db, &buffer) {
            tracing::error!("provider_blacklist insert_batch error: {err}");
        }
        buffer.clear();
    }

    if !buffer.is_empty() {
        if let Err(err) = insert_batch(&db, &buffer) {
            tracing::error!("provider_blacklist final insert_batch error: {err}");
        }
    }
}

fn insert_batch(db: &Db, items: &[PersistedBlacklistState]) -> Result<(), String> {
    if items.is_empty() {
        return Ok(());
    }

    // Only the newest snapshot per (platform, provider) matters.
    let mut latest: HashMap<(String, String), &PersistedBlacklistState> =
        HashMap::with_capacity(items.len().min(WRITE_BATCH_MAX));
    for item in items {
        latest.insert((item.platform.clone(), item.provider_name.clone()), item);
    }

    let mut conn = db.open_connection()?;
    let tx = conn
        .transaction()
        .map_err(|e| format!("DB_ERROR: failed to start transaction: {e}"))?;

    {
        let mut stmt = tx
            .prepare(
                r#"
INSERT INTO provider_blacklist (
  platform, provider_name, failure_count, blacklisted_until, level, auto_recovered, updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(platform, provider_name) DO UPDATE SET
  failure_count = excluded.failure_count,
  blacklisted_until = excluded.blacklisted_until,
  level = excluded.level,
  auto_recovered = excluded.auto_recovered,
  updated_at = excluded.updated_at
"#,
            )
            .map_err(|e| format!("DB_ERROR: failed to prepare provider_blacklist upsert: {e}"))?;

        for item in latest.values() {
            stmt.execute(params![
                item.platform,
                item.provider_name,
                item.entry.failure_count as i64,
                item.entry.blacklisted_until,
                item.entry.level,
                item.entry.auto_recovered as i64,
                item.updated_at,
            ])
            .map_err(|e| format!("DB_ERROR: failed to upsert provider_blacklist: {e}"))?;
        }
    }

    tx.commit()
        .map_err(|e| format!("DB_ERROR: failed to commit transaction: {e}"))?;
    Ok(())
}

fn load_all(db: &Db) -> Result<HashMap<(String, String), BlacklistEntry>, String> {
    let conn = db.open_connection()?;
    let mut stmt = conn
        .prepare(
            r#"
SELECT platform, provider_name, failure_count, blacklisted_until, level, auto_recovered
FROM provider_blacklist
"#,
        )
        .map_err(|e| format!("DB_ERROR: failed to prepare provider_blacklist load query: {e}"))?;

    let rows = stmt
        .query_map([], |row| {
            let platform: String = row.get("platform")?;
            let name: String = row.get("provider_name")?;
            let failure_count: i64 = row.get("failure_count")?;
            Ok((
                (platform, name),
                BlacklistEntry {
                    failure_count: failure_count.clamp(0, u32::MAX as i64) as u32,
                    blacklisted_until: row.get("blacklisted_until")?,
                    level: row.get("level")?,
                    auto_recovered: row.get::<_, i64>("auto_recovered")? != 0,
                },
            ))
        })
        .map_err(|e| format!("DB_ERROR: failed to query provider_blacklist: {e}"))?;

    let mut items = HashMap::new();
    for row in rows {
        let (key, entry) =
            row.map_err(|e| format!("DB_ERROR: failed to read provider_blacklist row: {e}"))?;
        items.insert(key, entry);
    }
    Ok(items)
}
