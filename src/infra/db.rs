//! Usage: SQLite connection setup, schema migrations, and common DB helpers.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::shared::time::now_unix_seconds;

const DB_FILE_NAME: &str = "aio-relay.db";
const LATEST_SCHEMA_VERSION: i64 = 2;
const BUSY_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Cheap, cloneable handle. Every caller opens its own short-lived connection;
/// WAL mode keeps readers and the single buffered writer from blocking each other.
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(DB_FILE_NAME),
        }
    }

    pub fn at_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn open_connection(&self) -> Result<Connection, String> {
        let path_hint = self.path.to_string_lossy().to_string();
        let conn = Connection::open(&self.path)
            .map_err(|e| format!("failed to open sqlite db at {path_hint}: {e}"))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| format!("failed to set sqlite busy_timeout for {path_hint}: {e}"))?;

        configure_connection(&conn)
            .map_err(|e| format!("sqlite init failed at {path_hint}: {e}"))?;

        Ok(conn)
    }

    pub fn init(&self) -> Result<(), String> {
        let path_hint = self.path.to_string_lossy().to_string();
        let mut conn = self.open_connection()?;
        apply_migrations(&mut conn)
            .map_err(|e| format!("sqlite migration failed at {path_hint}: {e}"))?;
        Ok(())
    }
}

fn configure_connection(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
"#,
    )
    .map_err(|e| format!("failed to configure sqlite pragmas: {e}"))?;
    Ok(())
}

fn apply_migrations(conn: &mut Connection) -> Result<(), String> {
    let mut user_version = read_user_version(conn)?;

    if !(0..=LATEST_SCHEMA_VERSION).contains(&user_version) {
        return Err(format!(
            "unsupported sqlite schema version: user_version={user_version} (expected 0..={LATEST_SCHEMA_VERSION})"
        ));
    }

    while user_version < LATEST_SCHEMA_VERSION {
        match user_version {
            0 => migrate_v0_to_v1(conn)?,
            1 => migrate_v1_to_v2(conn)?,
            v => {
                return Err(format!(
                    "unsupported sqlite schema version: user_version={v} (expected 0..={LATEST_SCHEMA_VERSION})"
                ))
            }
        }
        user_version = read_user_version(conn)?;
    }

    Ok(())
}

fn read_user_version(conn: &Connection) -> Result<i64, String> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| format!("failed to read sqlite user_version: {e}"))
}

fn set_user_version(tx: &rusqlite::Transaction<'_>, version: i64) -> Result<(), String> {
    tx.pragma_update(None, "user_version", version)
        .map_err(|e| format!("failed to update sqlite user_version: {e}"))?;
    Ok(())
}

fn migrate_v0_to_v1(conn: &mut Connection) -> Result<(), String> {
    const VERSION: i64 = 1;
    let tx = conn
        .transaction()
        .map_err(|e| format!("failed to start sqlite transaction: {e}"))?;

    tx.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS request_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  platform TEXT NOT NULL,
  model TEXT NOT NULL DEFAULT '',
  provider TEXT NOT NULL DEFAULT '',
  http_code INTEGER NOT NULL DEFAULT 0,
  input_tokens INTEGER NOT NULL DEFAULT 0,
  output_tokens INTEGER NOT NULL DEFAULT 0,
  cache_create_tokens INTEGER NOT NULL DEFAULT 0,
  cache_read_tokens INTEGER NOT NULL DEFAULT 0,
  reasoning_tokens INTEGER NOT NULL DEFAULT 0,
  is_stream INTEGER NOT NULL DEFAULT 0,
  duration_sec REAL NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_request_log_created_at ON request_log(created_at);
CREATE INDEX IF NOT EXISTS idx_request_log_platform ON request_log(platform, created_at);
"#,
    )
    .map_err(|e| format!("failed to create request_log: {e}"))?;

    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![VERSION, now_unix_seconds()],
    )
    .map_err(|e| format!("failed to record migration v1: {e}"))?;

    set_user_version(&tx, VERSION)?;
    tx.commit()
        .map_err(|e| format!("failed to commit migration v1: {e}"))?;
    Ok(())
}

fn migrate_v1_to_v2(conn: &mut Connection) -> Result<(), String> {
    const VERSION: i64 = 2;
    let tx = conn
        .transaction()
        .map_err(|e| format!("failed to start sqlite transaction: {e}"))?;

    tx.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS provider_blacklist (
  platform TEXT NOT NULL,
  provider_name TEXT NOT NULL,
  failure_count INTEGER NOT NULL DEFAULT 0,
  blacklisted_until INTEGER,
  level INTEGER NOT NULL DEFAULT 1,
  auto_recovered INTEGER NOT NULL DEFAULT 0,
  updated_at INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (platform, provider_name)
);
"#,
    )
    .map_err(|e| format!("failed to create provider_blacklist: {e}"))?;

    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![VERSION, now_unix_seconds()],
    )
    .map_err(|e| format!("failed to record migration v2: {e}"))?;

    set_user_version(&tx, VERSION)?;
    tx.commit()
        .map_err(|e| format!("failed to commit migration v2: {e}"))?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn temp_db(tag: &str) -> Db {
    let mut path = std::env::temp_dir();
    let unique = format!(
        "aio-relay-test-{tag}-{}-{}.db",
        std::process::id(),
        crate::shared::time::now_unix_millis()
    );
    path.push(unique);
    let _ = std::fs::remove_file(&path);
    Db::at_path(path)
}
