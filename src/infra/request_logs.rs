//! Usage: Request log persistence (sqlite buffered writer behind a bounded channel).

use rusqlite::{params, ErrorCode};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::infra::db::Db;

const WRITE_BUFFER_CAPACITY: usize = 512;
const WRITE_BATCH_MAX: usize = 50;
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const INSERT_RETRY_MAX_ATTEMPTS: u32 = 8;
const INSERT_RETRY_BASE_DELAY_MS: u64 = 20;
const INSERT_RETRY_MAX_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Default)]
pub struct RequestLogInsert {
    pub platform: String,
    pub model: String,
    pub provider: String,
    pub http_code: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_create_tokens: i64,
    pub cache_read_tokens: i64,
    pub reasoning_tokens: i64,
    pub is_stream: bool,
    pub duration_sec: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbWriteErrorKind {
    Busy,
    Other,
}

fn classify_rusqlite_error(err: &rusqlite::Error) -> DbWriteErrorKind {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => DbWriteErrorKind::Busy,
            _ => DbWriteErrorKind::Other,
        },
        _ => DbWriteErrorKind::Other,
    }
}

fn retry_delay(attempt_index: u32) -> Duration {
    let exp = attempt_index.min(20);
    let raw = INSERT_RETRY_BASE_DELAY_MS.saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX));
    Duration::from_millis(raw.min(INSERT_RETRY_MAX_DELAY_MS))
}

/// Single-writer rule: the router never inserts directly; every row goes
/// through this channel and lands in batched transactions.
pub fn start_buffered_writer(
    db: Db,
) -> (mpsc::Sender<RequestLogInsert>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<RequestLogInsert>(WRITE_BUFFER_CAPACITY);
    let task = tokio::task::spawn_blocking(move || {
        writer_loop(db, rx);
    });
    (tx, task)
}

fn writer_loop(db: Db, mut rx: mpsc::Receiver<RequestLogInsert>) {
    let mut buffer: Vec<RequestLogInsert> = Vec::with_capacity(WRITE_BATCH_MAX);

    while let Some(item) = rx.blocking_recv() {
        buffer.push(item);

        while buffer.len() < WRITE_BATCH_MAX {
            match rx.try_recv() {
                Ok(next) => buffer.push(next),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }

        insert_batch_with_retry(&db, &buffer);
        buffer.clear();
    }

    if !buffer.is_empty() {
        insert_batch_with_retry(&db, &buffer);
    }
}

fn insert_batch_with_retry(db: &Db, items: &[RequestLogInsert]) {
    for attempt_index in 0..INSERT_RETRY_MAX_ATTEMPTS {
        match insert_batch(db, items) {
            Ok(()) => return,
            Err((kind, message)) => {
                if kind != DbWriteErrorKind::Busy
                    || attempt_index + 1 == INSERT_RETRY_MAX_ATTEMPTS
                {
                    tracing::error!("request_log insert_batch error: {message}");
                    return;
                }
                std::thread::sleep(retry_delay(attempt_index));
            }
        }
    }
}

fn insert_batch(db: &Db, items: &[RequestLogInsert]) -> Result<(), (DbWriteErrorKind, String)> {
    if items.is_empty() {
        return Ok(());
    }

    let mut conn = db
        .open_connection()
        .map_err(|e| (DbWriteErrorKind::Other, e))?;
    let tx = conn.transaction().map_err(|e| {
        (
            classify_rusqlite_error(&e),
            format!("DB_ERROR: failed to start transaction: {e}"),
        )
    })?;

    {
        let mut stmt = tx
            .prepare(
                r#"
INSERT INTO request_log (
  platform, model, provider, http_code,
  input_tokens, output_tokens, cache_create_tokens, cache_read_tokens,
  reasoning_tokens, is_stream, duration_sec, created_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
"#,
            )
            .map_err(|e| {
                (
                    classify_rusqlite_error(&e),
                    format!("DB_ERROR: failed to prepare request_log insert: {e}"),
                )
            })?;

        for item in items {
            stmt.execute(params![
                item.platform,
                item.model,
                item.provider,
                item.http_code,
                item.input_tokens,
                item.output_tokens,
                item.cache_create_tokens,
                item.cache_read_tokens,
                item.reasoning_tokens,
                item.is_stream as i64,
                item.duration_sec,
                item.created_at,
            ])
            .map_err(|e| {
                (
                    classify_rusqlite_error(&e),
                    format!("DB_ERROR: failed to insert request_log row: {e}"),
                )
            })?;
        }
    }

    tx.commit().map_err(|e| {
        (
            classify_rusqlite_error(&e),
            format!("DB_ERROR: failed to commit transaction: {e}"),
        )
    })?;

    Ok(())
}

/// Bounded enqueue: the request path waits at most five seconds, then drops
/// the row rather than stalling the proxy.
pub async fn enqueue(tx: &mpsc::Sender<RequestLogInsert>, insert: RequestLogInsert) {
    match tokio::time::timeout(ENQUEUE_TIMEOUT, tx.send(insert)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => tracing::warn!("request_log writer closed, row dropped"),
        Err(_) => tracing::warn!("request_log enqueue timed out, row dropped"),
    }
}

/// Fire-and-forget variant for synchronous contexts (stream finalizers, drop guards).
pub fn spawn_enqueue(tx: mpsc::Sender<RequestLogInsert>, insert: RequestLogInsert) {
    tokio::spawn(async move {
        enqueue(&tx, insert).await;
    });
}
