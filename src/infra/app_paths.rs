//! Usage: Resolve the per-user data directory holding the sqlite db and config files.

use std::path::PathBuf;

const DATA_DIR_ENV: &str = "AIO_RELAY_DATA_DIR";
const DATA_DIR_NAME: &str = "aio-relay";

pub fn data_dir() -> Result<PathBuf, String> {
    let dir = match std::env::var(DATA_DIR_ENV) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => dirs::data_dir()
            .ok_or_else(|| "failed to resolve user data directory".to_string())?
            .join(DATA_DIR_NAME),
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| format!("failed to create data dir {}: {e}", dir.display()))?;
    Ok(dir)
}
