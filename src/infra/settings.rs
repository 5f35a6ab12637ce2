//! Usage: App settings persistence (JSON file in the data dir, re-read on demand).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SETTINGS_FILE_NAME: &str = "settings.json";

pub const DEFAULT_PREFERRED_PORT: u16 = 18100;
pub const DEFAULT_AFFINITY_TTL_SECONDS: u64 = 300;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_RETRY_WAIT_SECONDS: u64 = 0;
pub const DEFAULT_BLACKLIST_BASE_DURATION_MINUTES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestDetailMode {
    Off,
    Fail,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BlacklistSettings {
    /// Fixed mode: retry the same provider until it is suspended, then advance.
    pub enabled: bool,
    pub failure_threshold: u32,
    pub retry_wait_seconds: u64,
    pub base_duration_minutes: u32,
}

impl Default for BlacklistSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            retry_wait_seconds: DEFAULT_RETRY_WAIT_SECONDS,
            base_duration_minutes: DEFAULT_BLACKLIST_BASE_DURATION_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    pub bind_host: String,
    pub preferred_port: u16,
    pub enable_round_robin: bool,
    pub enable_switch_notify: bool,
    pub request_detail_mode: RequestDetailMode,
    pub affinity_ttl_seconds: u64,
    /// Some intermediate proxies answer with no status at all; the reference
    /// treats that as success. Kept as a knob until confirmed against real
    /// upstreams.
    pub treat_missing_status_as_success: bool,
    pub blacklist: BlacklistSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            preferred_port: DEFAULT_PREFERRED_PORT,
            enable_round_robin: false,
            enable_switch_notify: true,
            request_detail_mode: RequestDetailMode::Fail,
            affinity_ttl_seconds: DEFAULT_AFFINITY_TTL_SECONDS,
            treat_missing_status_as_success: true,
            blacklist: BlacklistSettings::default(),
        }
    }
}

/// On-demand settings reader. The file is authored by an external settings
/// editor; the relay only ever reads it.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SETTINGS_FILE_NAME),
        }
    }

    pub fn read(&self) -> AppSettings {
        let Ok(raw) = std::fs::read(&self.path) else {
            return AppSettings::default();
        };
        match serde_json::from_slice::<AppSettings>(&raw) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    "settings file unreadable, falling back to defaults: {err}"
                );
                AppSettings::default()
            }
        }
    }

    pub fn write_default_if_missing(&self) -> Result<(), String> {
        if self.path.exists() {
            return Ok(());
        }
        let payload = serde_json::to_vec_pretty(&AppSettings::default())
            .map_err(|e| format!("failed to serialize default settings: {e}"))?;
        std::fs::write(&self.path, payload)
            .map_err(|e| format!("failed to write {}: {e}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "aio-relay-settings-{tag}-{}-{}",
            std::process::id(),
            crate::shared::time::now_unix_millis()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    #[test]
    fn missing_file_yields_defaults() {
        let store = SettingsStore::new(&temp_dir("missing"));
        let settings = store.read();
        assert_eq!(settings.preferred_port, DEFAULT_PREFERRED_PORT);
        assert_eq!(settings.bind_host, "127.0.0.1");
        assert!(!settings.blacklist.enabled);
        assert_eq!(settings.blacklist.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
    }

    #[test]
    fn partial_file_fills_unset_fields_with_defaults() {
        let dir = temp_dir("partial");
        std::fs::write(
            dir.join(SETTINGS_FILE_NAME),
            br#"{"enableRoundRobin":true,"blacklist":{"enabled":true,"failureThreshold":5}}"#,
        )
        .expect("write");

        let settings = SettingsStore::new(&dir).read();
        assert!(settings.enable_round_robin);
        assert!(settings.blacklist.enabled);
        assert_eq!(settings.blacklist.failure_threshold, 5);
        assert_eq!(settings.blacklist.retry_wait_seconds, DEFAULT_RETRY_WAIT_SECONDS);
        assert_eq!(settings.preferred_port, DEFAULT_PREFERRED_PORT);
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = temp_dir("corrupt");
        std::fs::write(dir.join(SETTINGS_FILE_NAME), b"{not json").expect("write");
        let settings = SettingsStore::new(&dir).read();
        assert_eq!(settings.preferred_port, DEFAULT_PREFERRED_PORT);
    }

    #[test]
    fn detail_mode_round_trips_lowercase() {
        let parsed: RequestDetailMode = serde_json::from_str("\"all\"").expect("parse");
        assert_eq!(parsed, RequestDetailMode::All);
        assert_eq!(
            serde_json::to_string(&RequestDetailMode::Off).expect("ser"),
            "\"off\""
        );
    }
}
