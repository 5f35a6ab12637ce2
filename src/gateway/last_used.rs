//! Usage: Per-platform registry of the most recently successful provider.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::shared::time::now_unix_millis;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct LastUsedProvider {
    pub platform: String,
    pub provider_name: String,
    pub updated_at: i64,
}

#[derive(Debug, Default)]
pub(crate) struct LastUsedRegistry {
    inner: RwLock<HashMap<String, LastUsedProvider>>,
}

impl LastUsedRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, platform: &str, provider_name: &str) {
        if let Ok(mut inner) = self.inner.write() {
            inner.insert(
                platform.to_string(),
                LastUsedProvider {
                    platform: platform.to_string(),
                    provider_name: provider_name.to_string(),
                    updated_at: now_unix_millis(),
                },
            );
        }
    }

    pub(crate) fn get(&self, platform: &str) -> Option<LastUsedProvider> {
        self.inner.read().ok()?.get(platform).cloned()
    }

    pub(crate) fn all(&self) -> Vec<LastUsedProvider> {
        self.inner
            .read()
            .map(|inner| inner.values().cloned().collect())
            .unwrap_or_default()
    }
}
