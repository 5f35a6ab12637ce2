//! Usage: Provider configuration model + on-demand loader for the gateway.
//!
//! The config file is authored by an external editor/import tool; the relay
//! re-reads it per request and never mutates it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const PROVIDERS_FILE_NAME: &str = "providers.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    #[serde(rename = "x-api-key")]
    XApiKey,
    #[serde(rename = "bearer")]
    Bearer,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Provider {
    pub id: i64,
    pub name: String,
    #[serde(rename = "apiURL")]
    pub api_url: String,
    pub api_key: String,
    pub enabled: bool,
    pub level: i64,
    /// Optional override of the platform's default path.
    pub endpoint: Option<String>,
    pub auth_type: Option<AuthType>,
    pub supported_models: Vec<String>,
    pub model_mapping: HashMap<String, String>,
    pub strip_headers: Vec<String>,
    pub override_headers: HashMap<String, String>,
    pub extra_headers: HashMap<String, String>,
}

impl Provider {
    /// Non-blocking configuration checks; a non-empty result disqualifies the
    /// provider for the current request.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("provider name is empty".to_string());
        }
        if self.enabled {
            if self.api_url.trim().is_empty() {
                errors.push("apiURL is empty".to_string());
            } else if reqwest::Url::parse(&self.api_url).is_err() {
                errors.push(format!("apiURL is not a valid URL: {}", self.api_url));
            }
            if self.api_key.trim().is_empty() {
                errors.push("apiKey is empty".to_string());
            }
        }
        if let Some(endpoint) = self.endpoint.as_deref() {
            if !endpoint.is_empty() && !endpoint.starts_with('/') {
                errors.push(format!("endpoint must start with '/': {endpoint}"));
            }
        }

        errors
    }

    /// A provider with neither a model whitelist nor a mapping accepts any model.
    pub fn is_model_supported(&self, model: &str) -> bool {
        if self.supported_models.is_empty() && self.model_mapping.is_empty() {
            return true;
        }
        self.supported_models.iter().any(|m| m == model) || self.model_mapping.contains_key(model)
    }

    pub fn effective_model<'a>(&'a self, requested: &'a str) -> &'a str {
        match self.model_mapping.get(requested) {
            Some(mapped) if !mapped.is_empty() => mapped.as_str(),
            _ => requested,
        }
    }

    pub fn effective_endpoint<'a>(&'a self, default_endpoint: &'a str) -> &'a str {
        match self.endpoint.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => endpoint,
            _ => default_endpoint,
        }
    }
}

/// Gemini providers advertise exactly one model and a bare base URL.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct GeminiProvider {
    pub id: i64,
    pub name: String,
    #[serde(rename = "baseURL")]
    pub base_url: String,
    pub api_key: String,
    pub enabled: bool,
    pub level: i64,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct ProvidersFile {
    claude: Vec<Provider>,
    codex: Vec<Provider>,
    gemini: Vec<GeminiProvider>,
    custom: HashMap<String, Vec<Provider>>,
}

#[derive(Debug, Clone)]
pub struct ProviderStore {
    path: PathBuf,
}

impl ProviderStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(PROVIDERS_FILE_NAME),
        }
    }

    fn read_file(&self) -> Result<ProvidersFile, String> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ProvidersFile::default())
            }
            Err(err) => return Err(format!("failed to read {}: {err}", self.path.display())),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| format!("failed to parse {}: {e}", self.path.display()))
    }

    /// `kind` is `claude`, `codex`, or `custom:<toolId>`.
    pub fn load(&self, kind: &str) -> Result<Vec<Provider>, String> {
        let file = self.read_file()?;
        match kind {
            "claude" => Ok(file.claude),
            "codex" => Ok(file.codex),
            other => match other.strip_prefix("custom:") {
                Some(tool_id) => Ok(file.custom.get(tool_id).cloned().unwrap_or_default()),
                None => Err(format!("unknown provider kind: {other}")),
            },
        }
    }

    pub fn load_gemini(&self) -> Result<Vec<GeminiProvider>, String> {
        Ok(self.read_file()?.gemini)
    }

    /// Startup pass: warn about configs that will be skipped at request time.
    pub fn log_validation_warnings(&self) {
        for kind in ["claude", "codex"] {
            let providers = match self.load(kind) {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(kind, "provider config unreadable: {err}");
                    continue;
                }
            };

            let mut enabled_count = 0usize;
            for provider in &providers {
                if !provider.enabled {
                    continue;
                }
                enabled_count += 1;

                for error in provider.validate() {
                    tracing::warn!(kind, provider = %provider.name, "config check: {error}");
                }
                if provider.supported_models.is_empty() && provider.model_mapping.is_empty() {
                    tracing::warn!(
                        kind,
                        provider = %provider.name,
                        "no supportedModels or modelMapping configured; provider is treated as universal"
                    );
                }
                if !provider.model_mapping.is_empty() && provider.supported_models.is_empty() {
                    tracing::warn!(
                        kind,
                        provider = %provider.name,
                        "modelMapping without supportedModels; mapping targets are not validated"
                    );
                }
            }

            if enabled_count == 0 {
                tracing::warn!(kind, "no enabled provider configured");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str) -> Provider {
        Provider {
            name: name.to_string(),
            api_url: "https://a.example/api".to_string(),
            api_key: "k1".to_string(),
            enabled: true,
            level: 1,
            ..Default::default()
        }
    }

    #[test]
    fn empty_models_and_mapping_accepts_any_model() {
        let p = provider("A");
        assert!(p.is_model_supported("claude-haiku-4-5"));
        assert!(p.is_model_supported("anything-at-all"));
    }

    #[test]
    fn whitelist_or_mapping_key_gates_model_support() {
        let mut p = provider("A");
        p.supported_models = vec!["m1".to_string()];
        assert!(p.is_model_supported("m1"));
        assert!(!p.is_model_supported("m2"));

        p.model_mapping.insert("m2".to_string(), "m1".to_string());
        assert!(p.is_model_supported("m2"));
    }

    #[test]
    fn effective_model_follows_mapping() {
        let mut p = provider("A");
        p.model_mapping
            .insert("claude-haiku-4-5".to_string(), "upstream-haiku".to_string());
        assert_eq!(p.effective_model("claude-haiku-4-5"), "upstream-haiku");
        assert_eq!(p.effective_model("other"), "other");
    }

    #[test]
    fn effective_endpoint_prefers_user_override() {
        let mut p = provider("A");
        assert_eq!(p.effective_endpoint("/v1/messages"), "/v1/messages");
        p.endpoint = Some("/custom/messages".to_string());
        assert_eq!(p.effective_endpoint("/v1/messages"), "/custom/messages");
        p.endpoint = Some(String::new());
        assert_eq!(p.effective_endpoint("/v1/messages"), "/v1/messages");
    }

    #[test]
    fn enabled_provider_requires_url_and_key() {
        let mut p = provider("A");
        assert!(p.validate().is_empty());

        p.api_key = String::new();
        assert!(!p.validate().is_empty());

        p.enabled = false;
        assert!(p.validate().is_empty());
    }

    #[test]
    fn invalid_url_fails_validation() {
        let mut p = provider("A");
        p.api_url = "not a url".to_string();
        assert!(!p.validate().is_empty());
    }

    #[test]
    fn store_reads_kinds_and_custom_tools() {
        let dir = std::env::temp_dir().join(format!(
            "aio-relay-providers-{}-{}",
            std::process::id(),
            crate::shared::time::now_unix_millis()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(
            dir.join(PROVIDERS_FILE_NAME),
            br#"{
  "claude": [{"name":"A","apiURL":"https://a.example/api","apiKey":"k1","enabled":true,"level":1}],
  "gemini": [{"name":"G","baseURL":"https://g.example","apiKey":"gk","enabled":true,"level":1,"model":"gemini-2.5-pro"}],
  "custom": {"mytool": [{"name":"C","apiURL":"https://c.example","apiKey":"ck","enabled":true}]}
}"#,
        )
        .expect("write");

        let store = ProviderStore::new(&dir);
        assert_eq!(store.load("claude").expect("claude").len(), 1);
        assert!(store.load("codex").expect("codex").is_empty());
        assert_eq!(store.load("custom:mytool").expect("custom").len(), 1);
        assert!(store.load("custom:other").expect("custom other").is_empty());
        assert_eq!(store.load_gemini().expect("gemini")[0].model, "gemini-2.5-pro");
        assert!(store.load("bogus").is_err());
    }

    #[test]
    fn missing_file_is_empty_config() {
        let dir = std::env::temp_dir().join(format!(
            "aio-relay-providers-missing-{}",
            crate::shared::time::now_unix_millis()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let store = ProviderStore::new(&dir);
        assert!(store.load("claude").expect("claude").is_empty());
    }
}
