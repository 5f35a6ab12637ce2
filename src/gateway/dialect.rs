//! Usage: Upstream dialect capability set (endpoint/auth defaults + usage parser).

use crate::gateway::usage::UsageAccumulator;
use crate::gateway::util::AuthStyle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Dialect {
    Claude,
    Codex,
    Gemini,
    Custom(String),
}

impl Dialect {
    /// Platform key used for affinity, blacklist, round-robin, and log rows.
    pub(crate) fn platform_key(&self) -> String {
        match self {
            Dialect::Claude => "claude".to_string(),
            Dialect::Codex => "codex".to_string(),
            Dialect::Gemini => "gemini".to_string(),
            Dialect::Custom(tool_id) => format!("custom:{tool_id}"),
        }
    }

    pub(crate) fn default_endpoint(&self) -> &'static str {
        match self {
            Dialect::Claude | Dialect::Custom(_) => "/v1/messages",
            Dialect::Codex => "/responses",
            // Gemini endpoints are whatever the client routed; there is no default.
            Dialect::Gemini => "",
        }
    }

    pub(crate) fn default_auth_style(&self) -> AuthStyle {
        match self {
            Dialect::Claude | Dialect::Custom(_) => AuthStyle::XApiKey,
            Dialect::Codex => AuthStyle::Bearer,
            Dialect::Gemini => AuthStyle::XApiKey,
        }
    }

    /// Feed one decoded payload (an SSE `data:` value or a whole JSON body)
    /// into the accumulator.
    pub(crate) fn apply_usage_payload(&self, data: &str, acc: &mut UsageAccumulator) {
        match self {
            Dialect::Claude | Dialect::Custom(_) => acc.apply_claude_payload(data),
            Dialect::Codex => acc.apply_codex_payload(data),
            Dialect::Gemini => acc.apply_gemini_payload(data),
        }
    }
}
