//! Usage: Outbound header construction (hop-by-hop filtering, per-provider
//! strip/override/extra rules, upstream auth injection).

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::domain::providers::{AuthType, Provider};
use crate::gateway::dialect::Dialect;
use crate::gateway::util::{strip_hop_headers, AuthStyle};

/// Build the outbound header set for one upstream attempt. The result is a
/// fresh map; mutating it never touches the inbound headers.
///
/// Order matters: hop-by-hop + inbound auth removal, then strip, then
/// override, then additive extra headers, then upstream auth, then content
/// negotiation defaults. A name listed in both `strip_headers` and
/// `override_headers` therefore ends up with the override value.
pub(crate) fn build_forward_headers(
    inbound: &HeaderMap,
    provider: Option<&Provider>,
    auth_style: AuthStyle,
    dialect: &Dialect,
) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_headers(&mut headers);
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
    headers.remove("x-goog-api-key");
    // The HTTP client recomputes these from the target URL and body.
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    if let Some(provider) = provider {
        for name in &provider.strip_headers {
            if let Ok(name) = HeaderName::try_from(name.as_str()) {
                headers.remove(name);
            }
        }
        for (name, value) in &provider.override_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        for (name, value) in &provider.extra_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                if !headers.contains_key(&name) {
                    headers.insert(name, value);
                }
            }
        }
    }

    let api_key = provider.map(|p| p.api_key.as_str()).unwrap_or("");
    let effective_style = provider
        .and_then(|p| p.auth_type)
        .map(|auth_type| match auth_type {
            AuthType::XApiKey => AuthStyle::XApiKey,
            AuthType::Bearer => AuthStyle::Bearer,
        })
        .unwrap_or(auth_style);
    inject_auth(&mut headers, dialect, effective_style, api_key);

    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if !headers.contains_key(header::ACCEPT) {
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
    }

    headers
}

fn inject_auth(headers: &mut HeaderMap, dialect: &Dialect, style: AuthStyle, api_key: &str) {
    if api_key.is_empty() {
        return;
    }

    if matches!(dialect, Dialect::Gemini) {
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert("x-goog-api-key", value);
        }
        return;
    }

    match style {
        AuthStyle::XApiKey => {
            if let Ok(value) = HeaderValue::from_str(api_key) {
                headers.insert("x-api-key", value);
            }
            headers.remove(header::AUTHORIZATION);
        }
        AuthStyle::Bearer => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(header::AUTHORIZATION, value);
            }
            headers.remove("x-api-key");
        }
    }

    if matches!(dialect, Dialect::Claude) && !headers.contains_key("anthropic-version") {
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn provider() -> Provider {
        Provider {
            name: "A".to_string(),
            api_url: "https://a.example/api".to_string(),
            api_key: "k1".to_string(),
            enabled: true,
            level: 1,
            ..Default::default()
        }
    }

    fn inbound() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("x-api-key", HeaderValue::from_static("client-key"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("user-agent", HeaderValue::from_static("claude-cli/1.0"));
        headers
    }

    #[test]
    fn claude_defaults_inject_x_api_key_and_version() {
        let headers = build_forward_headers(
            &inbound(),
            Some(&provider()),
            AuthStyle::XApiKey,
            &Dialect::Claude,
        );

        assert_eq!(headers.get("x-api-key").unwrap(), "k1");
        assert!(headers.get("authorization").is_none());
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("accept").unwrap(), "application/json");
        assert!(headers.get("connection").is_none());
        assert_eq!(headers.get("user-agent").unwrap(), "claude-cli/1.0");
    }

    #[test]
    fn bearer_style_replaces_x_api_key() {
        let headers = build_forward_headers(
            &inbound(),
            Some(&provider()),
            AuthStyle::Bearer,
            &Dialect::Codex,
        );
        assert_eq!(headers.get("authorization").unwrap(), "Bearer k1");
        assert!(headers.get("x-api-key").is_none());
        assert!(headers.get("anthropic-version").is_none());
    }

    #[test]
    fn provider_auth_type_overrides_inbound_style() {
        let mut p = provider();
        p.auth_type = Some(AuthType::Bearer);
        let headers =
            build_forward_headers(&inbound(), Some(&p), AuthStyle::XApiKey, &Dialect::Claude);
        assert_eq!(headers.get("authorization").unwrap(), "Bearer k1");
        assert!(headers.get("x-api-key").is_none());
    }

    #[test]
    fn gemini_uses_goog_api_key() {
        let headers = build_forward_headers(
            &inbound(),
            Some(&provider()),
            AuthStyle::XApiKey,
            &Dialect::Gemini,
        );
        assert_eq!(headers.get("x-goog-api-key").unwrap(), "k1");
        assert!(headers.get("x-api-key").is_none());
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn strip_then_override_then_extra_priority() {
        let mut p = provider();
        p.strip_headers = vec!["X-T".to_string()];
        p.override_headers = HashMap::from([("X-T".to_string(), "o".to_string())]);
        p.extra_headers = HashMap::from([
            ("X-T".to_string(), "e".to_string()),
            ("X-N".to_string(), "n".to_string()),
        ]);

        let mut inbound = inbound();
        inbound.insert("x-t", HeaderValue::from_static("original"));

        let headers = build_forward_headers(&inbound, Some(&p), AuthStyle::XApiKey, &Dialect::Claude);
        assert_eq!(headers.get("x-t").unwrap(), "o");
        assert_eq!(headers.get("x-n").unwrap(), "n");
    }

    #[test]
    fn extra_headers_are_additive_only() {
        let mut p = provider();
        p.extra_headers = HashMap::from([("User-Agent".to_string(), "other/2.0".to_string())]);
        let headers =
            build_forward_headers(&inbound(), Some(&p), AuthStyle::XApiKey, &Dialect::Claude);
        assert_eq!(headers.get("user-agent").unwrap(), "claude-cli/1.0");
    }

    #[test]
    fn output_is_a_deep_copy() {
        let inbound = inbound();
        let mut forwarded = build_forward_headers(
            &inbound,
            Some(&provider()),
            AuthStyle::XApiKey,
            &Dialect::Claude,
        );
        forwarded.insert("x-mutated", HeaderValue::from_static("yes"));
        forwarded.remove("user-agent");

        assert!(inbound.get("x-mutated").is_none());
        assert_eq!(inbound.get("user-agent").unwrap(), "claude-cli/1.0");
        assert_eq!(inbound.get("x-api-key").unwrap(), "client-key");
    }

    #[test]
    fn inbound_auth_is_always_dropped() {
        let mut inbound = inbound();
        inbound.insert("authorization", HeaderValue::from_static("Bearer client"));
        inbound.insert("x-goog-api-key", HeaderValue::from_static("gk"));

        let headers =
            build_forward_headers(&inbound, Some(&provider()), AuthStyle::Bearer, &Dialect::Codex);
        assert_eq!(headers.get("authorization").unwrap(), "Bearer k1");
        assert!(headers.get("x-goog-api-key").is_none());
    }

    #[test]
    fn accept_is_only_defaulted_when_absent() {
        let mut inbound = inbound();
        inbound.insert("accept", HeaderValue::from_static("text/event-stream"));
        let headers = build_forward_headers(
            &inbound,
            Some(&provider()),
            AuthStyle::XApiKey,
            &Dialect::Claude,
        );
        assert_eq!(headers.get("accept").unwrap(), "text/event-stream");
    }
}
