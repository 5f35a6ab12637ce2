//! Usage: Request router: dialect entry points, affinity fast path, tiered
//! failover, and the blacklist-retry mode.

mod abort_guard;
mod errors;
mod forward;
mod gemini;
mod model_rewrite;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::domain::providers::{GeminiProvider, Provider};
use crate::gateway::dialect::Dialect;
use crate::gateway::headers::build_forward_headers;
use crate::gateway::http_client::send_with_retry;
use crate::gateway::manager::GatewayAppState;
use crate::gateway::selector::{
    select_candidates, select_gemini_candidates, Selection, Tier,
};
use crate::gateway::util::{
    affinity_key, build_target_url, detect_auth_style, extract_gemini_model_from_endpoint,
    extract_user_id, flatten_query, is_gemini_stream_endpoint, strip_hop_headers, AuthStyle,
    MAX_REQUEST_BODY_BYTES,
};
use crate::infra::request_logs::{spawn_enqueue, RequestLogInsert};
use crate::shared::time::now_unix_seconds;

use abort_guard::RequestAbortGuard;
use forward::{forward_attempt, AttemptOutcome, AttemptRequest};
use gemini::{forward_gemini_attempt, GeminiAttemptRequest};
use model_rewrite::replace_model_in_body;

struct RelayCtx {
    state: Arc<GatewayAppState>,
    dialect: Dialect,
    platform: String,
    requested_model: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
    is_stream: bool,
    auth_style: AuthStyle,
    affinity_key: String,
    started: Instant,
    created_at: i64,
}

impl RelayCtx {
    fn on_success(&self, provider_name: &str, consult_affinity: bool) {
        if consult_affinity {
            self.state.affinity.set(&self.affinity_key, provider_name);
        }
        self.state.blacklist.record_success(&self.platform, provider_name);
        self.state.last_used.set(&self.platform, provider_name);
    }

    /// One request, one row: when every candidate failed, the row is written
    /// here (success paths hand the row to the relay tee instead).
    fn write_failure_row(&self, guard: &mut RequestAbortGuard, provider: &str, status: i64) {
        guard.disarm();
        spawn_enqueue(
            self.state.log_tx.clone(),
            RequestLogInsert {
                platform: self.platform.clone(),
                model: self.requested_model.clone(),
                provider: provider.to_string(),
                http_code: status,
                is_stream: self.is_stream,
                duration_sec: self.started.elapsed().as_secs_f64(),
                created_at: self.created_at,
                ..Default::default()
            },
        );
    }
}

pub(crate) async fn relay_proxy(
    state: Arc<GatewayAppState>,
    dialect: Dialect,
    req: Request<Body>,
) -> Response {
    let started = Instant::now();
    let created_at = now_unix_seconds();
    let platform = dialect.platform_key();

    let (parts, body) = req.into_parts();
    let headers = parts.headers;
    let query_raw = parts.uri.query().unwrap_or("").to_string();

    let body_bytes = match axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => return errors::bad_request(format!("invalid request body: {err}")),
    };

    let parsed: Option<Value> = serde_json::from_slice(&body_bytes).ok();
    let is_stream = parsed
        .as_ref()
        .and_then(|v| v.get("stream"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let requested_model = parsed
        .as_ref()
        .and_then(|v| v.get("model"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if requested_model.is_empty() {
        tracing::warn!(platform = %platform, "request has no model field, model filtering disabled");
    }

    let auth_style = detect_auth_style(&headers, dialect.default_auth_style());
    let user_id = extract_user_id(&headers);
    let affinity_key = affinity_key(&user_id, &platform, &requested_model);

    let providers = match state.providers.load(&platform) {
        Ok(providers) => providers,
        Err(err) => {
            tracing::error!(platform = %platform, "failed to load providers: {err}");
            return errors::internal_error("failed to load providers");
        }
    };

    let selection = select_candidates(providers, &requested_model, &state.blacklist, &platform);
    if selection.is_empty() {
        return errors::no_candidates(&requested_model, selection.skipped);
    }

    let query = flatten_query(&query_raw);
    let mut guard = RequestAbortGuard::new(
        state.log_tx.clone(),
        platform.clone(),
        requested_model.clone(),
        is_stream,
        started,
        created_at,
    );

    let fixed_mode = state.blacklist.should_use_fixed_mode();
    let ctx = RelayCtx {
        state,
        dialect,
        platform,
        requested_model,
        query,
        headers,
        body: body_bytes,
        is_stream,
        auth_style,
        affinity_key,
        started,
        created_at,
    };

    if fixed_mode {
        blacklist_retry_loop(&ctx, &selection, &mut guard).await
    } else {
        failover_loop(&ctx, &selection, &mut guard).await
    }
}

/// Try one provider: apply its model mapping (replayable body), resolve its
/// endpoint, and forward. `Err` means the provider was skipped without an
/// upstream call (model rewrite failed).
async fn attempt_provider(
    ctx: &RelayCtx,
    provider: &Provider,
    consult_affinity: bool,
    guard: &mut RequestAbortGuard,
) -> Result<AttemptOutcome, String> {
    let effective_model = provider.effective_model(&ctx.requested_model).to_string();
    let body = if effective_model != ctx.requested_model && !ctx.requested_model.is_empty() {
        tracing::info!(
            provider = %provider.name,
            from = %ctx.requested_model,
            to = %effective_model,
            "model mapping applied"
        );
        replace_model_in_body(&ctx.body, &effective_model)
            .map_err(|err| format!("model mapping failed: {err}"))?
    } else {
        ctx.body.clone()
    };

    let endpoint = provider.effective_endpoint(ctx.dialect.default_endpoint());
    guard.note_attempt(&provider.name, &effective_model);

    Ok(forward_attempt(AttemptRequest {
        state: &ctx.state,
        dialect: &ctx.dialect,
        platform: &ctx.platform,
        provider,
        endpoint,
        query: &ctx.query,
        inbound_headers: &ctx.headers,
        auth_style: ctx.auth_style,
        body,
        is_stream: ctx.is_stream,
        model: &effective_model,
        affinity_key: consult_affinity.then_some(ctx.affinity_key.as_str()),
        started: ctx.started,
        created_at: ctx.created_at,
    })
    .await)
}

/// Failover mode: affinity fast path first, then tiers ascending, advancing on
/// the first failure of each provider.
async fn failover_loop(
    ctx: &RelayCtx,
    selection: &Selection<Provider>,
    guard: &mut RequestAbortGuard,
) -> Response {
    let mut total_attempts = 0usize;
    let mut last_provider = String::new();
    let mut last_error = "unknown error".to_string();
    let mut last_duration = 0f64;

    // Affinity fast path: attempt-then-invalidate. The cached provider is
    // tried even if a parallel request just blacklisted it; its failure then
    // clears the cache.
    let cached_name = ctx.state.affinity.get(&ctx.affinity_key);
    if let Some(cached_name) = cached_name.as_deref() {
        if let Some(provider) = selection.find_by_name(cached_name).cloned() {
            total_attempts += 1;
            let attempt_started = Instant::now();
            match attempt_provider(ctx, &provider, true, guard).await {
                Ok(AttemptOutcome::Success(resp)) => {
                    ctx.on_success(&provider.name, true);
                    guard.disarm();
                    return resp;
                }
                Ok(AttemptOutcome::Failure(failure)) => {
                    tracing::warn!(
                        provider = %provider.name,
                        "affinity provider failed: {failure}"
                    );
                    ctx.state.affinity.invalidate(&ctx.affinity_key);
                    ctx.state
                        .blacklist
                        .record_failure(&ctx.platform, &provider.name, provider.level);
                    if let Some(code) = failure.status() {
                        guard.note_status(code);
                    }
                    last_provider = provider.name.clone();
                    last_error = failure.message();
                    last_duration = attempt_started.elapsed().as_secs_f64();
                }
                Err(skip) => {
                    tracing::warn!(provider = %provider.name, "affinity provider skipped: {skip}");
                }
            }
        }
    }

    let settings = ctx.state.settings.read();
    let round_robin = settings.enable_round_robin;
    let switch_notify = settings.enable_switch_notify;

    for tier in &selection.tiers {
        let mut providers = tier.providers.clone();
        if round_robin {
            providers = ctx
                .state
                .round_robin
                .rotate(&ctx.platform, tier.level, providers);
        }

        for (index, provider) in providers.iter().enumerate() {
            if Some(provider.name.as_str()) == cached_name.as_deref() {
                continue;
            }
            total_attempts += 1;
            let attempt_started = Instant::now();

            match attempt_provider(ctx, provider, true, guard).await {
                Ok(AttemptOutcome::Success(resp)) => {
                    ctx.on_success(&provider.name, true);
                    guard.disarm();
                    return resp;
                }
                Ok(AttemptOutcome::Failure(failure)) => {
                    ctx.state
                        .blacklist
                        .record_failure(&ctx.platform, &provider.name, provider.level);
                    if let Some(code) = failure.status() {
                        guard.note_status(code);
                    }
                    last_provider = provider.name.clone();
                    last_error = failure.message();
                    last_duration = attempt_started.elapsed().as_secs_f64();
                    tracing::warn!(
                        platform = %ctx.platform,
                        provider = %provider.name,
                        level = tier.level,
                        "attempt failed: {last_error}"
                    );

                    if switch_notify {
                        if let Some(next) =
                            next_candidate_name(&providers, index, &selection.tiers, tier.level)
                        {
                            ctx.state.notifier.notify_provider_switch(
                                &ctx.platform,
                                &provider.name,
                                &next,
                                &last_error,
                            );
                        }
                    }
                }
                Err(skip) => {
                    tracing::warn!(provider = %provider.name, "provider skipped: {skip}");
                }
            }
        }
    }

    let status = last_upstream_status(&last_error);
    ctx.write_failure_row(guard, &last_provider, status);
    errors::all_failed_failover(total_attempts, &last_provider, last_duration, &last_error)
}

/// Blacklist-retry mode: hammer the same provider until the failure threshold
/// suspends it, then move on. The affinity cache is not consulted.
async fn blacklist_retry_loop(
    ctx: &RelayCtx,
    selection: &Selection<Provider>,
    guard: &mut RequestAbortGuard,
) -> Response {
    let retry_cfg = ctx.state.blacklist.retry_config();
    let mut total_attempts = 0usize;
    let mut last_provider = String::new();
    let mut last_error = "unknown error".to_string();

    for tier in &selection.tiers {
        for provider in &tier.providers {
            if ctx
                .state
                .blacklist
                .is_blacklisted(&ctx.platform, &provider.name)
                .is_some()
            {
                continue;
            }

            for retry_index in 0..retry_cfg.failure_threshold {
                // A parallel request may have suspended this provider while we
                // were sleeping between retries.
                if retry_index > 0
                    && ctx
                        .state
                        .blacklist
                        .is_blacklisted(&ctx.platform, &provider.name)
                        .is_some()
                {
                    break;
                }
                total_attempts += 1;

                match attempt_provider(ctx, provider, false, guard).await {
                    Ok(AttemptOutcome::Success(resp)) => {
                        ctx.on_success(&provider.name, false);
                        guard.disarm();
                        return resp;
                    }
                    Ok(AttemptOutcome::Failure(failure)) => {
                        if let Some(code) = failure.status() {
                            guard.note_status(code);
                        }
                        last_provider = provider.name.clone();
                        last_error = failure.message();
                        tracing::warn!(
                            platform = %ctx.platform,
                            provider = %provider.name,
                            retry = retry_index + 1,
                            of = retry_cfg.failure_threshold,
                            "attempt failed: {last_error}"
                        );

                        ctx.state
                            .blacklist
                            .record_failure(&ctx.platform, &provider.name, provider.level);
                        if ctx
                            .state
                            .blacklist
                            .is_blacklisted(&ctx.platform, &provider.name)
                            .is_some()
                        {
                            tracing::info!(
                                provider = %provider.name,
                                "failure threshold reached, provider suspended"
                            );
                            break;
                        }

                        if retry_index + 1 < retry_cfg.failure_threshold
                            && retry_cfg.retry_wait_seconds > 0
                        {
                            tokio::time::sleep(Duration::from_secs(retry_cfg.retry_wait_seconds))
                                .await;
                        }
                    }
                    Err(skip) => {
                        tracing::warn!(provider = %provider.name, "provider skipped: {skip}");
                        break;
                    }
                }
            }
        }
    }

    let status = last_upstream_status(&last_error);
    ctx.write_failure_row(guard, &last_provider, status);
    errors::all_failed_blacklist_retry(total_attempts, &last_provider, &last_error)
}

/// The next provider the router would try: the remainder of the current tier,
/// else the first provider of the next tier up.
fn next_candidate_name(
    current_tier: &[Provider],
    index: usize,
    tiers: &[Tier<Provider>],
    current_level: i64,
) -> Option<String> {
    if index + 1 < current_tier.len() {
        return Some(current_tier[index + 1].name.clone());
    }
    tiers
        .iter()
        .find(|tier| tier.level > current_level && !tier.providers.is_empty())
        .map(|tier| tier.providers[0].name.clone())
}

fn last_upstream_status(last_error: &str) -> i64 {
    // Keep the last upstream status in the log row when there was one;
    // transport-level failures are recorded as 0.
    last_error
        .strip_prefix("upstream status ")
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0)
}

pub(crate) async fn gemini_proxy(
    state: Arc<GatewayAppState>,
    api_version: &'static str,
    rest: String,
    req: Request<Body>,
) -> Response {
    let started = Instant::now();
    let created_at = now_unix_seconds();

    let (parts, body) = req.into_parts();
    let headers = parts.headers;
    let query_raw = parts.uri.query().unwrap_or("").to_string();

    let endpoint = format!("{api_version}/{}", rest.trim_start_matches('/'));
    let is_stream = is_gemini_stream_endpoint(&endpoint, &query_raw);
    let model = extract_gemini_model_from_endpoint(&endpoint);

    let body_bytes = match axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => return errors::bad_request(format!("invalid request body: {err}")),
    };

    let user_id = extract_user_id(&headers);
    let affinity_key = affinity_key(&user_id, "gemini", &model);

    let providers = match state.providers.load_gemini() {
        Ok(providers) => providers,
        Err(err) => {
            tracing::error!("failed to load gemini providers: {err}");
            return errors::internal_error("failed to load providers");
        }
    };
    let selection = select_gemini_candidates(providers, &state.blacklist);
    if selection.is_empty() {
        return errors::no_candidates(&model, selection.skipped);
    }

    let query = flatten_query(&query_raw);
    let mut guard = RequestAbortGuard::new(
        state.log_tx.clone(),
        "gemini".to_string(),
        model.clone(),
        is_stream,
        started,
        created_at,
    );

    let fixed_mode = state.blacklist.should_use_fixed_mode();
    let ctx = GeminiRelayCtx {
        state,
        endpoint,
        model,
        query,
        headers,
        body: body_bytes,
        is_stream,
        affinity_key,
        started,
        created_at,
    };

    if fixed_mode {
        gemini_blacklist_retry_loop(&ctx, &selection, &mut guard).await
    } else {
        gemini_failover_loop(&ctx, &selection, &mut guard).await
    }
}

struct GeminiRelayCtx {
    state: Arc<GatewayAppState>,
    endpoint: String,
    model: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
    is_stream: bool,
    affinity_key: String,
    started: Instant,
    created_at: i64,
}

impl GeminiRelayCtx {
    fn on_success(&self, provider_name: &str, consult_affinity: bool) {
        if consult_affinity {
            self.state.affinity.set(&self.affinity_key, provider_name);
        }
        self.state.blacklist.record_success("gemini", provider_name);
        self.state.last_used.set("gemini", provider_name);
    }

    fn write_failure_row(&self, guard: &mut RequestAbortGuard, provider: &str, status: i64) {
        guard.disarm();
        spawn_enqueue(
            self.state.log_tx.clone(),
            RequestLogInsert {
                platform: "gemini".to_string(),
                model: self.model.clone(),
                provider: provider.to_string(),
                http_code: status,
                is_stream: self.is_stream,
                duration_sec: self.started.elapsed().as_secs_f64(),
                created_at: self.created_at,
                ..Default::default()
            },
        );
    }

    async fn attempt(
        &self,
        provider: &GeminiProvider,
        consult_affinity: bool,
        guard: &mut RequestAbortGuard,
    ) -> AttemptOutcome {
        let model = if self.model.is_empty() {
            provider.model.as_str()
        } else {
            self.model.as_str()
        };
        guard.note_attempt(&provider.name, model);

        forward_gemini_attempt(GeminiAttemptRequest {
            state: &self.state,
            provider,
            endpoint: &self.endpoint,
            query: &self.query,
            inbound_headers: &self.headers,
            is_stream: self.is_stream,
            body: self.body.clone(),
            model,
            affinity_key: consult_affinity.then_some(self.affinity_key.as_str()),
            started: self.started,
            created_at: self.created_at,
        })
        .await
    }
}

async fn gemini_failover_loop(
    ctx: &GeminiRelayCtx,
    selection: &Selection<GeminiProvider>,
    guard: &mut RequestAbortGuard,
) -> Response {
    let mut total_attempts = 0usize;
    let mut last_provider = String::new();
    let mut last_error = "unknown error".to_string();
    let mut last_duration = 0f64;

    let cached_name = ctx.state.affinity.get(&ctx.affinity_key);
    if let Some(cached_name) = cached_name.as_deref() {
        if let Some(provider) = selection.find_by_name(cached_name).cloned() {
            total_attempts += 1;
            let attempt_started = Instant::now();
            match ctx.attempt(&provider, true, guard).await {
                AttemptOutcome::Success(resp) => {
                    ctx.on_success(&provider.name, true);
                    guard.disarm();
                    return resp;
                }
                AttemptOutcome::Failure(failure) => {
                    ctx.state.affinity.invalidate(&ctx.affinity_key);
                    ctx.state
                        .blacklist
                        .record_failure("gemini", &provider.name, provider.level);
                    if let Some(code) = failure.status() {
                        guard.note_status(code);
                    }
                    last_provider = provider.name.clone();
                    last_error = failure.message();
                    last_duration = attempt_started.elapsed().as_secs_f64();
                }
            }
        }
    }

    let round_robin = ctx.state.settings.read().enable_round_robin;

    for tier in &selection.tiers {
        let mut providers = tier.providers.clone();
        if round_robin {
            providers = ctx.state.round_robin.rotate("gemini", tier.level, providers);
        }

        for provider in &providers {
            if Some(provider.name.as_str()) == cached_name.as_deref() {
                continue;
            }
            total_attempts += 1;
            let attempt_started = Instant::now();

            match ctx.attempt(provider, true, guard).await {
                AttemptOutcome::Success(resp) => {
                    ctx.on_success(&provider.name, true);
                    guard.disarm();
                    return resp;
                }
                AttemptOutcome::Failure(failure) => {
                    ctx.state
                        .blacklist
                        .record_failure("gemini", &provider.name, provider.level);
                    if let Some(code) = failure.status() {
                        guard.note_status(code);
                    }
                    last_provider = provider.name.clone();
                    last_error = failure.message();
                    last_duration = attempt_started.elapsed().as_secs_f64();
                    tracing::warn!(
                        provider = %provider.name,
                        level = tier.level,
                        "gemini attempt failed: {last_error}"
                    );
                }
            }
        }
    }

    let status = last_upstream_status(&last_error);
    ctx.write_failure_row(guard, &last_provider, status);
    errors::all_failed_failover(total_attempts, &last_provider, last_duration, &last_error)
}

async fn gemini_blacklist_retry_loop(
    ctx: &GeminiRelayCtx,
    selection: &Selection<GeminiProvider>,
    guard: &mut RequestAbortGuard,
) -> Response {
    let retry_cfg = ctx.state.blacklist.retry_config();
    let mut total_attempts = 0usize;
    let mut last_provider = String::new();
    let mut last_error = "unknown error".to_string();

    for tier in &selection.tiers {
        for provider in &tier.providers {
            if ctx
                .state
                .blacklist
                .is_blacklisted("gemini", &provider.name)
                .is_some()
            {
                continue;
            }

            for retry_index in 0..retry_cfg.failure_threshold {
                if retry_index > 0
                    && ctx
                        .state
                        .blacklist
                        .is_blacklisted("gemini", &provider.name)
                        .is_some()
                {
                    break;
                }
                total_attempts += 1;

                match ctx.attempt(provider, false, guard).await {
                    AttemptOutcome::Success(resp) => {
                        ctx.on_success(&provider.name, false);
                        guard.disarm();
                        return resp;
                    }
                    AttemptOutcome::Failure(failure) => {
                        if let Some(code) = failure.status() {
                            guard.note_status(code);
                        }
                        last_provider = provider.name.clone();
                        last_error = failure.message();

                        ctx.state
                            .blacklist
                            .record_failure("gemini", &provider.name, provider.level);
                        if ctx
                            .state
                            .blacklist
                            .is_blacklisted("gemini", &provider.name)
                            .is_some()
                        {
                            break;
                        }
                        if retry_index + 1 < retry_cfg.failure_threshold
                            && retry_cfg.retry_wait_seconds > 0
                        {
                            tokio::time::sleep(Duration::from_secs(retry_cfg.retry_wait_seconds))
                                .await;
                        }
                    }
                }
            }
        }
    }

    let status = last_upstream_status(&last_error);
    ctx.write_failure_row(guard, &last_provider, status);
    errors::all_failed_blacklist_retry(total_attempts, &last_provider, &last_error)
}

/// `GET /v1/models` (and the custom-tool variant): forward to the single
/// preferred provider — lowest level, first in user order.
pub(crate) async fn models_proxy(
    state: Arc<GatewayAppState>,
    dialect: Dialect,
    req: Request<Body>,
) -> Response {
    const MODELS_ENDPOINT: &str = "/v1/models";
    const MODELS_DEADLINE: Duration = Duration::from_secs(30);
    const MAX_MODELS_BODY: usize = 2 * 1024 * 1024;

    let platform = dialect.platform_key();
    let headers = req.headers().clone();

    let providers = match state.providers.load(&platform) {
        Ok(providers) => providers,
        Err(err) => {
            tracing::error!(platform = %platform, "failed to load providers: {err}");
            return errors::internal_error("failed to load providers");
        }
    };

    let mut active: Vec<Provider> = providers
        .into_iter()
        .filter(|p| p.enabled && !p.api_url.is_empty() && !p.api_key.is_empty())
        .filter(|p| p.validate().is_empty())
        .collect();
    active.sort_by_key(|p| p.level.max(1));

    let Some(provider) = active.into_iter().next() else {
        return errors::no_candidates("", 0);
    };

    let url = match build_target_url(&provider.api_url, MODELS_ENDPOINT, &[]) {
        Ok(url) => url,
        Err(err) => return errors::internal_error(err),
    };

    let auth_style = detect_auth_style(&headers, dialect.default_auth_style());
    let outbound = build_forward_headers(&headers, Some(&provider), auth_style, &dialect);

    let response = match send_with_retry(
        &state.client,
        reqwest::Method::GET,
        url,
        outbound,
        Bytes::new(),
        MODELS_DEADLINE,
    )
    .await
    {
        Ok(response) => response,
        Err(err) => {
            return errors::internal_error(format!("models request failed: {err}"));
        }
    };

    let status = response.status();
    let mut response_headers = response.headers().clone();
    strip_hop_headers(&mut response_headers);

    let body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => return errors::internal_error(format!("failed to read models body: {err}")),
    };
    if body.len() > MAX_MODELS_BODY {
        return errors::internal_error("models response too large");
    }

    let mut builder = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(body)).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response build error").into_response()
    })
}


#[cfg(test)]
mod relay_tests {
    use super::*;
    use crate::app::notice::Notifier;
    use crate::domain::providers::ProviderStore;
    use crate::gateway::affinity::AffinityCache;
    use crate::gateway::last_used::LastUsedRegistry;
    use crate::gateway::selector::RoundRobinState;
    use crate::gateway::util::{affinity_key, hash_api_key};
    use crate::infra::blacklist::BlacklistStore;
    use crate::infra::request_details::RequestDetailCache;
    use crate::infra::settings::SettingsStore;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "aio-relay-proxy-{tag}-{}-{}",
            std::process::id(),
            crate::shared::time::now_unix_millis()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn test_state(dir: &PathBuf) -> (Arc<GatewayAppState>, mpsc::Receiver<RequestLogInsert>) {
        let settings = SettingsStore::new(dir);
        let notifier = Arc::new(Notifier::new(Duration::ZERO));
        let blacklist = Arc::new(BlacklistStore::new(settings.clone(), notifier.clone()));
        let (log_tx, log_rx) = mpsc::channel(64);

        let state = Arc::new(GatewayAppState {
            settings,
            providers: ProviderStore::new(dir),
            blacklist,
            affinity: Arc::new(AffinityCache::new(Duration::from_secs(300))),
            round_robin: RoundRobinState::new(),
            last_used: LastUsedRegistry::new(),
            notifier,
            details: Arc::new(RequestDetailCache::new(8)),
            log_tx,
            client: crate::gateway::http_client::shared_client().clone(),
        });
        (state, log_rx)
    }

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Minimal HTTP/1.1 upstream: reads one full request, answers with a fixed
    /// status and JSON body, then closes the connection.
    async fn mock_upstream(
        status_line: &'static str,
        content_type: &'static str,
        body: &'static str,
    ) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let base_url = format!("http://{}", listener.local_addr().expect("addr"));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_server = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let hits = hits_for_server.clone();
                tokio::spawn(async move {
                    hits.fetch_add(1, Ordering::SeqCst);

                    let mut data = Vec::new();
                    let mut tmp = [0u8; 4096];
                    loop {
                        if let Some(pos) = find_subslice(&data, b"\r\n\r\n") {
                            let head = String::from_utf8_lossy(&data[..pos]).to_ascii_lowercase();
                            let content_length = head
                                .lines()
                                .find_map(|line| line.strip_prefix("content-length:"))
                                .and_then(|v| v.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            if data.len() >= pos + 4 + content_length {
                                break;
                            }
                        }
                        match socket.read(&mut tmp).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => data.extend_from_slice(&tmp[..n]),
                        }
                    }

                    let response = format!(
                        "HTTP/1.1 {status_line}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (base_url, hits)
    }

    fn write_providers(dir: &PathBuf, providers_json: String) {
        std::fs::write(dir.join("providers.json"), providers_json).expect("write providers");
    }

    fn messages_request() -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("x-api-key", "client-key")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"model":"claude-haiku-4-5","messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .expect("request")
    }

    #[tokio::test]
    async fn simple_success_relays_body_and_logs_usage() {
        let dir = temp_dir("s1");
        let (upstream, hits) = mock_upstream(
            "200 OK",
            "application/json",
            r#"{"content":[{"type":"text","text":"hello"}],"usage":{"input_tokens":10,"output_tokens":5}}"#,
        )
        .await;
        write_providers(
            &dir,
            format!(
                r#"{{"claude":[{{"name":"A","apiURL":"{upstream}","apiKey":"k1","enabled":true,"level":1}}]}}"#
            ),
        );

        let (state, mut log_rx) = test_state(&dir);
        let resp = relay_proxy(state.clone(), Dialect::Claude, messages_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 1 << 20)
            .await
            .expect("body");
        let value: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["usage"]["input_tokens"], 10);

        let row = log_rx.recv().await.expect("row");
        assert_eq!(row.provider, "A");
        assert_eq!(row.http_code, 200);
        assert_eq!(row.input_tokens, 10);
        assert_eq!(row.output_tokens, 5);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Success pinned the affinity entry and recorded the success.
        let key = affinity_key(&hash_api_key("client-key"), "claude", "claude-haiku-4-5");
        assert_eq!(state.affinity.get(&key).as_deref(), Some("A"));
        assert_eq!(
            state.last_used.get("claude").expect("last used").provider_name,
            "A"
        );
    }

    #[tokio::test]
    async fn failover_tries_next_provider_after_first_failure() {
        let dir = temp_dir("s2");
        let (bad, bad_hits) = mock_upstream("500 Internal Server Error", "application/json", r#"{"error":"boom"}"#).await;
        let (good, good_hits) = mock_upstream(
            "200 OK",
            "application/json",
            r#"{"content":[],"usage":{"input_tokens":3,"output_tokens":2}}"#,
        )
        .await;
        write_providers(
            &dir,
            format!(
                r#"{{"claude":[
                    {{"name":"A","apiURL":"{bad}","apiKey":"k1","enabled":true,"level":1}},
                    {{"name":"B","apiURL":"{good}","apiKey":"k2","enabled":true,"level":1}}
                ]}}"#
            ),
        );

        let (state, mut log_rx) = test_state(&dir);
        let resp = relay_proxy(state.clone(), Dialect::Claude, messages_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let _ = axum::body::to_bytes(resp.into_body(), 1 << 20).await.expect("body");

        assert_eq!(bad_hits.load(Ordering::SeqCst), 1);
        assert_eq!(good_hits.load(Ordering::SeqCst), 1);

        // One failure recorded for A, B reset to zero.
        assert_eq!(
            state.blacklist.entry("claude", "A").expect("A entry").failure_count,
            1
        );
        assert_eq!(
            state.blacklist.entry("claude", "B").expect("B entry").failure_count,
            0
        );

        let key = affinity_key(&hash_api_key("client-key"), "claude", "claude-haiku-4-5");
        assert_eq!(state.affinity.get(&key).as_deref(), Some("B"));

        let row = log_rx.recv().await.expect("row");
        assert_eq!(row.provider, "B");
        assert_eq!(row.http_code, 200);
    }

    #[tokio::test]
    async fn blacklist_retry_mode_hammers_then_rotates() {
        let dir = temp_dir("s3");
        std::fs::write(
            dir.join("settings.json"),
            br#"{"blacklist":{"enabled":true,"failureThreshold":3,"retryWaitSeconds":0}}"#,
        )
        .expect("write settings");

        let (a, a_hits) = mock_upstream("502 Bad Gateway", "application/json", r#"{"error":"down"}"#).await;
        let (b, b_hits) = mock_upstream("502 Bad Gateway", "application/json", r#"{"error":"down"}"#).await;
        write_providers(
            &dir,
            format!(
                r#"{{"claude":[
                    {{"name":"A","apiURL":"{a}","apiKey":"k1","enabled":true,"level":1}},
                    {{"name":"B","apiURL":"{b}","apiKey":"k2","enabled":true,"level":1}}
                ]}}"#
            ),
        );

        let (state, mut log_rx) = test_state(&dir);
        let resp = relay_proxy(state.clone(), Dialect::Claude, messages_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let body = axum::body::to_bytes(resp.into_body(), 1 << 20)
            .await
            .expect("body");
        let value: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["mode"], "blacklist_retry");
        assert_eq!(value["totalAttempts"], 6);
        assert_eq!(value["lastProvider"], "B");

        // Exactly threshold calls per provider, both suspended afterwards.
        assert_eq!(a_hits.load(Ordering::SeqCst), 3);
        assert_eq!(b_hits.load(Ordering::SeqCst), 3);
        assert!(state.blacklist.is_blacklisted("claude", "A").is_some());
        assert!(state.blacklist.is_blacklisted("claude", "B").is_some());

        // The all-failed path still produces exactly one log row.
        let row = log_rx.recv().await.expect("row");
        assert_eq!(row.http_code, 502);
        assert_eq!(row.provider, "B");
        assert!(log_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_candidates_is_404_with_skip_diagnostics() {
        let dir = temp_dir("404");
        write_providers(
            &dir,
            r#"{"claude":[{"name":"A","apiURL":"https://a.example","apiKey":"k1","enabled":true,"supportedModels":["other-model"]}]}"#.to_string(),
        );

        let (state, _log_rx) = test_state(&dir);
        let resp = relay_proxy(state, Dialect::Claude, messages_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(resp.into_body(), 1 << 20)
            .await
            .expect("body");
        let value: Value = serde_json::from_slice(&body).expect("json");
        let message = value["error"].as_str().expect("message");
        assert!(message.contains("claude-haiku-4-5"));
        assert!(message.contains('1'));
    }

    #[tokio::test]
    async fn affinity_provider_is_tried_first_and_invalidated_on_failure() {
        let dir = temp_dir("s4");
        let (bad, bad_hits) = mock_upstream("500 Internal Server Error", "application/json", r#"{"error":"x"}"#).await;
        let (good, good_hits) = mock_upstream(
            "200 OK",
            "application/json",
            r#"{"content":[],"usage":{"input_tokens":1,"output_tokens":1}}"#,
        )
        .await;
        write_providers(
            &dir,
            format!(
                r#"{{"claude":[
                    {{"name":"A","apiURL":"{good}","apiKey":"k1","enabled":true,"level":1}},
                    {{"name":"B","apiURL":"{bad}","apiKey":"k2","enabled":true,"level":1}}
                ]}}"#
            ),
        );

        let (state, mut log_rx) = test_state(&dir);
        // Pin the affinity to B (the failing provider) even though A is first
        // in config order.
        let key = affinity_key(&hash_api_key("client-key"), "claude", "claude-haiku-4-5");
        state.affinity.set(&key, "B");

        let resp = relay_proxy(state.clone(), Dialect::Claude, messages_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let _ = axum::body::to_bytes(resp.into_body(), 1 << 20).await.expect("body");

        // B (cached) went first and failed once; A succeeded after.
        assert_eq!(bad_hits.load(Ordering::SeqCst), 1);
        assert_eq!(good_hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            state.blacklist.entry("claude", "B").expect("B entry").failure_count,
            1
        );
        assert_eq!(state.affinity.get(&key).as_deref(), Some("A"));

        let row = log_rx.recv().await.expect("row");
        assert_eq!(row.provider, "A");
    }

    #[tokio::test]
    async fn gemini_stream_relays_sse_and_records_cumulative_usage() {
        let dir = temp_dir("gemini-sse");
        let (upstream, hits) = mock_upstream(
            "200 OK",
            "text/event-stream",
            "data: {\"usageMetadata\":{\"promptTokenCount\":50,\"candidatesTokenCount\":5}}\n\ndata: {\"usageMetadata\":{\"promptTokenCount\":50,\"candidatesTokenCount\":25}}\n\n",
        )
        .await;
        write_providers(
            &dir,
            format!(
                r#"{{"gemini":[{{"name":"G","baseURL":"{upstream}","apiKey":"gk","enabled":true,"level":1,"model":"gemini-2.5-pro"}}]}}"#
            ),
        );

        let (state, mut log_rx) = test_state(&dir);
        let req = Request::builder()
            .method("POST")
            .uri("/gemini/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse")
            .header("x-goog-api-key", "client-key")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"contents":[{"parts":[{"text":"hi"}]}]}"#))
            .expect("request");

        let resp = gemini_proxy(
            state.clone(),
            "/v1beta",
            "models/gemini-2.5-pro:streamGenerateContent".to_string(),
            req,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 1 << 20)
            .await
            .expect("body");
        let text = std::str::from_utf8(&body).expect("utf8");
        assert_eq!(text.matches("usageMetadata").count(), 2, "stream relayed verbatim");

        let row = log_rx.recv().await.expect("row");
        assert_eq!(row.platform, "gemini");
        assert_eq!(row.provider, "G");
        assert_eq!(row.model, "gemini-2.5-pro");
        assert!(row.is_stream);
        // Cumulative totals merge by maximum, not by sum.
        assert_eq!(row.input_tokens, 50);
        assert_eq!(row.output_tokens, 25);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(state.blacklist.entry("gemini", "G").is_some_and(|e| e.failure_count == 0));
    }
}
