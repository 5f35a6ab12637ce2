//! Usage: Gateway wiring: shared state, axum routes, and the serve loop.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::Request;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::app::notice::Notifier;
use crate::domain::providers::ProviderStore;
use crate::gateway::affinity::AffinityCache;
use crate::gateway::dialect::Dialect;
use crate::gateway::last_used::LastUsedRegistry;
use crate::gateway::proxy;
use crate::gateway::selector::RoundRobinState;
use crate::infra::blacklist::BlacklistStore;
use crate::infra::request_details::{RequestDetailCache, DEFAULT_CACHE_CAPACITY};
use crate::infra::request_logs::{self, RequestLogInsert};
use crate::infra::settings::SettingsStore;
use crate::infra::{app_paths, db::Db};

pub(crate) struct GatewayAppState {
    pub settings: SettingsStore,
    pub providers: ProviderStore,
    pub blacklist: Arc<BlacklistStore>,
    pub affinity: Arc<AffinityCache>,
    pub round_robin: RoundRobinState,
    pub last_used: LastUsedRegistry,
    pub notifier: Arc<Notifier>,
    pub details: Arc<RequestDetailCache>,
    pub log_tx: mpsc::Sender<RequestLogInsert>,
    pub client: reqwest::Client,
}

pub(crate) fn build_router(state: Arc<GatewayAppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(claude_messages))
        .route("/responses", post(codex_responses))
        .route("/v1/models", get(claude_models))
        .route("/gemini/v1beta/{*rest}", post(gemini_v1beta))
        .route("/gemini/v1/{*rest}", post(gemini_v1))
        .route("/custom/{tool_id}/v1/messages", post(custom_messages))
        .route("/custom/{tool_id}/v1/models", get(custom_models))
        .with_state(state)
}

async fn claude_messages(
    State(state): State<Arc<GatewayAppState>>,
    req: Request<Body>,
) -> Response {
    proxy::relay_proxy(state, Dialect::Claude, req).await
}

async fn codex_responses(
    State(state): State<Arc<GatewayAppState>>,
    req: Request<Body>,
) -> Response {
    proxy::relay_proxy(state, Dialect::Codex, req).await
}

async fn custom_messages(
    State(state): State<Arc<GatewayAppState>>,
    Path(tool_id): Path<String>,
    req: Request<Body>,
) -> Response {
    proxy::relay_proxy(state, Dialect::Custom(tool_id), req).await
}

async fn claude_models(
    State(state): State<Arc<GatewayAppState>>,
    req: Request<Body>,
) -> Response {
    proxy::models_proxy(state, Dialect::Claude, req).await
}

async fn custom_models(
    State(state): State<Arc<GatewayAppState>>,
    Path(tool_id): Path<String>,
    req: Request<Body>,
) -> Response {
    proxy::models_proxy(state, Dialect::Custom(tool_id), req).await
}

async fn gemini_v1beta(
    State(state): State<Arc<GatewayAppState>>,
    Path(rest): Path<String>,
    req: Request<Body>,
) -> Response {
    proxy::gemini_proxy(state, "/v1beta", rest, req).await
}

async fn gemini_v1(
    State(state): State<Arc<GatewayAppState>>,
    Path(rest): Path<String>,
    req: Request<Body>,
) -> Response {
    proxy::gemini_proxy(state, "/v1", rest, req).await
}

/// Bootstrap everything and serve until the process is stopped.
pub async fn run() -> Result<(), String> {
    let data_dir = app_paths::data_dir()?;
    let db = Db::new(&data_dir);
    db.init()?;

    let settings_store = SettingsStore::new(&data_dir);
    settings_store.write_default_if_missing()?;
    let settings = settings_store.read();

    let notifier = Arc::new(Notifier::default());
    let (blacklist, _blacklist_writer) =
        BlacklistStore::with_persistence(db.clone(), settings_store.clone(), notifier.clone())?;
    let blacklist = Arc::new(blacklist);

    let (log_tx, _log_writer) = request_logs::start_buffered_writer(db);

    let affinity = Arc::new(AffinityCache::new(Duration::from_secs(
        settings.affinity_ttl_seconds,
    )));
    affinity.start_sweeper();

    let details = Arc::new(RequestDetailCache::new(DEFAULT_CACHE_CAPACITY));
    details.set_mode(settings.request_detail_mode);

    let providers = ProviderStore::new(&data_dir);
    providers.log_validation_warnings();

    let state = Arc::new(GatewayAppState {
        settings: settings_store,
        providers,
        blacklist,
        affinity: affinity.clone(),
        round_robin: RoundRobinState::new(),
        last_used: LastUsedRegistry::new(),
        notifier,
        details,
        log_tx,
        client: crate::gateway::http_client::shared_client().clone(),
    });

    let bind_host: IpAddr = settings
        .bind_host
        .parse()
        .map_err(|e| format!("invalid bind host {}: {e}", settings.bind_host))?;
    // The relay injects provider API keys into outbound requests; exposing it
    // beyond loopback would leak them to the LAN.
    if !bind_host.is_loopback() {
        return Err(format!(
            "refusing to bind non-loopback address {bind_host}; the relay must stay local"
        ));
    }

    let bind = format!("{}:{}", settings.bind_host, settings.preferred_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| format!("failed to bind {bind}: {e}"))?;
    tracing::info!("relay listening on {bind}");

    let router = build_router(state);
    let result = axum::serve(listener, router)
        .await
        .map_err(|e| format!("server error: {e}"));

    affinity.stop_sweeper();
    result
}

