use std::{env, net::SocketAddr, path::PathBuf, sync::Arc};

use crate::middleware::rate_limit::{rate_limit_layer, RateLimitConfig, USER_HEADER};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use hatch_pool::{
    load_templates, ClaimOptions, ErrorKind, EventType, ManagerConfig, PoolTemplate, Route,
    SandboxManager, TemplateDefaults,
};
use hatch_store::{
    LabelSelector, MemoryStore, SandboxRecord, SandboxStore, SqliteStore, Throttle, ThrottledStore,
};
use serde::{Deserialize, Serialize};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let store = build_store(&config).await?;
    let templates = load_pool_templates(&config)?;
    let manager = SandboxManager::new(store, templates, config.manager.clone());

    let state = Arc::new(AppState {
        manager: manager.clone(),
    });
    let app = build_router(state)
        .layer(rate_limit_layer(config.rate_limit.clone()))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(ConcurrencyLimitLayer::new(
            config.manager.ext_proc_max_concurrency,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;
    info!(addr = %config.listen_addr, "hatch-daemon listening");

    // The peer wire must answer before discovery greets the fleet.
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    manager
        .run(&config.peers)
        .await
        .context("manager startup failed")?;

    let result = server.await.context("HTTP server task panicked")?;
    manager.stop();
    result.context("HTTP server exited")?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/hello", get(hello))
        .route("/routes", put(put_route))
        .route("/api/v1/sandboxes/claim", post(claim_sandbox))
        .route("/api/v1/sandboxes", get(list_sandboxes))
        .route("/api/v1/sandboxes/:id", get(get_sandbox).delete(kill_sandbox))
        .route("/api/v1/sandboxes/:id/pause", post(pause_sandbox))
        .route("/api/v1/sandboxes/:id/resume", post(resume_sandbox))
        .route("/api/v1/sandboxes/:id/timers", post(set_timer))
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    manager: Arc<SandboxManager>,
}

/// Stamps requests that arrive without an `x-request-id`.
#[derive(Clone, Copy)]
struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(
        &mut self,
        _request: &axum::http::Request<B>,
    ) -> Option<RequestId> {
        let value = Uuid::new_v4().to_string().parse().ok()?;
        Some(RequestId::new(value))
    }
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    store_dsn: String,
    template_dir: PathBuf,
    peers: Vec<String>,
    manager: ManagerConfig,
    rate_limit: RateLimitConfig,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = env::var("HATCH_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8090".to_string())
            .parse()
            .context("invalid HATCH_API_ADDR")?;

        let store_dsn = env::var("HATCH_STORE_DSN").unwrap_or_else(|_| "memory://".to_string());

        let template_dir = env::var("HATCH_TEMPLATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./templates"));

        let peers = env::var("HATCH_PEERS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut manager = ManagerConfig::from_env();
        // Peers serve their route endpoints on the API listener.
        manager.proxy_port = listen_addr.port();

        Ok(Self {
            listen_addr,
            store_dsn,
            template_dir,
            peers,
            manager,
            rate_limit: RateLimitConfig::default(),
        })
    }
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn SandboxStore>> {
    let backend: Arc<dyn SandboxStore> = match config.store_dsn.as_str() {
        "memory://" | "memory" => Arc::new(MemoryStore::new()),
        dsn => Arc::new(
            SqliteStore::connect(dsn)
                .await
                .with_context(|| format!("failed to open store '{dsn}'"))?,
        ),
    };
    let throttle = Throttle::new(config.manager.store_qps, config.manager.store_burst);
    Ok(Arc::new(ThrottledStore::new(backend, throttle)))
}

fn load_pool_templates(config: &AppConfig) -> Result<Vec<PoolTemplate>> {
    if !config.template_dir.is_dir() {
        warn!(dir = %config.template_dir.display(), "template directory missing, starting with no pools");
        return Ok(Vec::new());
    }
    let defaults = TemplateDefaults {
        min_pool_size: config.manager.default_min_pool_size,
        max_pool_size_factor: config.manager.default_max_pool_size_factor,
    };
    let templates = load_templates(&config.template_dir, &defaults)
        .map_err(|err| anyhow::anyhow!("failed to load templates: {err}"))?;
    info!(count = templates.len(), "pool templates loaded");
    Ok(templates)
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    get,
    path = "/hello",
    responses((status = 200, description = "Ready to receive routes"))
)]
async fn hello() -> StatusCode {
    // Routes can be accepted as soon as the listener is up, which keeps
    // mutual peer discovery from deadlocking at fleet startup.
    StatusCode::OK
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Prometheus metrics", content_type = "text/plain"))
)]
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut body = String::new();
    body.push_str(&format!(
        "hatch_daemon_up 1\nhatch_routes {}\n",
        state.manager.routes().route_count()
    ));
    for pool in state.manager.pools() {
        let status = pool.status();
        let name = pool.name();
        body.push_str(&format!(
            "hatch_pool_replicas{{pool=\"{name}\"}} {}\n\
             hatch_pool_creating{{pool=\"{name}\"}} {}\n\
             hatch_pool_pending{{pool=\"{name}\"}} {}\n\
             hatch_pool_claimed{{pool=\"{name}\"}} {}\n",
            pool.replicas(),
            status.creating,
            status.pending,
            status.claimed,
        ));
    }
    (StatusCode::OK, body)
}

#[utoipa::path(
    put,
    path = "/routes",
    request_body = RouteBody,
    responses((status = 204, description = "Route upserted"))
)]
async fn put_route(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RouteBody>,
) -> StatusCode {
    state.manager.routes().set_route(body.into_route());
    StatusCode::NO_CONTENT
}

#[utoipa::path(
    post,
    path = "/api/v1/sandboxes/claim",
    request_body = ClaimBody,
    responses(
        (status = 200, description = "Sandbox claimed", body = SandboxResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 404, description = "Unknown template", body = ErrorBody),
        (status = 500, description = "No stock available", body = ErrorBody)
    )
)]
async fn claim_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ClaimBody>,
) -> Result<Json<SandboxResponse>, ApiError> {
    let user = require_user(&headers)?;
    let options = ClaimOptions {
        image: body.image,
        timeout_seconds: body.timeout_seconds,
        extra_headers: body.extra_headers.unwrap_or_default(),
        labels: body.labels.unwrap_or_default(),
    };
    let sandbox = state
        .manager
        .claim_sandbox(&user, &body.template, options)
        .await?;
    Ok(Json(SandboxResponse::from(sandbox.record())))
}

#[utoipa::path(
    get,
    path = "/api/v1/sandboxes",
    params(ListQuery),
    responses(
        (status = 200, description = "Claimed sandboxes owned by the caller", body = [SandboxResponse]),
        (status = 400, description = "Missing caller identity", body = ErrorBody)
    )
)]
async fn list_sandboxes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SandboxResponse>>, ApiError> {
    let user = require_user(&headers)?;
    let limit = query.limit.unwrap_or(100).min(1000) as usize;
    let mut selector = LabelSelector::new();
    if let Some(pool) = query.pool.as_deref() {
        selector = selector.with("pool", pool);
    }
    let records = state.manager.list_sandboxes(&user, limit, &selector);
    Ok(Json(records.iter().map(SandboxResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/api/v1/sandboxes/{id}",
    params(("id" = String, Path, description = "Sandbox identifier")),
    responses(
        (status = 200, description = "Sandbox details", body = SandboxResponse),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Not found or not claimed", body = ErrorBody)
    )
)]
async fn get_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SandboxResponse>, ApiError> {
    let user = require_user(&headers)?;
    let sandbox = state.manager.get_claimed_sandbox(&user, &id)?;
    Ok(Json(SandboxResponse::from(sandbox.record())))
}

#[utoipa::path(
    post,
    path = "/api/v1/sandboxes/{id}/pause",
    params(("id" = String, Path, description = "Sandbox identifier")),
    responses(
        (status = 200, description = "Sandbox paused", body = SandboxResponse),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Not found or not claimed", body = ErrorBody)
    )
)]
async fn pause_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SandboxResponse>, ApiError> {
    let user = require_user(&headers)?;
    let sandbox = state.manager.pause_sandbox(&user, &id).await?;
    Ok(Json(SandboxResponse::from(sandbox.record())))
}

#[utoipa::path(
    post,
    path = "/api/v1/sandboxes/{id}/resume",
    params(("id" = String, Path, description = "Sandbox identifier")),
    responses(
        (status = 200, description = "Sandbox resumed", body = SandboxResponse),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Not found or not claimed", body = ErrorBody)
    )
)]
async fn resume_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SandboxResponse>, ApiError> {
    let user = require_user(&headers)?;
    let sandbox = state.manager.resume_sandbox(&user, &id).await?;
    Ok(Json(SandboxResponse::from(sandbox.record())))
}

#[utoipa::path(
    delete,
    path = "/api/v1/sandboxes/{id}",
    params(("id" = String, Path, description = "Sandbox identifier")),
    responses(
        (status = 204, description = "Sandbox killed"),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Not found or not claimed", body = ErrorBody)
    )
)]
async fn kill_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user = require_user(&headers)?;
    state.manager.kill_sandbox(&user, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/sandboxes/{id}/timers",
    params(("id" = String, Path, description = "Sandbox identifier")),
    request_body = TimerBody,
    responses(
        (status = 204, description = "Timer armed"),
        (status = 400, description = "Invalid event or delay", body = ErrorBody),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Not found or not claimed", body = ErrorBody)
    )
)]
async fn set_timer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<TimerBody>,
) -> Result<StatusCode, ApiError> {
    let user = require_user(&headers)?;
    if body.event.trim().is_empty() {
        return Err(ApiError::bad_request("event name cannot be empty"));
    }
    let event = EventType::parse(&body.event)
        .ok_or_else(|| ApiError::bad_request(format!("unknown event '{}'", body.event)))?;
    state
        .manager
        .set_sandbox_timer(&user, &id, event, body.after_seconds)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request("missing x-hatch-user header"))
}

#[derive(Debug, Deserialize, ToSchema)]
struct ClaimBody {
    template: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<i64>,
    #[serde(default)]
    extra_headers: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default)]
    labels: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize, ToSchema)]
struct TimerBody {
    event: String,
    after_seconds: i64,
}

#[derive(Debug, Deserialize, IntoParams)]
struct ListQuery {
    limit: Option<u32>,
    pool: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
struct RouteBody {
    id: String,
    ip: String,
    #[serde(default)]
    owner: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    extra_headers: std::collections::BTreeMap<String, String>,
}

impl RouteBody {
    fn into_route(self) -> Route {
        Route {
            id: self.id,
            ip: self.ip,
            owner: self.owner,
            state: self.state,
            extra_headers: self.extra_headers,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct SandboxResponse {
    id: String,
    namespace: String,
    template: String,
    owner: String,
    state: String,
    phase: String,
    ip: String,
    ready: bool,
    paused: bool,
    access_token: String,
    lock_token: String,
}

impl From<&SandboxRecord> for SandboxResponse {
    fn from(record: &SandboxRecord) -> Self {
        Self {
            id: record.id.clone(),
            namespace: record.namespace.clone(),
            template: record.spec.template.clone(),
            owner: record.owner.clone(),
            state: record
                .state()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            phase: record.status.phase.to_string(),
            ip: record.status.ip.clone(),
            ready: record.ready(),
            paused: record.spec.paused,
            access_token: record.status.access_token.clone(),
            lock_token: record.lock_token.clone(),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<hatch_pool::Error> for ApiError {
    fn from(err: hatch_pool::Error) -> Self {
        let status = match err.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::NotAllowed => StatusCode::FORBIDDEN,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Internal | ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

pub mod docs {
    use super::*;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Hatch Daemon API", version = "0.1.0"),
        paths(
            healthz,
            metrics,
            hello,
            put_route,
            claim_sandbox,
            list_sandboxes,
            get_sandbox,
            pause_sandbox,
            resume_sandbox,
            kill_sandbox,
            set_timer
        ),
        components(schemas(
            ClaimBody,
            TimerBody,
            RouteBody,
            SandboxResponse,
            ErrorBody
        ))
    )]
    pub struct ApiDoc;
}
