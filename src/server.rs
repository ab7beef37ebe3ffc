//! HTTP API.
//!
//! # Endpoints
//!
//! | Method   | Path                                         | Description                      |
//! |----------|----------------------------------------------|----------------------------------|
//! | `POST`   | `/tenants/{tenant}/search`                   | Semantic search (cached)         |
//! | `POST`   | `/tenants/{tenant}/context`                  | Token-budgeted knowledge context |
//! | `POST`   | `/tenants/{tenant}/reindex`                  | Full rebuild from sources        |
//! | `POST`   | `/tenants/{tenant}/records`                  | Index or replace one record      |
//! | `DELETE` | `/tenants/{tenant}/entities/{type}/{id}`     | Drop one entity's documents      |
//! | `GET`    | `/tenants/{tenant}/stats`                    | Document counts                  |
//! | `GET`    | `/health`                                    | Health check (returns version)   |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "tenant id must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `timeout` (408),
//! `conflict` (409), `embedding_failed` (502), `embedding_unavailable` (503),
//! `internal` (500).
//!
//! Only one reindex per tenant runs at a time; a second request gets 409.
//! Removing an entity that has no documents succeeds with `removed: 0`.
//! Reindex, record and entity writes drop the tenant's cached searches.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use knowledge_harness_core::context::{get_context, KnowledgeContext};
use knowledge_harness_core::error::{EmbeddingError, SearchError, StoreError};
use knowledge_harness_core::models::{EntityType, SourceRecord, TenantId};
use knowledge_harness_core::search::{search, SearchRequest, SearchResponse};
use knowledge_harness_core::source::SourceRegistry;

use crate::cache::SearchCache;
use crate::config::Config;
use crate::reindex::{IndexError, IndexOutcome, ReindexReport, Reindexer};
use crate::source_json::json_sources;
use crate::sqlite_store::SqliteStore;
use crate::stats::{collect_stats, TenantStats};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<SqliteStore>,
    reindexer: Arc<Reindexer>,
    sources: Arc<SourceRegistry>,
    running: Arc<Mutex<HashSet<TenantId>>>,
    cache: Arc<SearchCache>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<SqliteStore>,
        reindexer: Reindexer,
        sources: SourceRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cache: Arc::new(SearchCache::from_config(&config.retrieval)),
            config: Arc::new(config),
            store,
            reindexer: Arc::new(reindexer),
            sources: Arc::new(sources),
            running: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    /// State wired from config: SQLite store, configured provider, JSON
    /// export sources.
    pub async fn from_config(config: &Config, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteStore::open(config).await?);
        let reindexer = Reindexer::from_config(config, store.clone())?;
        let sources = json_sources(&config.sources.root);
        Ok(Self::new(config.clone(), store, reindexer, sources, shutdown))
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tenants/{tenant}/search", post(handle_search))
        .route("/tenants/{tenant}/context", post(handle_context))
        .route("/tenants/{tenant}/reindex", post(handle_reindex))
        .route("/tenants/{tenant}/records", post(handle_index_record))
        .route(
            "/tenants/{tenant}/entities/{entity_type}/{entity_id}",
            delete(handle_remove_entity),
        )
        .route("/tenants/{tenant}/stats", get(handle_stats))
        .layer(cors)
        .with_state(state)
}

/// `kh serve`: bind `[server].bind` and serve until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let state = AppState::from_config(config, shutdown.clone()).await?;
    let store = state.store.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("Knowledge server listening on http://{}", config.server.bind);
    info!(bind = %config.server.bind, "server started");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
            signal.cancel();
        })
        .await?;

    store.pool().close().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EmbeddingError> for AppError {
    fn from(e: EmbeddingError) -> Self {
        let message = e.to_string();
        match e {
            EmbeddingError::EmptyInput => Self::bad_request(message),
            EmbeddingError::Timeout(_) => Self::new(StatusCode::REQUEST_TIMEOUT, "timeout", message),
            EmbeddingError::Unavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "embedding_unavailable", message)
            }
            EmbeddingError::DimensionMismatch { .. } | EmbeddingError::Provider(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "embedding_failed", message)
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<SearchError> for AppError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::Embedding(e) => e.into(),
            SearchError::Store(e) => e.into(),
        }
    }
}

impl From<IndexError> for AppError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Normalize(e) => Self::bad_request(e.to_string()),
            IndexError::Embedding(e) => e.into(),
            IndexError::Store(e) => e.into(),
        }
    }
}

fn parse_tenant(raw: &str) -> Result<TenantId, AppError> {
    TenantId::new(raw).map_err(|e| AppError::bad_request(e.to_string()))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /tenants/{tenant}/search ============

fn validate_search(req: &SearchRequest) -> Result<(), AppError> {
    if let Some(m) = req.min_relevance {
        if !(0.0..=1.0).contains(&m) {
            return Err(AppError::bad_request("min_relevance must be in [0.0, 1.0]"));
        }
    }
    if req.limit == Some(0) {
        return Err(AppError::bad_request("limit must be at least 1"));
    }
    Ok(())
}

async fn handle_search(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let tenant = parse_tenant(&tenant)?;
    validate_search(&req)?;

    if let Some(cached) = state.cache.get(&tenant, &req) {
        return Ok(Json(cached));
    }
    let response = search(
        state.store.as_ref(),
        state.reindexer.provider().as_ref(),
        &tenant,
        &req,
        &state.config.retrieval.search_options(),
    )
    .await?;
    state.cache.put(&tenant, &req, &response);
    Ok(Json(response))
}

// ============ POST /tenants/{tenant}/context ============

#[derive(Deserialize)]
struct ContextRequest {
    #[serde(flatten)]
    search: SearchRequest,
    #[serde(default)]
    max_tokens: Option<usize>,
}

async fn handle_context(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(req): Json<ContextRequest>,
) -> Result<Json<KnowledgeContext>, AppError> {
    let tenant = parse_tenant(&tenant)?;
    validate_search(&req.search)?;
    if req.max_tokens == Some(0) {
        return Err(AppError::bad_request("max_tokens must be at least 1"));
    }

    let context = get_context(
        state.store.as_ref(),
        state.reindexer.provider().as_ref(),
        &tenant,
        &req.search,
        &state.config.retrieval.search_options(),
        req.max_tokens
            .unwrap_or(state.config.retrieval.context_max_tokens),
    )
    .await?;
    Ok(Json(context))
}

// ============ POST /tenants/{tenant}/reindex ============

/// Removes the tenant from the running set when the reindex ends.
struct RunningGuard {
    running: Arc<Mutex<HashSet<TenantId>>>,
    tenant: TenantId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.tenant);
        }
    }
}

async fn handle_reindex(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<ReindexReport>, AppError> {
    let tenant = parse_tenant(&tenant)?;

    let _guard = {
        let mut running = state
            .running
            .lock()
            .map_err(|_| AppError::internal("reindex registry poisoned"))?;
        if !running.insert(tenant.clone()) {
            return Err(AppError::new(
                StatusCode::CONFLICT,
                "conflict",
                format!("reindex already running for tenant {}", tenant),
            ));
        }
        RunningGuard {
            running: state.running.clone(),
            tenant: tenant.clone(),
        }
    };

    let cancel = state.shutdown.child_token();
    let report = state
        .reindexer
        .reindex(&tenant, &state.sources, &cancel)
        .await;
    state.cache.invalidate(&tenant);
    Ok(Json(report?))
}

// ============ POST /tenants/{tenant}/records ============

async fn handle_index_record(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(record): Json<SourceRecord>,
) -> Result<Json<IndexOutcome>, AppError> {
    let tenant = parse_tenant(&tenant)?;
    if record.entity_id.trim().is_empty() {
        return Err(AppError::bad_request("entity_id must not be empty"));
    }
    let outcome = state.reindexer.index_record(&tenant, record).await;
    state.cache.invalidate(&tenant);
    Ok(Json(outcome?))
}

// ============ DELETE /tenants/{tenant}/entities/{type}/{id} ============

#[derive(Serialize)]
struct RemoveResponse {
    removed: u64,
}

async fn handle_remove_entity(
    State(state): State<AppState>,
    Path((tenant, entity_type, entity_id)): Path<(String, String, String)>,
) -> Result<Json<RemoveResponse>, AppError> {
    let tenant = parse_tenant(&tenant)?;
    let entity_type: EntityType = entity_type
        .parse()
        .map_err(|e: knowledge_harness_core::models::UnknownEntityType| {
            AppError::bad_request(e.to_string())
        })?;

    let removed = state
        .reindexer
        .remove_entity(&tenant, entity_type, &entity_id)
        .await;
    state.cache.invalidate(&tenant);
    Ok(Json(RemoveResponse { removed: removed? }))
}

// ============ GET /tenants/{tenant}/stats ============

async fn handle_stats(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<TenantStats>, AppError> {
    let tenant = parse_tenant(&tenant)?;
    let stats = collect_stats(&state.store, &tenant)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(Json(stats))
}
