//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | `POST` | `/query` | yes | Answer a question from the indexed corpus |
//! | `POST` | `/ingest` | yes | Ingest one document (inline base64 or a corpus path) |
//! | `GET`  | `/stats` | yes | Index size, model and health |
//! | `GET`  | `/health` | no | Liveness plus index and generation backend status |
//!
//! # Error Contract
//!
//! Every non-2xx response has the same shape:
//!
//! ```json
//! { "error": { "code": "injection_detected", "message": "input rejected by security gate (rule: override:0)" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `invalid_query`, `injection_detected`, `path_traversal` | 400 |
//! | `unauthorized` | 401 |
//! | `forbidden` | 403 |
//! | `not_found` | 404 |
//! | `source_conflict` | 409 |
//! | `extraction_error` | 422 |
//! | `embedding_backend_error`, `generation_backend_error` | 502 |
//! | `empty_index`, `backpressure`, `index_corrupted` | 503 |
//! | `backend_timeout`, `deadline_exceeded` | 504 |
//! | `internal` | 500 |
//!
//! A `backend_timeout` body also carries the degraded answer under `answer`.
//!
//! # Authentication
//!
//! When `[server].require_api_key` is set, requests must send one of the keys
//! from `SENTINEL_API_KEYS` in the `X-API-Key` header.
//!
//! # CORS
//!
//! Only the origins listed in `[server].cors_origins` are allowed.
//!
//! # Ingestion trust
//!
//! Inline uploads (`content_base64`) always pass the document deny-list
//! unless the operator sets `[server].trust_uploads`. Requests cannot set
//! their own trust level. A request without `content_base64` reads a file
//! that is already in the corpus and is treated like `sentinel ingest`.
//!
//! Inline uploads are indexed but never written to disk, so
//! `sentinel rebuild` drops them. Place the file under the corpus root to
//! keep it across rebuilds.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use tracing::Level;

use crate::config::{Config, ServerConfig};
use crate::error::RagError;
use crate::generation::BackendStatus;
use crate::index::{IndexHealth, IndexStats};
use crate::models::{Answer, Deadline, DegradeReason, RetrievedChunk};
use crate::pipeline::{IngestMetadata, IngestOutcome, RagPipeline};

const API_KEY_HEADER: &str = "x-api-key";
const MAX_INGEST_BODY_BYTES: usize = 32 * 1024 * 1024;
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct AppState {
    pipeline: Arc<RagPipeline>,
    request_timeout: Duration,
    trust_uploads: bool,
}

#[derive(Clone)]
struct AuthState {
    keys: Arc<Vec<String>>,
}

/// Build the pipeline from `config` and serve until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let keys = config.api_keys();
    if config.server.require_api_key && keys.is_empty() {
        anyhow::bail!(
            "server.require_api_key is set but {} is empty",
            crate::config::API_KEYS_ENV
        );
    }

    let pipeline = Arc::new(RagPipeline::from_config(config).await?);
    let app = router(pipeline, &config.server, keys)?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

/// Assemble the router. `api_keys` is only consulted when
/// `server.require_api_key` is set.
pub fn router(
    pipeline: Arc<RagPipeline>,
    server: &ServerConfig,
    api_keys: Vec<String>,
) -> anyhow::Result<Router> {
    let state = AppState {
        pipeline,
        request_timeout: Duration::from_millis(server.request_timeout_ms),
        trust_uploads: server.trust_uploads,
    };

    let mut protected = Router::new()
        .route("/query", post(handle_query))
        .route(
            "/ingest",
            post(handle_ingest).layer(DefaultBodyLimit::max(MAX_INGEST_BODY_BYTES)),
        )
        .route("/stats", get(handle_stats));
    if server.require_api_key {
        protected = protected.layer(middleware::from_fn_with_state(
            AuthState {
                keys: Arc::new(api_keys),
            },
            require_api_key,
        ));
    }

    let app = Router::new()
        .route("/health", get(handle_health))
        .merge(protected)
        .fallback(|| async { AppError::new(StatusCode::NOT_FOUND, "not_found", "no such route") })
        .with_state(state)
        .layer(cors_layer(&server.cors_origins)?)
        .layer(
            TraceLayer::new_for_http().on_response(
                DefaultOnResponse::new()
                    .level(Level::INFO)
                    .latency_unit(LatencyUnit::Millis),
            ),
        );
    Ok(app)
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o).map_err(|_| anyhow::anyhow!("invalid CORS origin: {}", o))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(API_KEY_HEADER)]))
}

async fn require_api_key(State(auth): State<AuthState>, request: Request, next: Next) -> Response {
    let Some(presented) = request.headers().get(API_KEY_HEADER) else {
        return AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing X-API-Key header")
            .into_response();
    };
    let presented = presented.as_bytes();
    if !auth.keys.iter().any(|k| constant_time_eq(k.as_bytes(), presented)) {
        tracing::warn!(path = %request.uri().path(), "rejected invalid API key");
        return AppError::new(StatusCode::FORBIDDEN, "forbidden", "invalid API key").into_response();
    }
    next.run(request).await
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    answer: Option<QueryResponse>,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    answer: Option<QueryResponse>,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            answer: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
            answer: self.answer,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = match &err {
            RagError::InjectionDetected { .. }
            | RagError::PathTraversal(_)
            | RagError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            RagError::SourceConflict { .. } => StatusCode::CONFLICT,
            RagError::EmptyIndex | RagError::Backpressure | RagError::IndexCorrupted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RagError::BackendTimeout(_) | RagError::DeadlineExceeded(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            RagError::EmbeddingBackend(_) | RagError::GenerationBackend(_) => {
                StatusCode::BAD_GATEWAY
            }
            RagError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RagError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return AppError::new(StatusCode::NOT_FOUND, "not_found", "file not found");
            }
            RagError::InvalidConfiguration(_)
            | RagError::Storage(_)
            | RagError::Io(_)
            | RagError::Internal(_) => {
                tracing::error!(code = err.code(), error = %err, "request failed");
                return AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal error",
                );
            }
        };
        AppError::new(status, err.code(), err.to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::new(StatusCode::BAD_REQUEST, "invalid_query", rejection.body_text())
    }
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    text: String,
}

#[derive(Serialize)]
struct QueryResponse {
    request_id: String,
    answer_text: String,
    citations: Vec<String>,
    confidence: f64,
    grounded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    degraded: Option<DegradeReason>,
    sources: Vec<RetrievedChunk>,
}

impl QueryResponse {
    fn new(request_id: String, answer: &Answer, sources: Vec<RetrievedChunk>) -> Self {
        Self {
            request_id,
            answer_text: answer.text().to_string(),
            citations: answer.citations().to_vec(),
            confidence: answer.confidence_score(),
            grounded: answer.grounded(),
            degraded: answer.degraded_reason(),
            sources,
        }
    }
}

async fn handle_query(
    State(state): State<AppState>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(req) = body?;
    let outcome = state
        .pipeline
        .query(&req.text, Deadline::after(state.request_timeout))
        .await?;

    let response = QueryResponse::new(
        outcome.request_id,
        &outcome.answer,
        outcome.retrieval.hits,
    );
    if outcome.answer.degraded_reason() == Some(DegradeReason::BackendTimeout) {
        return Err(AppError {
            answer: Some(response),
            ..AppError::from(RagError::BackendTimeout(
                outcome.answer.timeout_budget_ms().unwrap_or_default()
            ))
        });
    }
    Ok(Json(response))
}

// ============ POST /ingest ============

/// Body of `POST /ingest`. Unknown fields, including `trusted`, are
/// ignored.
#[derive(Deserialize)]
struct IngestRequest {
    origin_path: String,
    #[serde(default)]
    content_base64: Option<String>,
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    effective_date: Option<NaiveDate>,
    #[serde(default)]
    title: Option<String>,
}

impl IngestRequest {
    fn metadata(&self, trusted: bool) -> IngestMetadata {
        IngestMetadata {
            source_id: self.source_id.clone(),
            version: self.version,
            effective_date: self.effective_date,
            title: self.title.clone(),
            trusted,
        }
    }
}

async fn handle_ingest(
    State(state): State<AppState>,
    body: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<IngestOutcome>, AppError> {
    let Json(req) = body?;
    let outcome = match &req.content_base64 {
        Some(encoded) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| {
                    AppError::new(
                        StatusCode::BAD_REQUEST,
                        "invalid_query",
                        format!("content_base64 is not valid base64: {}", e),
                    )
                })?;
            state
                .pipeline
                .ingest(&bytes, &req.origin_path, req.metadata(state.trust_uploads))
                .await?
        }
        None => {
            state
                .pipeline
                .ingest_path(&req.origin_path, req.metadata(true))
                .await?
        }
    };
    Ok(Json(outcome))
}

// ============ GET /stats ============

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    index: IndexStats,
    generation_backend: String,
    generation_permits_available: usize,
}

async fn handle_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let composer = state.pipeline.composer();
    Json(StatsResponse {
        index: state.pipeline.stats(),
        generation_backend: composer.backend().name().to_string(),
        generation_permits_available: composer.available_permits(),
    })
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// `ok` when the index is healthy and non-empty and generation is
    /// reachable, `degraded` otherwise.
    status: &'static str,
    version: &'static str,
    index: IndexHealth,
    documents: usize,
    chunks: usize,
    generation: BackendStatus,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.pipeline.stats();
    let backend = state.pipeline.composer().backend().clone();
    let generation = tokio::time::timeout(HEALTH_PROBE_TIMEOUT, backend.status())
        .await
        .unwrap_or_else(|_| BackendStatus::Unavailable("health probe timed out".into()));

    let ok = stats.health.is_healthy()
        && stats.chunks > 0
        && generation == BackendStatus::Available;
    Json(HealthResponse {
        status: if ok { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        index: stats.health,
        documents: stats.documents,
        chunks: stats.chunks,
        generation,
    })
}
