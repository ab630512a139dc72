//! HTTP API over the retrieval and completion pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/vault/scan` | Scan a vault, newest documents first |
//! | `GET`  | `/api/vault/read?id=&vault_path=` | Read one document |
//! | `POST` | `/api/rag` | Semantic search over indexed excerpts |
//! | `POST` | `/api/chat` | Retrieve context and stream a model answer |
//!
//! # Error Contract
//!
//! Every failure is returned as:
//!
//! ```json
//! { "error": { "code": "path_traversal", "message": "Path escapes the vault root", "status": 400 } }
//! ```
//!
//! Messages never carry absolute filesystem paths. See [`crate::error`] for
//! the full code table.
//!
//! # Chat streaming
//!
//! `/api/chat` answers with `text/plain; charset=utf-8` and streams tokens as
//! they arrive. Response headers describe the context used:
//!
//! - `x-request-id`: per-request id, also present in the logs
//! - `x-context-source`: `selection`, `semantic`, `lexical` or `placeholder`
//! - `x-context-degraded`: `false`, or the reason retrieval degraded
//!
//! Validation runs before any I/O. Retrieval plus stream setup is bounded by
//! `[server].request_timeout_secs`; tokens in flight are not.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query as UrlQuery, State,
    },
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::completion::CompletionStreamer;
use crate::config::Config;
use crate::dedup::{signature, RequestDeduplicator};
use crate::error::{Result, VaultError};
use crate::models::{decode_id, DocumentContent, DocumentRecord, Query, VectorHit};
use crate::path_guard;
use crate::prompt;
use crate::retrieval::{RetrievalOrchestrator, RetrievalRequest};
use crate::scanner::{self, ScanLimits};
use crate::semantic::{self, SemanticBackend};

const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const X_CONTEXT_SOURCE: HeaderName = HeaderName::from_static("x-context-source");
const X_CONTEXT_DEGRADED: HeaderName = HeaderName::from_static("x-context-degraded");

const MAX_RAG_MATCHES: usize = 50;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    orchestrator: Arc<RetrievalOrchestrator>,
    /// Credential problems are found once at startup and replayed per request.
    completion: Arc<Result<CompletionStreamer>>,
    scans: Arc<RequestDeduplicator<Vec<DocumentRecord>>>,
}

impl AppState {
    pub fn new(
        config: Config,
        semantic: SemanticBackend,
        completion: Result<CompletionStreamer>,
    ) -> Result<Self> {
        let limits = ScanLimits::from_config(&config.vault)?;
        let orchestrator = RetrievalOrchestrator::new(limits, config.retrieval.clone(), semantic);
        Ok(Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
            completion: Arc::new(completion),
            scans: Arc::new(RequestDeduplicator::new()),
        })
    }

    /// Build providers from configuration. A missing completion credential
    /// does not stop the server; chat requests report it instead.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let semantic = SemanticBackend::from_config(config)?;
        let completion = CompletionStreamer::new(&config.completion);
        if let Err(e) = &completion {
            warn!(error = %e, "completion disabled; chat requests will fail");
        }
        Ok(Self::new(config.clone(), semantic, completion)?)
    }
}

/// Router with every endpoint and the CORS layer.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([X_REQUEST_ID, X_CONTEXT_SOURCE, X_CONTEXT_DEGRADED]);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/vault/scan", post(handle_scan))
        .route("/api/vault/read", get(handle_read))
        .route("/api/rag", post(handle_rag))
        .route("/api/chat", post(handle_chat))
        .layer(cors)
        .with_state(state)
}

/// Serve on `[server].bind` until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config)?;
    let app = build_router(state);

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("vault-context listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    status: u16,
}

/// Converts a [`VaultError`] into the JSON error contract.
struct AppError(VaultError);

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = err.status();
        if status >= 500 {
            error!(code = err.code(), error = %err, "request failed");
        } else {
            warn!(code = err.code(), error = %err, "request rejected");
        }

        let body = ErrorBody {
            error: ErrorDetail {
                code: err.code(),
                message: err.public_message(),
                status,
            },
        };
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| VaultError::InvalidInput(rejection.body_text()))
}

/// The request's vault path, or the configured default, through the path guard.
fn resolve_root(config: &Config, vault_path: Option<&str>) -> Result<PathBuf> {
    let root = match vault_path.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => PathBuf::from(path),
        None => config
            .vault
            .default_root
            .clone()
            .ok_or_else(|| VaultError::InvalidInput("vault_path is required".to_string()))?,
    };
    path_guard::validate_root(&root)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /api/vault/scan ============

#[derive(Deserialize)]
struct ScanRequest {
    #[serde(default)]
    vault_path: Option<String>,
}

#[derive(Serialize)]
struct ScanResponse {
    success: bool,
    files: Vec<DocumentRecord>,
    count: usize,
    scan_time_ms: u64,
}

async fn handle_scan(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ScanRequest>, JsonRejection>,
) -> std::result::Result<Json<ScanResponse>, AppError> {
    let req = json_body(payload)?;
    let root = resolve_root(&state.config, req.vault_path.as_deref())?;

    let started = Instant::now();
    let key = signature(&["scan", &root.to_string_lossy()]);
    let limits = state.orchestrator.limits().clone();
    let scan_root = root.clone();
    let mut files = state
        .scans
        .run(&key, move || async move { scanner::scan(&scan_root, &limits).await })
        .await?;
    scanner::sort_newest_first(&mut files);

    Ok(Json(ScanResponse {
        success: true,
        count: files.len(),
        files,
        scan_time_ms: started.elapsed().as_millis() as u64,
    }))
}

// ============ GET /api/vault/read ============

#[derive(Deserialize)]
struct ReadParams {
    id: String,
    #[serde(default)]
    vault_path: Option<String>,
}

#[derive(Serialize)]
struct ReadResponse {
    success: bool,
    file: DocumentContent,
}

async fn handle_read(
    State(state): State<AppState>,
    params: std::result::Result<UrlQuery<ReadParams>, QueryRejection>,
) -> std::result::Result<Json<ReadResponse>, AppError> {
    let UrlQuery(params) =
        params.map_err(|rejection| VaultError::InvalidInput(rejection.body_text()))?;
    let root = resolve_root(&state.config, params.vault_path.as_deref())?;
    let relative = decode_id(&params.id)?;

    let file = scanner::read_document(&root, &relative, state.orchestrator.limits()).await?;
    Ok(Json(ReadResponse {
        success: true,
        file,
    }))
}

// ============ POST /api/rag ============

#[derive(Deserialize)]
struct RagRequest {
    query: String,
    #[serde(default)]
    match_count: Option<usize>,
    #[serde(default)]
    threshold: Option<f64>,
}

#[derive(Serialize)]
struct RagResponse {
    success: bool,
    query: String,
    chunks: Vec<VectorHit>,
    count: usize,
}

async fn handle_rag(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RagRequest>, JsonRejection>,
) -> std::result::Result<Json<RagResponse>, AppError> {
    let req = json_body(payload)?;
    let retrieval = state.orchestrator.config();
    let query = Query::parse(&req.query, retrieval.max_rag_query_chars)?;

    let match_count = req.match_count.unwrap_or(retrieval.match_count);
    if match_count == 0 || match_count > MAX_RAG_MATCHES {
        return Err(VaultError::InvalidInput(format!(
            "match_count must be between 1 and {}",
            MAX_RAG_MATCHES
        ))
        .into());
    }
    let threshold = req.threshold.unwrap_or(retrieval.similarity_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(VaultError::InvalidInput("threshold must be between 0 and 1".to_string()).into());
    }

    let backend = state.orchestrator.semantic();
    if !backend.is_enabled() {
        return Err(VaultError::ConfigurationMissing("vector search is not configured".to_string()).into());
    }

    let chunks = semantic::semantic_search(backend, query.raw(), match_count, threshold).await?;
    info!(count = chunks.len(), "semantic search");
    Ok(Json(RagResponse {
        success: true,
        query: query.raw().to_string(),
        count: chunks.len(),
        chunks,
    }))
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    vault_path: Option<String>,
    #[serde(default)]
    file_ids: Vec<String>,
    #[serde(default)]
    all_files: Option<Vec<DocumentRecord>>,
}

async fn handle_chat(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> std::result::Result<Response, AppError> {
    let req = json_body(payload)?;
    let query = Query::parse(&req.message, state.orchestrator.config().max_query_chars)?;
    let completion = state.completion.as_ref().as_ref().map_err(Clone::clone)?;
    let root = resolve_root(&state.config, req.vault_path.as_deref())?;

    let request_id = uuid::Uuid::new_v4().to_string();
    let deadline = Duration::from_secs(state.config.server.request_timeout_secs);
    let retrieval = RetrievalRequest {
        file_ids: req.file_ids,
        all_files: req.all_files,
    };

    let pipeline = async {
        let blob = state.orchestrator.retrieve(&query, &root, retrieval).await?;
        info!(
            request_id = %request_id,
            source = blob.source.as_str(),
            degraded = blob.degraded.as_deref().unwrap_or("false"),
            items = blob.len(),
            bytes = blob.cumulative_bytes,
            truncated = blob.truncated,
            "context ready"
        );
        let messages = prompt::messages(&blob, query.raw());
        let opened = completion.stream(&messages).await?;
        Ok::<_, VaultError>((blob, opened))
    };

    let (blob, opened) = tokio::time::timeout(deadline, pipeline)
        .await
        .map_err(|_| VaultError::Timeout(deadline))??;

    let body = Body::from_stream(opened.tokens.map(Ok::<_, Infallible>));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(X_CONTEXT_SOURCE, HeaderValue::from_static(blob.source.as_str()));
    let degraded = blob.degraded.as_deref().unwrap_or("false");
    if let Ok(value) = HeaderValue::from_str(degraded) {
        headers.insert(X_CONTEXT_DEGRADED, value);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    Ok(response)
}
