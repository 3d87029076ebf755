//! HTTP server.
//!
//! Exposes the engine over a JSON REST API consumed by the UIs and tool
//! servers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | liveness |
//! | `GET`  | `/status` | configuration summary |
//! | `POST` | `/upload` | stage multipart files into the scratch directory |
//! | `POST` | `/ingest` | start an ingestion run, returns `{run_id}` |
//! | `POST` | `/ingest-text` | ingest inline text |
//! | `GET`  | `/processing-status/{run_id}` | current run snapshot |
//! | `GET`  | `/processing-events/{run_id}` | server-sent snapshot stream |
//! | `POST` | `/cancel-processing/{run_id}` | request cooperative cancellation |
//! | `POST` | `/search` | hybrid retrieval |
//! | `POST` | `/query` | retrieval-augmented answer |
//! | `GET`  | `/graph` | query-scoped subgraph (requires `root`) |
//! | `POST` | `/cleanup-uploads` | purge the scratch directory |
//!
//! Ingest endpoints return immediately; terminal failures surface through
//! the status endpoints. Search and query return `200` with
//! `no_results: true` for empty result sets and `500` with the error kind
//! on retrieval failure.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! front-ends.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::ingest::IngestOptions;
use crate::models::{IngestRun, RankedNode, RetrievalMode, SourceSpec};
use crate::query::Answer;

/// Start the HTTP server on the configured bind address. Runs until the
/// process terminates.
pub async fn run_server(engine: Arc<Engine>) -> Result<(), EngineError> {
    let bind = engine.config.server.bind.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/upload", post(handle_upload))
        .route("/ingest", post(handle_ingest))
        .route("/ingest-text", post(handle_ingest_text))
        .route("/processing-status/{run_id}", get(handle_processing_status))
        .route("/processing-events/{run_id}", get(handle_processing_events))
        .route("/cancel-processing/{run_id}", post(handle_cancel))
        .route("/search", post(handle_search))
        .route("/query", post(handle_query))
        .route("/graph", get(handle_graph))
        .route("/cleanup-uploads", post(handle_cleanup_uploads))
        .layer(cors)
        .with_state(engine);

    info!(%bind, "server listening");
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| EngineError::Config(format!("cannot bind {bind}: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| EngineError::store_permanent(e.to_string()))?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    kind: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        kind: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        kind: "not_found".to_string(),
        message: message.into(),
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Health and status
// ═══════════════════════════════════════════════════════════════════════

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

#[derive(Serialize)]
struct StatusResponse {
    llm_provider: String,
    llm_model: String,
    embedding_kind: String,
    embedding_model: String,
    embedding_dimension: usize,
    vector_db: String,
    search_db: String,
    graph_db: String,
    graph_enabled: bool,
    document_parser: String,
    kg_extractor: String,
    schema_name: String,
    chunk_size: usize,
    chunk_overlap: usize,
}

async fn handle_status(State(engine): State<Arc<Engine>>) -> Json<StatusResponse> {
    let config = &engine.config;
    Json(StatusResponse {
        llm_provider: config.llm.provider.clone(),
        llm_model: config.llm.model.clone(),
        embedding_kind: config.embedding.kind.clone(),
        embedding_model: config.embedding.model.clone(),
        embedding_dimension: config.embedding.dimension,
        vector_db: config.vector.kind.clone(),
        search_db: config.lexical.kind.clone(),
        graph_db: config.graph.kind.clone(),
        graph_enabled: config.graph.enabled,
        document_parser: config.parser.kind.clone(),
        kg_extractor: config.kg.extractor.clone(),
        schema_name: config.kg.schema_name.clone(),
        chunk_size: config.chunking.chunk_size,
        chunk_overlap: config.chunking.chunk_overlap,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Upload staging
// ═══════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct UploadResponse {
    paths: Vec<String>,
}

/// Keep only the final path component so uploads cannot escape the
/// scratch directory.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "upload.bin".to_string()
    } else {
        cleaned
    }
}

async fn handle_upload(
    State(engine): State<Arc<Engine>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let dir = engine.config.server.upload_dir.clone();
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| bad_request(format!("cannot create upload dir: {e}")))?;

    let mut paths = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.to_string()))?
    {
        let name = sanitize_file_name(field.file_name().unwrap_or("upload.bin"));
        let bytes = field.bytes().await.map_err(|e| bad_request(e.to_string()))?;
        let path = dir.join(&name);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| bad_request(format!("cannot stage {name}: {e}")))?;
        paths.push(path.to_string_lossy().to_string());
    }

    if paths.is_empty() {
        return Err(bad_request("no files in upload"));
    }
    Ok(Json(UploadResponse { paths }))
}

#[derive(Serialize)]
struct CleanupResponse {
    removed: usize,
}

async fn handle_cleanup_uploads(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<CleanupResponse>, AppError> {
    let dir = &engine.config.server.upload_dir;
    let mut removed = 0usize;
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false)
                && tokio::fs::remove_file(entry.path()).await.is_ok()
            {
                removed += 1;
            }
        }
    }
    Ok(Json(CleanupResponse { removed }))
}

// ═══════════════════════════════════════════════════════════════════════
// Ingestion
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct IngestRequest {
    source_spec: SourceSpec,
    #[serde(default)]
    skip_graph: bool,
}

#[derive(Serialize)]
struct IngestResponse {
    run_id: String,
}

async fn handle_ingest(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    let run_id = engine.manager.ingest(
        req.source_spec,
        IngestOptions {
            skip_graph: req.skip_graph,
            run_id: None,
        },
    )?;
    Ok(Json(IngestResponse { run_id }))
}

#[derive(Deserialize)]
struct IngestTextRequest {
    text: String,
    #[serde(default = "default_text_name")]
    name: String,
    #[serde(default)]
    skip_graph: bool,
}

fn default_text_name() -> String {
    "inline".to_string()
}

async fn handle_ingest_text(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<IngestTextRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    if req.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    let run_id = engine.manager.ingest_text(
        req.text,
        req.name,
        IngestOptions {
            skip_graph: req.skip_graph,
            run_id: None,
        },
    )?;
    Ok(Json(IngestResponse { run_id }))
}

async fn handle_processing_status(
    State(engine): State<Arc<Engine>>,
    Path(run_id): Path<String>,
) -> Result<Json<IngestRun>, AppError> {
    engine
        .status
        .get(&run_id)
        .map(Json)
        .ok_or_else(|| not_found(format!("unknown run: {run_id}")))
}

async fn handle_processing_events(
    State(engine): State<Arc<Engine>>,
    Path(run_id): Path<String>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>>, AppError> {
    let snapshots = engine
        .status
        .subscribe(&run_id)
        .ok_or_else(|| not_found(format!("unknown run: {run_id}")))?;

    // Coalesced snapshots; the stream closes after the terminal state.
    let events = async_stream::stream! {
        let mut snapshots = snapshots;
        while let Some(run) = snapshots.next().await {
            let terminal = run.phase.is_terminal();
            if let Ok(event) = Event::default().json_data(&run) {
                yield Ok(event);
            }
            if terminal {
                return;
            }
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[derive(Serialize)]
struct CancelResponse {
    run_id: String,
    cancelling: bool,
}

async fn handle_cancel(
    State(engine): State<Arc<Engine>>,
    Path(run_id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    if !engine.status.cancel(&run_id) {
        return Err(not_found(format!("unknown run: {run_id}")));
    }
    Ok(Json(CancelResponse {
        run_id,
        cancelling: true,
    }))
}

// ═══════════════════════════════════════════════════════════════════════
// Search and query
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    modes: Vec<RetrievalMode>,
}

fn default_top_k() -> usize {
    10
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<RankedNode>,
    no_results: bool,
}

async fn handle_search(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let results = engine
        .retriever
        .retrieve(&req.query, req.top_k, &req.modes)
        .await?;
    Ok(Json(SearchResponse {
        no_results: results.is_empty(),
        results,
    }))
}

async fn handle_query(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<Answer>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let answer = engine.query.answer(&req.query, req.top_k, &req.modes).await?;
    Ok(Json(answer))
}

// ═══════════════════════════════════════════════════════════════════════
// Graph
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct GraphParams {
    /// Seed entity label; the response is scoped to its neighborhood.
    root: Option<String>,
    #[serde(default = "default_graph_depth")]
    depth: usize,
}

fn default_graph_depth() -> usize {
    2
}

async fn handle_graph(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<GraphParams>,
) -> Result<Json<crate::store::Subgraph>, AppError> {
    let Some(graph) = &engine.graph else {
        return Err(bad_request("knowledge graph is disabled"));
    };
    let Some(root) = params.root.filter(|r| !r.trim().is_empty()) else {
        return Err(bad_request("the 'root' query parameter is required"));
    };
    let subgraph = graph.query(&[root], params.depth.min(2)).await?;
    Ok(Json(subgraph))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_names_are_sanitized() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\..\\boot.ini"), "boot.ini");
        assert_eq!(sanitize_file_name("week 3 notes.md"), "week 3 notes.md");
        assert_eq!(sanitize_file_name("...."), "upload.bin");
    }
}
