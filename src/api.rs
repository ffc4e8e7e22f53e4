/// HTTP surface over `LogPipeline`
///
/// Handlers stay thin: validate the request, call one pipeline or store
/// operation, map `PipelineError` to a status code.
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Json, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::analysis_stream::{AnalysisEvent, AnalysisStreamer, CONTEXT_LIMIT};
use crate::error::PipelineError;
use crate::job::JobStatus;
use crate::pipeline::LogPipeline;
use crate::similarity::SimilaritySearch;
use crate::store::{LogQuery, MAX_PAGE_SIZE};

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Transport cap, set above the upload limit so oversize uploads get the JSON detail
const BODY_LIMIT_BYTES: usize = MAX_UPLOAD_BYTES + 64 * 1024;
const ALLOWED_EXTENSIONS: [&str; 2] = [".log", ".txt"];
/// Entries embedded per job when building the similarity index
const MAX_EMBEDDED_ENTRIES: u64 = 10_000;

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<LogPipeline>,
    pub streamer: AnalysisStreamer,
    pub similarity: Option<Arc<SimilaritySearch>>,
}

impl AppState {
    pub fn new(pipeline: Arc<LogPipeline>, streamer: AnalysisStreamer) -> Self {
        Self {
            pipeline,
            streamer,
            similarity: None,
        }
    }

    pub fn with_similarity(mut self, similarity: Arc<SimilaritySearch>) -> Self {
        self.similarity = Some(similarity);
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::JobNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::Dispatch(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            PipelineError::Persistence(_) | PipelineError::Scoring(_) | PipelineError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    store: String,
    store_connected: bool,
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    filename: String,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    job_id: String,
    filename: String,
    status: JobStatus,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct AskAiRequest {
    query: String,
    #[serde(default)]
    log_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EmbedResponse {
    job_id: String,
    indexed: usize,
}

// ============================================================================
// HTTP Handlers
// ============================================================================

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.pipeline.store();
    Json(HealthResponse {
        status: "ok".to_string(),
        store: store.name().to_string(),
        store_connected: store.ping().await,
    })
}

/// Raw file body, filename in the query string
async fn upload_log(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    if !ALLOWED_EXTENSIONS.iter().any(|ext| params.filename.ends_with(ext)) {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "File must be .log or .txt"));
    }
    if body.len() > MAX_UPLOAD_BYTES {
        return Err(ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "File size exceeds 10MB"));
    }

    let content = String::from_utf8_lossy(&body);
    info!("Upload {} ({} bytes)", params.filename, body.len());

    let job = state
        .pipeline
        .submit_job(content.as_ref(), &params.filename)
        .await?;

    Ok(Json(UploadResponse {
        job_id: job.job_id,
        filename: job.filename,
        status: job.status,
        created_at: job.created_at,
    }))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job = state.pipeline.get_job(&job_id).await?;
    Ok(Json(job))
}

async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<impl IntoResponse> {
    let page = state.pipeline.store().query_logs(&query).await?;
    Ok(Json(page))
}

async fn get_analytics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let analytics = state.pipeline.store().analytics(Utc::now()).await?;
    Ok(Json(analytics))
}

/// Server-sent events: `{"token": ...}` chunks, then `{"done": true, "result": ...}`
async fn ask_ai(
    State(state): State<AppState>,
    Json(req): Json<AskAiRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut ids = req.log_ids;
    if ids.is_empty() {
        if let Some(similarity) = &state.similarity {
            match similarity.search(&req.query, CONTEXT_LIMIT).await {
                Ok(found) => ids = found,
                Err(e) => warn!("Similarity search failed, using recent logs: {}", e),
            }
        }
    }

    let entries = state
        .pipeline
        .store()
        .recent_entries(&ids, CONTEXT_LIMIT)
        .await?;
    let rx = state.streamer.stream(&req.query, entries);

    let events = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok::<_, Infallible>(sse_event(event)), rx))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event(event: AnalysisEvent) -> Event {
    let payload = match event {
        AnalysisEvent::Token(token) => serde_json::json!({ "token": token }),
        AnalysisEvent::Done(result) => serde_json::json!({ "done": true, "result": result }),
    };
    Event::default().data(payload.to_string())
}

/// Embed a completed job's entries into the similarity index
async fn embed_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let Some(similarity) = &state.similarity else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Similarity search is not configured",
        ));
    };

    let job = state.pipeline.get_job(&job_id).await?;
    if job.status != JobStatus::Completed {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("Job {} is {}, not completed", job_id, job.status),
        ));
    }

    let mut items = Vec::new();
    let mut query = LogQuery {
        job_id: Some(job_id.clone()),
        page_size: MAX_PAGE_SIZE,
        ..LogQuery::new()
    };
    loop {
        let page = state.pipeline.store().query_logs(&query).await?;
        let fetched = page.logs.len();
        items.extend(page.logs.into_iter().map(|e| (e.record_id(), e.summary_line())));

        if fetched == 0 || query.page as u64 >= page.pages || items.len() as u64 >= MAX_EMBEDDED_ENTRIES {
            break;
        }
        query.page += 1;
    }

    let indexed = similarity
        .index(&items)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))?;

    Ok(Json(EmbedResponse { job_id, indexed }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/upload-log", post(upload_log))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/embed", post(embed_job))
        .route("/logs", get(get_logs))
        .route("/analytics", get(get_analytics))
        .route("/ask-ai", post(ask_ai))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
