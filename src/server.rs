//! JSON HTTP API over the task operations.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/tasks` | Create a task and start processing it in the background |
//! | `GET`    | `/tasks/{id}` | Task with its document summary |
//! | `POST`   | `/tasks/{id}/cancel` | Cancel a non-terminal task |
//! | `DELETE` | `/tasks/{id}` | Delete a task and everything it owns |
//! | `GET`    | `/tasks/{id}/chunks` | Chunks in order |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_state", "message": "invalid state: task ... is Succeeded, cannot cancel" } }
//! ```
//!
//! Error codes: `bad_request` (400, or 422 for a well-formed body with
//! invalid fields), `not_found` (404), `invalid_state` (409), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::{Config, TasksConfig};
use crate::db;
use crate::error::PipelineError;
use crate::models::{Chunk, Task};
use crate::pipeline::DocumentPipeline;
use crate::store::Store;
use crate::tasks::{self, NewTask, TaskView};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Store>,
    pipeline: Arc<DocumentPipeline>,
    defaults: Arc<TasksConfig>,
    /// Bounds the number of pipeline runs in flight.
    workers: Arc<Semaphore>,
}

impl AppState {
    pub fn new(pipeline: Arc<DocumentPipeline>, defaults: TasksConfig, max_concurrent: usize) -> Self {
        Self {
            store: pipeline.store(),
            pipeline,
            defaults: Arc::new(defaults),
            workers: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

/// Build the router. Exposed so tests can serve it on an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tasks", post(handle_create))
        .route("/tasks/{id}", get(handle_show).delete(handle_delete))
        .route("/tasks/{id}/cancel", post(handle_cancel))
        .route("/tasks/{id}/chunks", get(handle_chunks))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::new(db::open_store(config).await?);
    let pipeline = Arc::new(DocumentPipeline::from_config(config, store)?);
    let state = AppState::new(
        pipeline,
        config.tasks.clone(),
        config.pipeline.max_concurrent_tasks,
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "docchunk server listening");
    axum::serve(listener, router(state)).await?;
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

/// Internal error type that converts into an Axum HTTP response.
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let (status, code) = match &err {
            PipelineError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            PipelineError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
            PipelineError::InvalidRequest(_) => (StatusCode::UNPROCESSABLE_ENTITY, "bad_request"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %err, "request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: rejection.body_text(),
        }
    }
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

// ============ /tasks ============

/// `POST /tasks`: create, answer `201`, then run the pipeline detached.
async fn handle_create(
    State(state): State<AppState>,
    body: Result<Json<NewTask>, JsonRejection>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let Json(request) = body?;
    let task = tasks::create_task(state.store.as_ref(), &state.defaults, request).await?;

    let pipeline = state.pipeline.clone();
    let workers = state.workers.clone();
    let task_id = task.id.clone();
    tokio::spawn(async move {
        let _permit = workers.acquire_owned().await;
        match pipeline.run(&task_id).await {
            Ok(status) => info!(task_id = %task_id, status = %status, "background run finished"),
            Err(e) => warn!(task_id = %task_id, error = %e, "background run aborted"),
        }
    });

    Ok((StatusCode::CREATED, Json(task)))
}

async fn handle_show(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, AppError> {
    Ok(Json(tasks::get_task(state.store.as_ref(), &id).await?))
}

async fn handle_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(tasks::cancel_task(state.store.as_ref(), &id).await?))
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    tasks::delete_task(state.store.as_ref(), &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct ChunkList {
    task_id: String,
    chunks: Vec<Chunk>,
}

async fn handle_chunks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChunkList>, AppError> {
    let chunks = tasks::list_task_chunks(state.store.as_ref(), &id).await?;
    Ok(Json(ChunkList { task_id: id, chunks }))
}
