//! HTTP API: task queue endpoints, synchronous run, health and metrics

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use genqueue_backend::{mock::MockBackend, InferenceBackend};
use genqueue_backend_llamacpp::LlamaCppBackend;
use genqueue_common::config::{AppConfig, BackendKind};
use genqueue_common::{GenqueueError, Result};
use genqueue_core::{TaskQueue, TaskRecord, TaskStatus, TaskStore, Worker};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Clone)]
pub struct AppState {
    queue: TaskQueue,
    config: Arc<AppConfig>,
}

impl AppState {
    pub fn queue(&self) -> &TaskQueue { &self.queue }
}

/// Router over [`start`]. Must run inside a tokio runtime.
pub fn app(cfg: AppConfig) -> Result<Router> {
    Ok(router(start(cfg)?))
}

/// Builds the backend named in `cfg`, starts the queue workers, begins
/// loading the model and polling the GPU.
pub fn start(cfg: AppConfig) -> Result<AppState> {
    let backend = select_backend(cfg.model.backend);
    let state = build_state(cfg, backend)?;
    state.queue.warm_up();
    genqueue_obs::spawn_gpu_polling();
    Ok(state)
}

pub fn select_backend(kind: BackendKind) -> Arc<dyn InferenceBackend> {
    match kind {
        BackendKind::Llamacpp => {
            if !LlamaCppBackend::ffi_enabled() {
                tracing::warn!(target: "api", "llama.cpp support not compiled in; tasks will fail until rebuilt with LLAMA_CPP_DIR");
            }
            Arc::new(LlamaCppBackend::new())
        }
        BackendKind::Mock => {
            tracing::info!(target: "api", "using mock backend");
            Arc::new(MockBackend::new())
        }
    }
}

pub fn build_state(cfg: AppConfig, backend: Arc<dyn InferenceBackend>) -> Result<AppState> {
    genqueue_obs::init();
    let worker = Arc::new(Worker::new(backend, &cfg)?);
    let queue = TaskQueue::start(worker, Arc::new(TaskStore::new()), &cfg.task_queue);
    Ok(AppState { queue, config: Arc::new(cfg) })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/openapi.json", get(openapi))
        .route("/v1/tasks", post(submit_task).get(list_tasks))
        .route("/v1/tasks/:id", get(get_task))
        .route("/v1/tasks/:id/events", get(task_events))
        .route("/v1/tasks/:id/outputs/:name", get(get_output))
        .route("/v1/run", post(run_task))
        .with_state(state)
}

pub struct ApiError(GenqueueError);

impl From<GenqueueError> for ApiError {
    fn from(e: GenqueueError) -> Self { Self(e) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GenqueueError::QueueFull | GenqueueError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            GenqueueError::TaskNotFound(_) | GenqueueError::OutputNotFound(_) => StatusCode::NOT_FOUND,
            GenqueueError::TaskNotComplete(_) => StatusCode::CONFLICT,
            GenqueueError::InvalidGeneration(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(serde::Deserialize)]
struct SubmitRequest {
    prompt: String,
}

#[derive(serde::Serialize)]
struct SubmitResponse {
    task_id: String,
    status: TaskStatus,
}

#[derive(serde::Serialize)]
struct TaskView {
    #[serde(flatten)]
    record: TaskRecord,
    output_urls: Vec<String>,
}

impl From<TaskRecord> for TaskView {
    fn from(record: TaskRecord) -> Self {
        let output_urls = record
            .outputs
            .iter()
            .map(|name| format!("/v1/tasks/{}/outputs/{}", record.task_id, name))
            .collect();
        Self { record, output_urls }
    }
}

#[derive(serde::Serialize)]
struct RunResponse {
    task_id: String,
    status: TaskStatus,
    text: String,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.queue.worker().is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "loading")
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.queue.export_status_counts().await;
    let (content_type, body) = genqueue_obs::metrics::render();
    ([("content-type", content_type)], body)
}

async fn submit_task(State(state): State<AppState>, Json(req): Json<SubmitRequest>) -> ApiResult<impl IntoResponse> {
    let record = state.queue.submit(req.prompt).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { task_id: record.task_id, status: record.status })))
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskView>> {
    Json(state.queue.store().list().await.into_iter().map(TaskView::from).collect())
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<TaskView>> {
    let record = state.queue.store().get(&id).await.ok_or_else(|| GenqueueError::TaskNotFound(id.clone()))?;
    Ok(Json(record.into()))
}

async fn get_output(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let record = state.queue.store().get(&id).await.ok_or_else(|| GenqueueError::TaskNotFound(id.clone()))?;
    if record.status != TaskStatus::Complete {
        return Err(GenqueueError::TaskNotComplete(id).into());
    }
    if !record.outputs.contains(&name) {
        return Err(GenqueueError::OutputNotFound(name).into());
    }
    let path = state.queue.worker().sink().path(&id, &name)?;
    let text = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => GenqueueError::OutputNotFound(name.clone()),
        _ => GenqueueError::Io(e),
    })?;
    Ok(([("content-type", "text/plain; charset=utf-8")], text))
}

/// Streams the task record on every status change; ends after a terminal status.
async fn task_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<ReceiverStream<std::result::Result<Event, Infallible>>>> {
    let mut rx = state.queue.store().subscribe(&id).await.ok_or_else(|| GenqueueError::TaskNotFound(id.clone()))?;
    let (tx, out) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            let record = rx.borrow_and_update().clone();
            let terminal = record.status.is_terminal();
            let event = Event::default()
                .event("status")
                .json_data(TaskView::from(record))
                .unwrap_or_else(|_| Event::default().event("status").data("{}"));
            if tx.send(Ok(event)).await.is_err() || terminal {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    });
    Ok(Sse::new(ReceiverStream::new(out)).keep_alive(KeepAlive::default()))
}

async fn run_task(State(state): State<AppState>, Json(req): Json<SubmitRequest>) -> ApiResult<Json<RunResponse>> {
    tracing::info!(target: "api", "synchronous run request");
    let (record, outcome) = state.queue.run_now(req.prompt).await?;
    Ok(Json(RunResponse { task_id: record.task_id, status: record.status, text: outcome.text }))
}

async fn openapi(State(state): State<AppState>) -> impl IntoResponse {
    let spec = serde_json::json!({
        "openapi": "3.0.0",
        "info": {"title": format!("{} task queue", state.config.name), "version": env!("CARGO_PKG_VERSION")},
        "paths": {
            "/v1/tasks": {
                "post": {"summary": "Queue a generation task", "requestBody": {"content": {"application/json": {"schema": {
                    "type": "object", "required": ["prompt"], "properties": {"prompt": {"type": "string"}}
                }}}}},
                "get": {"summary": "List tasks"}
            },
            "/v1/tasks/{id}": {"get": {"summary": "Task status"}},
            "/v1/tasks/{id}/events": {"get": {"summary": "Task status changes (SSE)"}},
            "/v1/tasks/{id}/outputs/{name}": {"get": {"summary": "Download a task output file"}},
            "/v1/run": {"post": {"summary": "Generate synchronously"}},
            "/metrics": {"get": {"summary": "Prometheus metrics"}},
            "/healthz": {"get": {"summary": "health"}},
            "/readyz": {"get": {"summary": "readiness"}}
        },
        "x-outputs": state.config.task_queue.outputs,
    });
    Json(spec)
}
