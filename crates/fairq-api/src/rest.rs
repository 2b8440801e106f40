//! REST API handlers

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use fairq_core::{ContainerStats, Job, LifecycleState};
use fairq_scheduler::{ControlHandle, StatusReport, UserStats};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Application state shared across handlers
pub struct AppState {
    pub control: ControlHandle,
}

/// Create the API router
pub fn create_router(control: ControlHandle) -> Router {
    let state = Arc::new(AppState { control });

    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/pending", get(list_pending))
        .route("/api/v1/pending/delete", post(delete_pending))
        .route("/api/v1/running", get(list_running))
        .route("/api/v1/history", get(list_history))
        .route("/api/v1/history", delete(clear_history))
        .route("/api/v1/users", get(list_users))
        .route("/api/v1/gpus", get(get_gpus))
        .route("/api/v1/lock", post(lock_queue))
        .route("/api/v1/unlock", post(unlock_queue))
        .route("/api/v1/shutdown", post(shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Job as listed by the API
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub name: String,
    pub executor: String,
    pub gpu_count: u32,
    pub assigned_gpus: Vec<u32>,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Latest resource sample, running jobs only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ContainerStats>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            name: job.config.name,
            executor: job.config.executor,
            gpu_count: job.config.gpu_count,
            assigned_gpus: job.assigned_gpus,
            state: job.state,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            stats: job.stats,
        }
    }
}

fn job_list(jobs: Vec<Job>) -> Json<Vec<JobResponse>> {
    Json(jobs.into_iter().map(JobResponse::from).collect())
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub status: StatusReport,
}

/// Get scheduler status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: state.control.status(),
    })
}

async fn list_pending(State(state): State<Arc<AppState>>) -> Json<Vec<JobResponse>> {
    job_list(state.control.snapshot().pending)
}

async fn list_running(State(state): State<Arc<AppState>>) -> Json<Vec<JobResponse>> {
    job_list(state.control.snapshot().running)
}

/// History, most recent first
async fn list_history(State(state): State<Arc<AppState>>) -> Json<Vec<JobResponse>> {
    job_list(state.control.snapshot().history)
}

async fn list_users(State(state): State<Arc<AppState>>) -> Json<Vec<UserStats>> {
    Json(state.control.snapshot().users)
}

/// GPU partition response
#[derive(Debug, Serialize, Deserialize)]
pub struct GpuResponse {
    pub total: usize,
    pub free: Vec<u32>,
    pub assigned: Vec<u32>,
}

async fn get_gpus(State(state): State<Arc<AppState>>) -> Json<GpuResponse> {
    let gpus = state.control.snapshot().gpus;
    Json(GpuResponse {
        total: gpus.free.len() + gpus.assigned.len(),
        free: gpus.free,
        assigned: gpus.assigned,
    })
}

/// Lock state after a lock or unlock request
#[derive(Debug, Serialize, Deserialize)]
pub struct LockResponse {
    pub locked: bool,
    /// The request changed the lock state
    pub changed: bool,
}

async fn lock_queue(State(state): State<Arc<AppState>>) -> Json<LockResponse> {
    let changed = state.control.lock();
    Json(LockResponse {
        locked: state.control.is_locked(),
        changed,
    })
}

async fn unlock_queue(State(state): State<Arc<AppState>>) -> Json<LockResponse> {
    let changed = state.control.unlock();
    Json(LockResponse {
        locked: state.control.is_locked(),
        changed,
    })
}

/// Request to delete pending jobs by id or by name
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DeletePendingRequest {
    #[serde(default)]
    pub ids: Vec<Uuid>,
    #[serde(default)]
    pub names: Vec<String>,
}

/// Number of removed jobs
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: usize,
}

/// Delete matching jobs from the pending queue
async fn delete_pending(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeletePendingRequest>,
) -> Result<Json<DeleteResponse>, (StatusCode, String)> {
    if req.ids.is_empty() && req.names.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "either ids or names must be given".to_string(),
        ));
    }

    info!(ids = ?req.ids, names = ?req.names, "Deleting pending jobs");

    let DeletePendingRequest { ids, names } = req;
    let deleted = state
        .control
        .delete_pending(move |job| ids.contains(&job.id) || names.iter().any(|n| n == job.name()))
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    Ok(Json(DeleteResponse { deleted }))
}

/// Empty the history
async fn clear_history(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DeleteResponse>, (StatusCode, String)> {
    info!("Clearing history");

    let deleted = state
        .control
        .clear_history()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    Ok(Json(DeleteResponse { deleted }))
}

/// Ask the daemon to stop
async fn shutdown(State(state): State<Arc<AppState>>) -> StatusCode {
    info!("Shutdown requested over the API");
    state.control.request_shutdown();
    StatusCode::ACCEPTED
}
