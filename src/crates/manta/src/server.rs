//! HTTP API
//!
//! Thin axum layer over the engine and the branch store. Tasks created
//! here are queued on the worker pool; dynamic updates and step
//! optimizations fork their branch and re-queue the task so execution
//! resumes in the background.

use crate::app::App;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use planvm_core::ResponseFormat;
use planvm_engine::{EngineError, ExecutionEngine, WorkerPool};
use planvm_store::{BranchStore, StoreError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

const WORKERS: usize = 4;

type ApiResult<T> = Result<T, ApiError>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
    pub store: Arc<dyn BranchStore>,
    pub pool: Arc<WorkerPool>,
}

/// API error with a structured JSON body
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Validation(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m),
            ApiError::Validation(m) => (StatusCode::UNPROCESSABLE_ENTITY, "validation", m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", m),
        };
        (status, Json(json!({ "error": { "kind": kind, "message": message } }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TaskNotFound(_)
            | StoreError::BranchNotFound(_)
            | StoreError::CommitNotFound(_) => ApiError::NotFound(e.to_string()),
            StoreError::Locked { .. }
            | StoreError::BranchExists(_)
            | StoreError::Conflict { .. } => ApiError::Conflict(e.to_string()),
            StoreError::ProtectedBranch | StoreError::Invalid(_) => {
                ApiError::Validation(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Store(inner) => inner.into(),
            EngineError::ValidationExhausted { .. } => ApiError::Validation(e.to_string()),
            EngineError::Vm(planvm_core::VmError::Validation { .. }) => {
                ApiError::Validation(e.to_string())
            }
            EngineError::Config(_) => ApiError::Validation(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub async fn serve(app: App, bind: &str) -> anyhow::Result<()> {
    let engine = app.engine()?.clone();
    let pool = Arc::new(WorkerPool::new(engine.clone(), WORKERS));
    let state = AppState {
        engine,
        store: app.store.clone(),
        pool,
    };

    let cors = if app.config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = app
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let router = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    info!(bind, "HTTP API listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/:id/branches", get(list_branches))
        .route(
            "/tasks/:id/branches/:branch/details",
            get(branch_details),
        )
        .route("/tasks/:id/branches/:branch", delete(delete_branch))
        .route("/tasks/:id/commits/:hash/detail", get(commit_detail))
        .route("/tasks/:id/commits/:hash/diff", get(commit_diff))
        .route("/tasks/:id/set_branch", post(set_branch))
        .route("/tasks/:id/dynamic_update", post(dynamic_update))
        .route("/tasks/:id/optimize_step", post(optimize_step))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    goal: String,
    #[serde(default)]
    response_format: Option<ResponseFormat>,
    #[serde(default)]
    namespace: Option<String>,
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.goal.trim().is_empty() {
        return Err(ApiError::Validation("goal must not be empty".into()));
    }
    let namespace = req.namespace.unwrap_or_else(|| "default".to_string());
    let task = state
        .engine
        .start_task(&req.goal, &namespace, req.response_format.unwrap_or_default())
        .await?;
    state.pool.submit(task.task_id);
    info!(task_id = %task.task_id, "task queued");
    Ok((StatusCode::CREATED, Json(json!({ "task_id": task.task_id }))))
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    offset: Option<u32>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = page.limit.unwrap_or(20).min(100);
    let offset = page.offset.unwrap_or(0);
    let tasks = state.store.list_tasks(limit, offset).await?;
    Ok(Json(json!({ "tasks": tasks, "limit": limit, "offset": offset })))
}

async fn list_branches(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let branches = state.store.list_branches(task_id).await?;
    Ok(Json(json!({ "branches": branches })))
}

async fn branch_details(
    State(state): State<AppState>,
    Path((task_id, branch)): Path<(Uuid, String)>,
) -> ApiResult<impl IntoResponse> {
    let commits = state.store.list_commits(task_id, &branch).await?;
    let summaries: Vec<_> = commits
        .iter()
        .map(|c| {
            json!({
                "commit_hash": c.commit_hash,
                "parent_hash": c.parent_hash,
                "seq_no": c.seq_no,
                "time": c.time,
                "message": c.message,
                "commit_type": c.commit_type,
                "title": c.title,
            })
        })
        .collect();
    Ok(Json(json!({ "branch": branch, "commits": summaries })))
}

async fn commit_detail(
    State(state): State<AppState>,
    Path((task_id, hash)): Path<(Uuid, String)>,
) -> ApiResult<impl IntoResponse> {
    let commit = state.store.get_commit(task_id, &hash).await?;
    Ok(Json(commit))
}

async fn commit_diff(
    State(state): State<AppState>,
    Path((task_id, hash)): Path<(Uuid, String)>,
) -> ApiResult<impl IntoResponse> {
    let commit = state.store.get_commit(task_id, &hash).await?;
    Ok(commit.details.diff)
}

#[derive(Deserialize)]
struct SetBranchRequest {
    branch: String,
}

async fn set_branch(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<SetBranchRequest>,
) -> ApiResult<impl IntoResponse> {
    state.store.set_active_branch(task_id, &req.branch).await?;
    Ok(Json(json!({ "task_id": task_id, "active_branch": req.branch })))
}

#[derive(Deserialize)]
struct DynamicUpdateRequest {
    commit_hash: String,
    suggestion: String,
}

async fn dynamic_update(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<DynamicUpdateRequest>,
) -> ApiResult<impl IntoResponse> {
    let branch = state
        .engine
        .dynamic_update(task_id, &req.commit_hash, &req.suggestion)
        .await?;
    state.pool.submit(task_id);
    Ok(Json(json!({ "task_id": task_id, "branch": branch })))
}

#[derive(Deserialize)]
struct OptimizeStepRequest {
    commit_hash: String,
    seq_no: u64,
    suggestion: String,
}

async fn optimize_step(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<OptimizeStepRequest>,
) -> ApiResult<impl IntoResponse> {
    let branch = state
        .engine
        .optimize_step(task_id, &req.commit_hash, req.seq_no, &req.suggestion)
        .await?;
    state.pool.submit(task_id);
    Ok(Json(json!({ "task_id": task_id, "branch": branch })))
}

async fn delete_branch(
    State(state): State<AppState>,
    Path((task_id, branch)): Path<(Uuid, String)>,
) -> ApiResult<impl IntoResponse> {
    state.store.delete_branch(task_id, &branch).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_http_statuses() {
        let cases = [
            (
                ApiError::from(StoreError::TaskNotFound(Uuid::nil())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(StoreError::Locked {
                    task_id: Uuid::nil(),
                    owner: "other".into(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(StoreError::ProtectedBranch),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn validation_exhaustion_maps_to_422() {
        let error = ApiError::from(EngineError::ValidationExhausted {
            attempts: 3,
            summary: "bad plan".into(),
        });
        assert_eq!(
            error.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
