use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

mod store;

pub use store::{sanitize_workflow_name, WorkflowStore};

use crate::config::AppConfig;
use crate::executor::{execute, ExecutorOptions};
use crate::graph::{validate_sub_workflow, ValidationReport, WorkflowGraph};
use crate::registry::{NodeDescriptor, NodeRegistry};
use crate::run::{RunError, RunStatus};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    runs: DashMap<String, Run>,
    registry: Arc<NodeRegistry>,
    run_semaphore: Arc<Semaphore>,
    workflows: WorkflowStore,
    config: RwLock<AppConfig>,
}

/// One submitted workflow execution, tracked from intake to terminal
/// status. The graph is kept so queued runs can start once a semaphore
/// permit frees up.
#[derive(Clone)]
struct Run {
    id: String,
    status: RunStatus,
    graph: WorkflowGraph,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    results: Option<HashMap<String, HashMap<String, Value>>>,
    error: Option<RunError>,
    cancel_token: CancellationToken,
}

impl AppState {
    pub fn new(registry: Arc<NodeRegistry>, config: AppConfig, workflows_dir: PathBuf) -> Self {
        let max_concurrent_runs = config.engine.max_concurrent_runs.max(1);
        Self {
            inner: Arc::new(AppStateInner {
                runs: DashMap::new(),
                registry,
                run_semaphore: Arc::new(Semaphore::new(max_concurrent_runs)),
                workflows: WorkflowStore::new(workflows_dir),
                config: RwLock::new(config),
            }),
        }
    }
}

// ─── Request / response bodies ───────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub workflow: Value,
}

#[derive(Serialize)]
pub struct ExecuteResponse {
    pub task_id: String,
    pub status: RunStatus,
}

#[derive(Serialize)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<HashMap<String, HashMap<String, Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub task_id: String,
    pub status: String,
}

#[derive(Deserialize)]
pub struct ValidateRequest {
    pub nodes: Value,
    #[serde(default)]
    pub connections: Value,
    #[serde(default)]
    pub result_node_id: Option<String>,
    #[serde(default)]
    pub result_port_name: Option<String>,
}

#[derive(Deserialize)]
pub struct SaveWorkflowRequest {
    pub name: String,
    pub workflow: Value,
}

#[derive(Serialize)]
pub struct WorkflowListResponse {
    pub workflows: Vec<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Error mapping ───────────────────────────────────────────────────────────

pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            AppError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{err:#}"))
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/execute", post(execute_workflow))
        .route("/api/status/{task_id}", get(task_status))
        .route("/api/cancel/{task_id}", post(cancel_task))
        .route("/api/validate", post(validate_workflow))
        .route("/api/nodes", get(list_nodes))
        .route("/api/workflows", get(list_workflows).post(save_workflow))
        .route(
            "/api/workflows/{name}",
            get(get_workflow).delete(delete_workflow),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn execute_workflow(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<ExecuteResponse>), AppError> {
    let graph: WorkflowGraph = serde_json::from_value(payload.workflow)
        .map_err(|e| AppError::BadRequest(format!("invalid workflow: {e}")))?;

    graph
        .validate(&state.inner.registry)
        .map_err(|e| AppError::BadRequest(format!("workflow validation failed: {e}")))?;

    let task_id = Uuid::new_v4().to_string();
    let run = Run {
        id: task_id.clone(),
        status: RunStatus::Pending,
        graph,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        results: None,
        error: None,
        cancel_token: CancellationToken::new(),
    };
    state.inner.runs.insert(task_id.clone(), run);

    let state_clone = state.clone();
    let run_id = task_id.clone();
    tokio::spawn(async move {
        drive_run(state_clone, run_id).await;
    });

    info!(%task_id, "run submitted");

    Ok((
        StatusCode::CREATED,
        Json(ExecuteResponse {
            task_id,
            status: RunStatus::Pending,
        }),
    ))
}

/// Waits for a concurrency permit, executes the run, and records the
/// terminal snapshot. Cancellation while queued resolves the run without
/// executing anything.
async fn drive_run(state: AppState, run_id: String) {
    let (graph, cancel_token) = {
        let Some(run) = state.inner.runs.get(&run_id) else {
            return;
        };
        (run.graph.clone(), run.cancel_token.clone())
    };

    let _permit = tokio::select! {
        permit = state.inner.run_semaphore.clone().acquire_owned() => {
            match permit {
                Ok(permit) => permit,
                Err(_) => return,
            }
        }
        _ = cancel_token.cancelled() => {
            if let Some(mut run) = state.inner.runs.get_mut(&run_id) {
                run.status = RunStatus::Cancelled;
                run.completed_at = Some(Utc::now());
            }
            return;
        }
    };

    if let Some(mut run) = state.inner.runs.get_mut(&run_id) {
        if run.status != RunStatus::Pending {
            return;
        }
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
    } else {
        return;
    }

    let report = execute(
        &graph,
        Arc::clone(&state.inner.registry),
        ExecutorOptions {
            run_id: Some(run_id.clone()),
            cancel: cancel_token,
            nesting_depth: 0,
        },
    )
    .await;

    let Some(mut run) = state.inner.runs.get_mut(&run_id) else {
        return;
    };
    run.completed_at = Some(Utc::now());

    match report {
        Ok(report) => {
            run.status = report.status;
            run.results = Some(report.results);
            run.error = report.error;
        }
        Err(err) => {
            error!(%run_id, error = %err, "run failed before execution");
            run.status = RunStatus::Error;
            run.error = Some(RunError {
                node_id: String::new(),
                message: err.to_string(),
            });
        }
    }
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Error => "error",
        RunStatus::Cancelled => "cancelled",
    }
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    let Some(run) = state.inner.runs.get(&task_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(TaskStatusResponse {
                task_id,
                status: "not_found".to_string(),
                result: None,
                error: None,
                created_at: None,
                started_at: None,
                completed_at: None,
            }),
        )
            .into_response();
    };

    Json(TaskStatusResponse {
        task_id: run.id.clone(),
        status: status_label(run.status).to_string(),
        result: run.results.clone(),
        error: run.error.as_ref().map(|e| {
            if e.node_id.is_empty() {
                e.message.clone()
            } else {
                format!("node '{}': {}", e.node_id, e.message)
            }
        }),
        created_at: Some(run.created_at),
        started_at: run.started_at,
        completed_at: run.completed_at,
    })
    .into_response()
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let run = state
        .inner
        .runs
        .get(&task_id)
        .ok_or_else(|| AppError::NotFound(format!("task not found: {task_id}")))?;

    // Idempotent; completed runs keep their terminal status, the token
    // trip is simply a no-op for them.
    run.cancel_token.cancel();
    info!(%task_id, "cancel requested");

    Ok(Json(CancelResponse {
        task_id,
        status: "cancelled".to_string(),
    }))
}

async fn validate_workflow(
    State(state): State<AppState>,
    Json(payload): Json<ValidateRequest>,
) -> Json<ValidationReport> {
    let graph_value = serde_json::json!({
        "nodes": payload.nodes,
        "connections": if payload.connections.is_null() {
            serde_json::json!([])
        } else {
            payload.connections
        },
    });

    let graph: WorkflowGraph = match serde_json::from_value(graph_value) {
        Ok(graph) => graph,
        Err(e) => {
            return Json(ValidationReport {
                valid: false,
                errors: vec![format!("invalid workflow description: {e}")],
                warnings: vec![],
            })
        }
    };

    Json(validate_sub_workflow(
        &graph,
        payload.result_node_id.as_deref(),
        payload.result_port_name.as_deref(),
        &state.inner.registry,
    ))
}

async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeDescriptor>> {
    Json(state.inner.registry.descriptors())
}

async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<WorkflowListResponse>, AppError> {
    let workflows = state.inner.workflows.list()?;
    Ok(Json(WorkflowListResponse { workflows }))
}

async fn save_workflow(
    State(state): State<AppState>,
    Json(payload): Json<SaveWorkflowRequest>,
) -> Result<StatusCode, AppError> {
    sanitize_workflow_name(&payload.name).map_err(|e| AppError::BadRequest(e.to_string()))?;

    // Saved workflows must at least parse as a graph; unknown node types
    // are allowed so workflows can be stored before their nodes ship.
    serde_json::from_value::<WorkflowGraph>(payload.workflow.clone())
        .map_err(|e| AppError::BadRequest(format!("invalid workflow: {e}")))?;

    state.inner.workflows.save(&payload.name, &payload.workflow)?;
    info!(name = %payload.name, "workflow saved");
    Ok(StatusCode::CREATED)
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    sanitize_workflow_name(&name).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let workflow = state
        .inner
        .workflows
        .load(&name)?
        .ok_or_else(|| AppError::NotFound(format!("workflow not found: {name}")))?;
    Ok(Json(workflow))
}

async fn delete_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    sanitize_workflow_name(&name).map_err(|e| AppError::BadRequest(e.to_string()))?;

    if state.inner.workflows.delete(&name)? {
        info!(name = %name, "workflow deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("workflow not found: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::build_default_registry;

    #[test]
    fn test_status_labels_match_wire_format() {
        assert_eq!(status_label(RunStatus::Pending), "pending");
        assert_eq!(status_label(RunStatus::Running), "running");
        assert_eq!(status_label(RunStatus::Completed), "completed");
        assert_eq!(status_label(RunStatus::Error), "error");
        assert_eq!(status_label(RunStatus::Cancelled), "cancelled");
    }

    #[test]
    fn test_app_state_builds_router() {
        let state = AppState::new(
            Arc::new(build_default_registry()),
            AppConfig::default(),
            std::env::temp_dir().join("trellis-router-test"),
        );
        let _router = app_router(state);
    }
}
