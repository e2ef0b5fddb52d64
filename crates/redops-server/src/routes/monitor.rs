//! Read-only monitoring: execution records, statistics, endpoint health.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use redops_core::tools::{ExecutionFilter, ExecutionStatus};

use crate::error::AppError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/executions", get(list_executions))
        .route("/executions/:id", get(get_execution))
        .route("/stats", get(stats))
        .route("/endpoints", get(endpoints))
}

#[derive(Debug, Deserialize)]
struct ExecutionsQuery {
    tool: Option<String>,
    status: Option<String>,
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    50
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some("pending") => Some(ExecutionStatus::Pending),
        Some("running") => Some(ExecutionStatus::Running),
        Some("completed") => Some(ExecutionStatus::Completed),
        Some("failed") => Some(ExecutionStatus::Failed),
        Some(other) => {
            return Err(AppError::BadRequest(format!(
                "unknown execution status: {other}"
            )))
        }
    };

    let filter = ExecutionFilter {
        tool_name: query.tool.filter(|t| !t.is_empty()),
        status,
    };
    let executions = state.registry.list_executions(&filter, query.page, query.limit);
    Ok(Json(json!({
        "executions": executions,
        "page": query.page,
        "limit": query.limit,
    })))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let execution = state
        .registry
        .get_execution(&id)
        .ok_or_else(|| AppError::NotFound(format!("execution {id} not found")))?;
    Ok(Json(json!({ "execution": execution })))
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "stats": state.registry.get_stats() }))
}

async fn endpoints(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "endpoints": state.remote.list_endpoints().await }))
}
