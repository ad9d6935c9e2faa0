use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::database;
use crate::error::{ApiResult, AppError};
use crate::jobs::JobExecutionLog;
use crate::AppState;

pub mod automations;
pub mod enrollments;
pub mod events;

pub use automations::automation_routes;
pub use enrollments::{contact_routes, enrollment_routes};
pub use events::event_routes;

/// Everything mounted under `/api/v1`
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/automations", automation_routes())
        .nest("/enrollments", enrollment_routes())
        .nest("/contacts", contact_routes())
        .nest("/events", event_routes())
        .nest("/jobs", job_routes())
}

fn job_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/executions", get(job_executions))
        .route("/:name/run", post(run_job))
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let database_ok = database::health_check(&state.db_pool).await;
    let status = if database_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(json!({
            "status": if database_ok { "healthy" } else { "degraded" },
            "service": "cadence-api",
            "database": database_ok,
            "pool": database::pool_stats(&state.db_pool),
        })),
    )
}

async fn job_executions(State(state): State<Arc<AppState>>) -> Json<Vec<JobExecutionLog>> {
    match &state.jobs {
        Some(jobs) => Json(jobs.get_execution_logs().await),
        None => Json(Vec::new()),
    }
}

async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<JobExecutionLog>> {
    let jobs = state
        .jobs
        .as_ref()
        .ok_or_else(|| AppError::Conflict("Background jobs are not running".to_string()))?;
    let entry = jobs
        .run_job_now(&name)
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    Ok(Json(entry))
}
