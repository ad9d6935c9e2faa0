use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use cadence_shared::{Automation, Enrollment, LogEntry};

use crate::automations::{AutomationDetail, CreateAutomation, LogQuery, ReplaceSteps, UpdateAutomation};
use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AutomationLogQuery {
    pub contact_id: Option<Uuid>,
    pub enrollment_id: Option<Uuid>,
    pub limit: Option<i64>,
}

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_automations).post(create_automation))
        .route("/:id", get(get_automation).put(update_automation))
        .route("/:id/steps", put(replace_steps))
        .route("/:id/activate", post(activate_automation))
        .route("/:id/pause", post(pause_automation))
        .route("/:id/enrollments", get(list_enrollments))
        .route("/:id/logs", get(automation_logs))
}

async fn list_automations(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Automation>>> {
    Ok(Json(state.automations.list().await?))
}

async fn create_automation(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateAutomation>,
) -> ApiResult<(StatusCode, Json<AutomationDetail>)> {
    let detail = state.automations.create(payload).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn get_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AutomationDetail>> {
    Ok(Json(state.automations.get(id).await?))
}

async fn update_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAutomation>,
) -> ApiResult<Json<Automation>> {
    Ok(Json(state.automations.update(id, payload).await?))
}

async fn replace_steps(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReplaceSteps>,
) -> ApiResult<Json<AutomationDetail>> {
    Ok(Json(state.automations.replace_steps(id, payload).await?))
}

async fn activate_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Automation>> {
    Ok(Json(state.automations.activate(id).await?))
}

async fn pause_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Automation>> {
    Ok(Json(state.automations.pause(id).await?))
}

async fn list_enrollments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<ListQuery>,
) -> ApiResult<Json<Vec<Enrollment>>> {
    let limit = params.limit.unwrap_or(100);
    Ok(Json(state.automations.enrollments(id, limit).await?))
}

async fn automation_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<AutomationLogQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    let query = LogQuery {
        automation_id: Some(id),
        enrollment_id: params.enrollment_id,
        contact_id: params.contact_id,
        limit: params.limit,
    };
    Ok(Json(state.automations.logs(&query).await?))
}
