use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

use cadence_shared::LogEntry;

use super::automations::ListQuery;
use crate::automations::{EnrollmentView, LogQuery};
use crate::error::ApiResult;
use crate::AppState;

pub fn enrollment_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:id", get(get_enrollment))
}

pub fn contact_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:id/logs", get(contact_logs))
}

/// Status, current step and step history of one enrollment
async fn get_enrollment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EnrollmentView>> {
    Ok(Json(state.automations.enrollment(id).await?))
}

/// Everything automations did to a contact, newest first
async fn contact_logs(
    State(state): State<Arc<AppState>>,
    Path(contact_id): Path<Uuid>,
    Query(params): Query<ListQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    let mut query = LogQuery::for_contact(contact_id);
    query.limit = params.limit;
    Ok(Json(state.automations.logs(&query).await?))
}
