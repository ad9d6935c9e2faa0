use axum::{extract::State, http::StatusCode, response::Json, routing::post, Router};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::automations::TriggerEvent;
use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct EventAccepted {
    pub event_id: Uuid,
    pub enrollments: Vec<Uuid>,
}

pub fn event_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", post(ingest_event))
}

/// Enroll the event's contact in matching automations
async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<TriggerEvent>,
) -> ApiResult<(StatusCode, Json<EventAccepted>)> {
    tracing::debug!("Received {} event {} for contact {}", event.trigger_type, event.id, event.contact_id);
    let enrollments = state.triggers.handle_event(&event).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EventAccepted { event_id: event.id, enrollments }),
    ))
}
