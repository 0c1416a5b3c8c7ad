//! Live location REST handlers
//!
//! Reads always go through the staleness filter. Writes land in the store
//! unchanged, so producers own `timestamp` and `lastSeen`.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use tracing::{debug, warn};

use safetrack_common::presence::{ActiveView, AttendeeLocationRecord, EventId, PresenceStore, UserId};
use safetrack_common::Error;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

type ApiError = (StatusCode, Json<StatusResponse>);

fn error_response(code: StatusCode, message: impl Into<String>) -> ApiError {
    (
        code,
        Json(StatusResponse {
            status: format!("error: {}", message.into()),
        }),
    )
}

/// Map store-level errors onto HTTP status codes
fn map_store_error(err: Error) -> ApiError {
    match err {
        Error::InvalidRecord(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        other => {
            warn!("Presence store failure: {}", other);
            error_response(StatusCode::SERVICE_UNAVAILABLE, other.to_string())
        }
    }
}

/// GET /events/:event_id/live_locations - active attendees for an event
pub async fn get_live_locations(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<ActiveView>, ApiError> {
    let event_id = EventId::new(event_id);
    let view = state.subscriber.read_active(&event_id).await.map_err(map_store_error)?;
    debug!(event = %event_id, active = view.len(), "Served active view");
    Ok(Json(view))
}

/// PUT /events/:event_id/live_locations/:user_id - upsert a record
pub async fn put_live_location(
    State(state): State<AppState>,
    Path((event_id, user_id)): Path<(String, String)>,
    body: Result<Json<AttendeeLocationRecord>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(record) = body.map_err(|rejection| error_response(StatusCode::BAD_REQUEST, rejection.body_text()))?;

    let user_id = UserId::new(user_id);
    if record.user_id != user_id {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            format!("body userId {} does not match path {}", record.user_id, user_id),
        ));
    }

    state
        .store
        .upsert(&EventId::new(event_id), record)
        .await
        .map_err(map_store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /events/:event_id/live_locations/:user_id - remove a record
///
/// Deleting an absent record succeeds.
pub async fn delete_live_location(
    State(state): State<AppState>,
    Path((event_id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .delete(&EventId::new(event_id), &UserId::new(user_id))
        .await
        .map_err(map_store_error)?;
    Ok(StatusCode::NO_CONTENT)
}
