use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::validate_ingestion_auth;
use crate::broadcast::{category_for, Priority, RealtimeEvent};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// `POST /broadcast` request body (spec §6).
#[derive(Deserialize)]
pub struct BroadcastRequest {
    pub event_type: String,
    pub recipients: Vec<Uuid>,
    pub sender: Option<Uuid>,
    pub payload: Value,
    pub priority: Option<u8>,
    pub ttl: Option<u64>,
}

#[derive(Serialize)]
pub struct BroadcastResponse {
    pub event_id: Uuid,
    pub recipients: usize,
    pub online_recipients: usize,
    pub timestamp: DateTime<Utc>,
}

fn parse_priority(value: Option<u8>) -> AppResult<Option<Priority>> {
    match value {
        None => Ok(None),
        Some(0) => Ok(Some(Priority::Low)),
        Some(1) => Ok(Some(Priority::Normal)),
        Some(2) => Ok(Some(Priority::High)),
        Some(other) => Err(AppError::Validation(format!("priority must be 0, 1, or 2, got {other}"))),
    }
}

/// Handler for `POST /broadcast` (spec §4.10). Authenticates via shared
/// secret + source-service header, validates the body, assigns an event id
/// and category, then hands recipients with zero live devices to the
/// Offline Dispatcher.
pub async fn broadcast(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<BroadcastRequest>) -> AppResult<Json<BroadcastResponse>> {
    if state.is_shutting_down() {
        return Err(AppError::ServiceUnavailable);
    }

    let source_service = validate_ingestion_auth(&headers, &state.config.ingestion.shared_secret)?;

    if body.recipients.is_empty() {
        return Err(AppError::Validation("recipients must not be empty".to_string()));
    }
    if body.payload.is_null() {
        return Err(AppError::Validation("payload must not be null".to_string()));
    }
    let category = category_for(&body.event_type).ok_or_else(|| AppError::Validation(format!("unknown event_type: {}", body.event_type)))?;
    let priority = parse_priority(body.priority)?;

    let event_id = Uuid::new_v4();
    let timestamp = Utc::now();
    let event = RealtimeEvent {
        id: event_id,
        event_type: body.event_type.clone(),
        category,
        timestamp,
        recipients: body.recipients.clone(),
        sender: body.sender,
        payload: body.payload.clone(),
        priority,
        ttl_secs: body.ttl,
    };

    tracing::info!(%event_id, event_type = %body.event_type, %source_service, recipients = body.recipients.len(), "ingesting event");

    let mut online_recipients = 0;
    let mut offline_recipients = Vec::new();
    for &user_id in &body.recipients {
        let devices_reached = state.broadcaster.broadcast_to_user(user_id, &event).await;
        if devices_reached > 0 {
            online_recipients += 1;
        } else {
            offline_recipients.push(user_id);
        }
    }

    for user_id in offline_recipients {
        state
            .offline
            .dispatch(event_id, user_id, &body.event_type, body.payload.clone(), body.priority, body.ttl)
            .await;
    }

    Ok(Json(BroadcastResponse {
        event_id,
        recipients: body.recipients.len(),
        online_recipients,
        timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_priority_maps_known_values() {
        assert!(matches!(parse_priority(Some(0)).unwrap(), Some(Priority::Low)));
        assert!(matches!(parse_priority(Some(1)).unwrap(), Some(Priority::Normal)));
        assert!(matches!(parse_priority(Some(2)).unwrap(), Some(Priority::High)));
        assert!(parse_priority(None).unwrap().is_none());
    }

    #[test]
    fn parse_priority_rejects_out_of_range() {
        assert!(parse_priority(Some(9)).is_err());
    }
}
