use std::str::FromStr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use uuid::Uuid;

use crate::connection::{backpressure::PressureStrategy, Connection, ConnectionMetadata, ConnectionState, MessageDispatch, OutboundQueue, Platform};
use crate::error::AppError;
use crate::state::AppState;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn check_origin(headers: &HeaderMap, allowed: &[String]) -> bool {
    let Some(origin) = header_str(headers, "origin") else {
        return false;
    };
    allowed.iter().any(|a| a == origin)
}

/// `GET /ws` upgrade pipeline (spec §4.11).
pub async fn upgrade(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    if state.is_shutting_down() {
        return AppError::ServiceUnavailable.into_response();
    }

    // 1. Extract and validate the user id.
    let Some(user_id_raw) = header_str(&headers, "x-user-id") else {
        return AppError::Validation("missing X-User-ID header".to_string()).into_response();
    };
    let Ok(user_id) = Uuid::from_str(user_id_raw) else {
        return AppError::Validation("X-User-ID is not a valid UUID".to_string()).into_response();
    };

    let Some(device_id) = header_str(&headers, "x-device-id") else {
        return AppError::Validation("missing X-Device-ID header".to_string()).into_response();
    };
    let device_id = device_id.to_string();

    let Some(platform_raw) = header_str(&headers, "x-platform") else {
        return AppError::Validation("missing X-Platform header".to_string()).into_response();
    };
    let Ok(platform) = Platform::from_str(platform_raw) else {
        return AppError::Validation(format!("unsupported X-Platform: {platform_raw}")).into_response();
    };

    // 2. Optional user-existence check.
    match state.user_directory.validate_user(user_id).await {
        Ok(true) => {}
        Ok(false) => return AppError::NotFound(format!("user {user_id} not found")).into_response(),
        Err(e) => return e.into_response(),
    }

    // Per-user device cap, enforced at admission (spec §6, §9 open question).
    if state.hub.device_count(user_id).await >= state.config.websocket.max_connections_per_user {
        return AppError::MaxConnectionsReached.into_response();
    }

    // 3. Origin check.
    if state.config.websocket.check_origin && !check_origin(&headers, &state.config.websocket.allowed_origins) {
        return AppError::Forbidden("origin not allowed".to_string()).into_response();
    }

    let device_name = header_str(&headers, "x-device-name").map(str::to_string);
    let user_agent = header_str(&headers, "user-agent").map(str::to_string);
    let app_version = header_str(&headers, "x-app-version").map(str::to_string);
    let ip = header_str(&headers, "x-forwarded-for").map(str::to_string);

    let metadata = ConnectionMetadata {
        user_id,
        device_id,
        platform,
        device_name,
        ip,
        user_agent,
        app_version,
        connected_at: Utc::now(),
    };

    let conn_id = Uuid::new_v4().to_string();
    let ws_config = Arc::new(state.config.websocket.clone());

    // The `max_message_size` configured for the gateway is enforced in the
    // read pump, which sends a `MESSAGE_TOO_LARGE` error frame and keeps the
    // connection open (spec §4.3, §7). Leaving axum's own frame-size limit
    // at its default (far above ours) keeps that in-loop check reachable —
    // if axum enforced the same limit here, it would already have severed
    // the stream before the pump ever saw the oversize frame.
    ws.on_upgrade(move |socket| async move {
        let queue = OutboundQueue::new(
            ws_config.broadcast_buffer,
            ws_config.queue_high_watermark,
            ws_config.queue_low_watermark,
            PressureStrategy::DropNewest,
        );
        let conn = Connection::new(conn_id, metadata, queue);

        // 5. Admit to the Connection Manager; reject over-capacity.
        if state.manager.add(conn.clone()).await.is_err() {
            conn.close();
            return;
        }

        // 6. Transition to Connected, register in Hub, spawn pumps.
        if conn.transition(ConnectionState::Connected).is_err() {
            state.manager.remove(&conn.id).await;
            return;
        }

        state.hub.register(user_id, conn.clone()).await;
        state.presence.on_user_connected(user_id).await;

        let dispatcher: Arc<dyn MessageDispatch> = state.router.clone();
        conn.clone()
            .run_pumps(socket, ws_config.clone(), state.rate_limiters.clone(), dispatcher)
            .await;

        // Subscription Manager / Hub / presence teardown all happen via
        // the Connection Manager's on_disconnect hook (state.rs), the
        // same path the stale sweep drives.
        state.manager.remove(&conn.id).await;
    })
}
