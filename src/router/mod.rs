use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::broadcast::{category_for, Broadcaster, RealtimeEvent};
use crate::connection::{Connection, MessageDispatch};
use crate::error::{AppError, AppResult};
use crate::hub::Hub;
use crate::presence::{PresenceStatus, PresenceTracker};
use crate::subscription::{SubscriptionManager, Topic};

/// Decoded inbound client frame (spec §6: `{id, type, payload}`).
#[derive(Clone, Debug)]
pub struct ClientFrame {
    pub id: String,
    pub msg_type: String,
    pub payload: Value,
}

#[derive(Deserialize)]
struct RawFrame {
    id: Option<String>,
    #[serde(rename = "type")]
    msg_type: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Cheaply-cloned bundle of the collaborators handlers need. Cloning a
/// `Router` only bumps reference counts; handler functions take this by
/// value so the dispatched future can be fully `'static`.
#[derive(Clone)]
struct RouterDeps {
    hub: Arc<Hub>,
    subscriptions: Arc<SubscriptionManager>,
    broadcaster: Arc<Broadcaster>,
    presence: Arc<PresenceTracker>,
}

type HandlerResult = AppResult<Option<(&'static str, Value)>>;
type HandlerFn = fn(RouterDeps, Arc<Connection>, ClientFrame) -> BoxFuture<'static, HandlerResult>;

/// Handler table keyed by client message type (spec §4.8). Inbound frames
/// are JSON-decoded, validated, and dispatched to the matching handler;
/// malformed frames or unknown types produce an error frame instead of a
/// handler error.
pub struct Router {
    deps: RouterDeps,
    handlers: HashMap<&'static str, HandlerFn>,
}

impl Router {
    pub fn new(hub: Arc<Hub>, subscriptions: Arc<SubscriptionManager>, broadcaster: Arc<Broadcaster>, presence: Arc<PresenceTracker>) -> Self {
        let mut handlers: HashMap<&'static str, HandlerFn> = HashMap::new();
        handlers.insert("authenticate", |d, c, f| Box::pin(handle_authenticate(d, c, f)));
        handlers.insert("subscribe", |d, c, f| Box::pin(handle_subscribe(d, c, f)));
        handlers.insert("unsubscribe", |d, c, f| Box::pin(handle_unsubscribe(d, c, f)));
        handlers.insert("presence.update", |d, c, f| Box::pin(handle_presence_update(d, c, f)));
        handlers.insert("presence.query", |d, c, f| Box::pin(handle_presence_query(d, c, f)));
        handlers.insert("typing.start", |d, c, f| Box::pin(handle_typing(d, c, f, "typing.start")));
        handlers.insert("typing.stop", |d, c, f| Box::pin(handle_typing(d, c, f, "typing.stop")));
        handlers.insert("mark.read", |d, c, f| Box::pin(handle_mark(d, c, f, "message.read")));
        handlers.insert("mark.delivered", |d, c, f| Box::pin(handle_mark(d, c, f, "message.delivered")));
        handlers.insert("call.offer", |d, c, f| Box::pin(handle_call_signal(d, c, f, "call.offer")));
        handlers.insert("call.answer", |d, c, f| Box::pin(handle_call_signal(d, c, f, "call.answer")));
        handlers.insert("call.ice", |d, c, f| Box::pin(handle_call_signal(d, c, f, "call.ice")));
        handlers.insert("call.hangup", |d, c, f| Box::pin(handle_call_signal(d, c, f, "call.hangup")));
        handlers.insert("ping", |d, c, f| Box::pin(handle_ping(d, c, f)));
        handlers.insert("disconnect", |d, c, f| Box::pin(handle_disconnect(d, c, f)));

        Self {
            deps: RouterDeps { hub, subscriptions, broadcaster, presence },
            handlers,
        }
    }

    async fn send_error(conn: &Connection, code: &str, message: impl Into<String>, request_id: Option<String>) {
        let frame = json!({
            "id": Uuid::new_v4(),
            "type": "error",
            "request_id": request_id,
            "payload": { "code": code, "message": message.into() },
            "timestamp": Utc::now(),
        });
        let _ = conn.send(frame.to_string()).await;
    }

    async fn send_response(conn: &Connection, frame_type: &str, payload: Value, request_id: String) {
        let frame = json!({
            "id": Uuid::new_v4(),
            "type": frame_type,
            "request_id": request_id,
            "payload": payload,
            "timestamp": Utc::now(),
        });
        let _ = conn.send(frame.to_string()).await;
    }
}

impl MessageDispatch for Router {
    fn dispatch(&self, conn: Arc<Connection>, raw: String) -> BoxFuture<'static, ()> {
        let deps = self.deps.clone();
        let handler = {
            let raw_frame: Result<RawFrame, _> = serde_json::from_str(&raw);
            match raw_frame {
                Err(_) => None,
                Ok(parsed) => {
                    let Some(id) = parsed.id.filter(|id| !id.is_empty()) else {
                        return Box::pin(async move {
                            Router::send_error(&conn, "invalid_structure", "frame is missing \"id\"", None).await;
                        });
                    };
                    let Some(msg_type) = parsed.msg_type.filter(|t| !t.is_empty()) else {
                        return Box::pin(async move {
                            Router::send_error(&conn, "invalid_structure", "frame is missing \"type\"", Some(id)).await;
                        });
                    };
                    match self.handlers.get(msg_type.as_str()) {
                        Some(h) => Some((*h, ClientFrame { id, msg_type, payload: parsed.payload })),
                        None => {
                            return Box::pin(async move {
                                Router::send_error(&conn, "unknown_type", format!("unknown message type: {msg_type}"), Some(id)).await;
                            });
                        }
                    }
                }
            }
        };

        match handler {
            None => Box::pin(async move {
                Router::send_error(&conn, "invalid_structure", "malformed json frame", None).await;
            }),
            Some((handler_fn, frame)) => {
                let request_id = frame.id.clone();
                Box::pin(async move {
                    match handler_fn(deps, conn.clone(), frame).await {
                        Ok(Some((frame_type, payload))) => {
                            Router::send_response(&conn, frame_type, payload, request_id).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            Router::send_error(&conn, "handler_error", e.to_string(), Some(request_id)).await;
                        }
                    }
                })
            }
        }
    }
}

fn field_str<'a>(payload: &'a Value, key: &str) -> AppResult<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation(format!("missing or non-string field: {key}")))
}

fn field_uuid(payload: &Value, key: &str) -> AppResult<Uuid> {
    Uuid::parse_str(field_str(payload, key)?).map_err(|_| AppError::Validation(format!("invalid uuid field: {key}")))
}

fn resource_id_from(payload: &Value, topic: Topic) -> String {
    if let Some(explicit) = payload.get("resource_id").and_then(Value::as_str) {
        return explicit.to_string();
    }
    if let Some(filters) = payload.get("filters").and_then(Value::as_object) {
        if let Some((_, v)) = filters.iter().next() {
            if let Some(s) = v.as_str() {
                return s.to_string();
            }
        }
    }
    topic.default_resource_id().to_string()
}

async fn handle_authenticate(_deps: RouterDeps, conn: Arc<Connection>, _frame: ClientFrame) -> HandlerResult {
    let metadata = conn.metadata().await;
    Ok(Some(("authenticated", json!({ "user_id": metadata.user_id }))))
}

async fn handle_subscribe(deps: RouterDeps, conn: Arc<Connection>, frame: ClientFrame) -> HandlerResult {
    let topic_name = field_str(&frame.payload, "topic")?;
    let topic = Topic::from_str(topic_name).map_err(|_| AppError::Validation(format!("unknown topic: {topic_name}")))?;
    let resource_id = resource_id_from(&frame.payload, topic);

    deps.subscriptions.subscribe(&conn, topic, resource_id.clone()).await;
    Ok(Some(("subscribed", json!({ "topic": topic_name, "resource_id": resource_id }))))
}

async fn handle_unsubscribe(deps: RouterDeps, conn: Arc<Connection>, frame: ClientFrame) -> HandlerResult {
    let topic_name = field_str(&frame.payload, "topic")?;
    let topic = Topic::from_str(topic_name).map_err(|_| AppError::Validation(format!("unknown topic: {topic_name}")))?;

    deps.subscriptions.unsubscribe(&conn.id, topic).await;
    Ok(Some(("unsubscribed", json!({ "topic": topic_name }))))
}

async fn handle_presence_update(deps: RouterDeps, conn: Arc<Connection>, frame: ClientFrame) -> HandlerResult {
    let status: PresenceStatus = serde_json::from_value(frame.payload.get("status").cloned().unwrap_or(Value::Null))
        .map_err(|_| AppError::Validation("invalid or missing status".to_string()))?;
    let custom_status = frame.payload.get("custom_status").and_then(Value::as_str).map(str::to_string);

    let user_id = conn.metadata().await.user_id;
    deps.presence.update_presence(user_id, status, custom_status).await;
    Ok(None)
}

async fn handle_presence_query(deps: RouterDeps, _conn: Arc<Connection>, frame: ClientFrame) -> HandlerResult {
    let user_id = field_uuid(&frame.payload, "user_id")?;
    let snapshot = deps.presence.get_presence(user_id).await;
    let payload = serde_json::to_value(&snapshot).map_err(|_| AppError::Internal)?;
    Ok(Some(("presence.query.result", payload)))
}

async fn handle_typing(deps: RouterDeps, conn: Arc<Connection>, frame: ClientFrame, event_type: &'static str) -> HandlerResult {
    let conversation_id = field_str(&frame.payload, "conversation_id")?.to_string();
    let sender = conn.metadata().await.user_id;

    let event = RealtimeEvent {
        id: Uuid::new_v4(),
        category: category_for(event_type).expect("typing.* is a recognized type"),
        event_type: event_type.to_string(),
        timestamp: Utc::now(),
        recipients: vec![],
        sender: Some(sender),
        payload: json!({ "conversation_id": conversation_id, "user_id": sender }),
        priority: None,
        ttl_secs: None,
    };

    let mut exclude = HashSet::new();
    exclude.insert(conn.id.clone());
    deps.broadcaster.broadcast_to_topic(Topic::Typing, &conversation_id, &event, &exclude).await;
    Ok(None)
}

async fn handle_mark(deps: RouterDeps, conn: Arc<Connection>, frame: ClientFrame, event_type: &'static str) -> HandlerResult {
    let conversation_id = field_str(&frame.payload, "conversation_id")?.to_string();
    let message_id = field_str(&frame.payload, "message_id")?.to_string();
    let sender = conn.metadata().await.user_id;

    let event = RealtimeEvent {
        id: Uuid::new_v4(),
        category: category_for(event_type).expect("message.* is a recognized type"),
        event_type: event_type.to_string(),
        timestamp: Utc::now(),
        recipients: vec![],
        sender: Some(sender),
        payload: json!({ "conversation_id": conversation_id, "message_id": message_id, "user_id": sender }),
        priority: None,
        ttl_secs: None,
    };

    let mut exclude = HashSet::new();
    exclude.insert(conn.id.clone());
    deps.broadcaster
        .broadcast_to_topic(Topic::Conversation, &conversation_id, &event, &exclude)
        .await;
    Ok(None)
}

async fn handle_call_signal(deps: RouterDeps, conn: Arc<Connection>, frame: ClientFrame, event_type: &'static str) -> HandlerResult {
    let target_user_id = field_uuid(&frame.payload, "target_user_id")?;
    let sender = conn.metadata().await.user_id;

    let event = RealtimeEvent {
        id: Uuid::new_v4(),
        category: category_for(event_type).expect("call.* is a recognized type"),
        event_type: event_type.to_string(),
        timestamp: Utc::now(),
        recipients: vec![target_user_id],
        sender: Some(sender),
        payload: frame.payload.get("data").cloned().unwrap_or(Value::Null),
        priority: Some(crate::broadcast::Priority::High),
        ttl_secs: None,
    };

    deps.broadcaster.broadcast_to_user(target_user_id, &event).await;
    Ok(None)
}

async fn handle_ping(_deps: RouterDeps, _conn: Arc<Connection>, _frame: ClientFrame) -> HandlerResult {
    Ok(Some(("pong", json!({}))))
}

async fn handle_disconnect(_deps: RouterDeps, conn: Arc<Connection>, _frame: ClientFrame) -> HandlerResult {
    conn.close();
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{backpressure::PressureStrategy, ConnectionMetadata, ConnectionState, OutboundQueue, Platform};
    use crate::subscription::SubscriptionManager;

    fn make_conn(id: &str, user_id: Uuid) -> Arc<Connection> {
        let queue = OutboundQueue::new(10, 5, 1, PressureStrategy::DropNewest);
        let metadata = ConnectionMetadata {
            user_id,
            device_id: id.to_string(),
            platform: Platform::Web,
            device_name: None,
            ip: None,
            user_agent: None,
            app_version: None,
            connected_at: Utc::now(),
        };
        let conn = Connection::new(id.to_string(), metadata, queue);
        conn.transition(ConnectionState::Connected).unwrap();
        conn
    }

    fn make_router() -> Router {
        let hub = Arc::new(Hub::new());
        let subs = Arc::new(SubscriptionManager::new());
        let broadcaster = Arc::new(Broadcaster::new(hub.clone(), subs.clone()));
        let presence = Arc::new(PresenceTracker::new(hub.clone(), broadcaster.clone()));
        Router::new(hub, subs, broadcaster, presence)
    }

    #[tokio::test]
    async fn malformed_json_yields_invalid_structure_without_request_id() {
        let router = make_router();
        let conn = make_conn("c1", Uuid::new_v4());
        router.dispatch(conn.clone(), "not json".to_string()).await;

        let raw = conn.queue().recv().await.unwrap();
        let frame: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["payload"]["code"], "invalid_structure");
        assert!(frame["request_id"].is_null());
    }

    #[tokio::test]
    async fn unknown_type_correlates_request_id() {
        let router = make_router();
        let conn = make_conn("c1", Uuid::new_v4());
        router
            .dispatch(conn.clone(), json!({"id": "req-1", "type": "bogus.thing", "payload": {}}).to_string())
            .await;

        let raw = conn.queue().recv().await.unwrap();
        let frame: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["payload"]["code"], "unknown_type");
        assert_eq!(frame["request_id"], "req-1");
    }

    #[tokio::test]
    async fn ping_replies_with_pong() {
        let router = make_router();
        let conn = make_conn("c1", Uuid::new_v4());
        router
            .dispatch(conn.clone(), json!({"id": "req-2", "type": "ping", "payload": {}}).to_string())
            .await;

        let raw = conn.queue().recv().await.unwrap();
        let frame: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(frame["type"], "pong");
        assert_eq!(frame["request_id"], "req-2");
    }

    #[tokio::test]
    async fn subscribe_then_typing_start_reaches_other_subscriber_not_self() {
        let hub = Arc::new(Hub::new());
        let subs = Arc::new(SubscriptionManager::new());
        let broadcaster = Arc::new(Broadcaster::new(hub.clone(), subs.clone()));
        let presence = Arc::new(PresenceTracker::new(hub.clone(), broadcaster.clone()));
        let router = Router::new(hub.clone(), subs.clone(), broadcaster.clone(), presence);

        let c1 = make_conn("c1", Uuid::new_v4());
        let c2 = make_conn("c2", Uuid::new_v4());
        hub.register(c1.metadata().await.user_id, c1.clone()).await;
        hub.register(c2.metadata().await.user_id, c2.clone()).await;

        router
            .dispatch(c1.clone(), json!({"id":"1","type":"subscribe","payload":{"topic":"typing","resource_id":"conv-x"}}).to_string())
            .await;
        c1.queue().recv().await; // drain the "subscribed" ack

        router
            .dispatch(c2.clone(), json!({"id":"2","type":"subscribe","payload":{"topic":"typing","resource_id":"conv-x"}}).to_string())
            .await;
        c2.queue().recv().await;

        router
            .dispatch(c1.clone(), json!({"id":"3","type":"typing.start","payload":{"conversation_id":"conv-x"}}).to_string())
            .await;

        assert!(c1.queue().is_empty());
        let raw = c2.queue().recv().await.unwrap();
        let frame: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(frame["type"], "typing.start");
    }

    #[tokio::test]
    async fn handler_validation_error_yields_handler_error_frame() {
        let router = make_router();
        let conn = make_conn("c1", Uuid::new_v4());
        router
            .dispatch(conn.clone(), json!({"id":"req-4","type":"subscribe","payload":{}}).to_string())
            .await;

        let raw = conn.queue().recv().await.unwrap();
        let frame: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["payload"]["code"], "handler_error");
    }
}
