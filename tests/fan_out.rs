//! Cross-component integration tests exercising the index-consistency and
//! fan-out properties named across the gateway's modules: Hub + Subscription
//! Manager device indices, Broadcaster delivery, the Router's dispatch table,
//! and presence status derivation from live device counts.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use realtime_gateway::broadcast::{category_for, Broadcaster, EventCategory, Priority, RealtimeEvent};
use realtime_gateway::connection::{backpressure::PressureStrategy, Connection, ConnectionMetadata, OutboundQueue, Platform};
use realtime_gateway::hub::Hub;
use realtime_gateway::manager::ConnectionManager;
use realtime_gateway::presence::{PresenceStatus, PresenceTracker};
use realtime_gateway::router::Router;
use realtime_gateway::subscription::{SubscriptionManager, Topic};

fn make_conn(id: &str, user_id: Uuid) -> Arc<Connection> {
    let queue = OutboundQueue::new(16, 8, 2, PressureStrategy::DropNewest);
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
    Connection::new(id.to_string(), metadata, queue)
}

fn event(event_type: &str, recipients: Vec<Uuid>, payload: Value) -> RealtimeEvent {
    RealtimeEvent {
        id: Uuid::new_v4(),
        event_type: event_type.to_string(),
        category: category_for(event_type).unwrap(),
        timestamp: Utc::now(),
        recipients,
        sender: None,
        payload,
        priority: None,
        ttl_secs: None,
    }
}

#[tokio::test]
async fn message_to_a_user_reaches_every_registered_device() {
    let hub = Arc::new(Hub::new());
    let subs = Arc::new(SubscriptionManager::new());
    let broadcaster = Broadcaster::new(hub.clone(), subs);

    let user = Uuid::new_v4();
    let phone = make_conn("phone", user);
    let laptop = make_conn("laptop", user);
    hub.register(user, phone.clone()).await;
    hub.register(user, laptop.clone()).await;

    let ev = event("message.created", vec![user], json!({"text": "hi"}));
    let delivered = broadcaster.broadcast_to_user(user, &ev).await;

    assert_eq!(delivered, 2);
    assert!(phone.queue().recv().await.unwrap().contains("message.created"));
    assert!(laptop.queue().recv().await.unwrap().contains("message.created"));
}

#[tokio::test]
async fn broadcast_to_user_with_no_live_devices_is_a_silent_noop() {
    let hub = Arc::new(Hub::new());
    let subs = Arc::new(SubscriptionManager::new());
    let broadcaster = Broadcaster::new(hub, subs);

    let ev = event("notification.new", vec![Uuid::new_v4()], json!({}));
    let delivered = broadcaster.broadcast_to_user(Uuid::new_v4(), &ev).await;
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn topic_fan_out_reaches_only_current_subscribers_and_shrinks_indices() {
    let hub = Arc::new(Hub::new());
    let subs = Arc::new(SubscriptionManager::new());
    let broadcaster = Broadcaster::new(hub.clone(), subs.clone());

    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conn_a = make_conn("a", alice);
    let conn_b = make_conn("b", bob);
    hub.register(alice, conn_a.clone()).await;
    hub.register(bob, conn_b.clone()).await;

    let convo = "convo-1";
    subs.subscribe(&conn_a, Topic::Conversation, convo).await;
    subs.subscribe(&conn_b, Topic::Conversation, convo).await;

    let ev = event("typing.start", vec![], json!({"conversation_id": convo}));
    let reached = broadcaster
        .broadcast_to_topic(Topic::Conversation, convo, &ev, &Default::default())
        .await;
    assert_eq!(reached, 2);

    // Bob unsubscribes; the next broadcast reaches only Alice, and the
    // reverse index for Bob's connection shrinks to nothing.
    subs.unsubscribe(&conn_b.id, Topic::Conversation).await;
    assert_eq!(subs.subscriber_count(Topic::Conversation, convo).await, 1);

    let _ = conn_a.queue().recv().await;
    let _ = conn_b.queue().recv().await;

    let ev2 = event("typing.stop", vec![], json!({"conversation_id": convo}));
    let reached2 = broadcaster
        .broadcast_to_topic(Topic::Conversation, convo, &ev2, &Default::default())
        .await;
    assert_eq!(reached2, 1);
    assert!(conn_a.queue().recv().await.unwrap().contains("typing.stop"));
    assert!(conn_b.queue().is_empty());
}

#[tokio::test]
async fn presence_is_online_while_any_device_is_registered_and_records_last_seen_at_zero() {
    let hub = Arc::new(Hub::new());
    let subs = Arc::new(SubscriptionManager::new());
    let broadcaster = Arc::new(Broadcaster::new(hub.clone(), subs));
    let presence = PresenceTracker::new(hub.clone(), broadcaster);

    let user = Uuid::new_v4();
    presence.update_presence(user, PresenceStatus::Away, None).await;
    assert_eq!(presence.get_presence(user).await.status, PresenceStatus::Away);

    let conn = make_conn("c1", user);
    hub.register(user, conn.clone()).await;
    let snapshot = presence.get_presence(user).await;
    assert_eq!(snapshot.status, PresenceStatus::Online);
    assert!(snapshot.last_seen_at.is_none());

    hub.unregister(user, "c1").await;
    presence.on_user_disconnected(user).await;
    let snapshot = presence.get_presence(user).await;
    assert_eq!(snapshot.status, PresenceStatus::Offline);
    assert!(snapshot.last_seen_at.is_some());
}

#[tokio::test]
async fn router_ping_pong_and_topic_subscription_round_trip() {
    let hub = Arc::new(Hub::new());
    let subs = Arc::new(SubscriptionManager::new());
    let broadcaster = Arc::new(Broadcaster::new(hub.clone(), subs.clone()));
    let presence = Arc::new(PresenceTracker::new(hub.clone(), broadcaster.clone()));
    let router = Router::new(hub.clone(), subs.clone(), broadcaster.clone(), presence);

    use realtime_gateway::connection::MessageDispatch;

    let user = Uuid::new_v4();
    let conn = make_conn("c1", user);
    hub.register(user, conn.clone()).await;

    router
        .dispatch(conn.clone(), json!({"id": "req-1", "type": "ping", "payload": {}}).to_string())
        .await;
    let frame = conn.queue().recv().await.unwrap();
    assert!(frame.contains("\"pong\""));
    assert!(frame.contains("req-1"));

    router
        .dispatch(
            conn.clone(),
            json!({"id": "req-2", "type": "subscribe", "payload": {"topic": "conversation", "resource_id": "convo-9"}}).to_string(),
        )
        .await;
    // "subscribe" has no response payload, just acceptance; subscriber count advances.
    assert_eq!(subs.subscriber_count(Topic::Conversation, "convo-9").await, 1);
}

#[tokio::test]
async fn router_unknown_message_type_returns_error_frame_with_request_id() {
    let hub = Arc::new(Hub::new());
    let subs = Arc::new(SubscriptionManager::new());
    let broadcaster = Arc::new(Broadcaster::new(hub.clone(), subs.clone()));
    let presence = Arc::new(PresenceTracker::new(hub.clone(), broadcaster.clone()));
    let router = Router::new(hub.clone(), subs, broadcaster, presence);

    use realtime_gateway::connection::MessageDispatch;

    let user = Uuid::new_v4();
    let conn = make_conn("c1", user);
    hub.register(user, conn.clone()).await;

    router
        .dispatch(conn.clone(), json!({"id": "req-7", "type": "levitate", "payload": {}}).to_string())
        .await;
    let frame = conn.queue().recv().await.unwrap();
    assert!(frame.contains("unknown_type"));
    assert!(frame.contains("req-7"));
}

#[tokio::test]
async fn connection_manager_rejects_admission_past_global_capacity() {
    let manager = ConnectionManager::new(1);
    let user = Uuid::new_v4();
    manager.add(make_conn("c1", user)).await.unwrap();
    let result = manager.add(make_conn("c2", user)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn event_category_is_derived_from_the_dotted_type_prefix() {
    assert_eq!(category_for("message.created"), Some(EventCategory::Messaging));
    assert_eq!(category_for("presence.update"), Some(EventCategory::Presence));
    assert_eq!(category_for("call.offer"), Some(EventCategory::Call));
    assert_eq!(category_for("not.a.real.prefix"), None);
}

#[tokio::test]
async fn connection_manager_disconnect_hook_drives_hub_and_subscription_teardown() {
    let hub = Arc::new(Hub::new());
    let subs = Arc::new(SubscriptionManager::new());
    let manager = Arc::new(ConnectionManager::new(10));

    {
        let hub = hub.clone();
        let subs = subs.clone();
        manager.set_on_disconnect(Arc::new(move |conn: Arc<Connection>| {
            let hub = hub.clone();
            let subs = subs.clone();
            tokio::spawn(async move {
                let user_id = conn.metadata().await.user_id;
                subs.unsubscribe_all(&conn.id).await;
                hub.unregister(user_id, &conn.id).await;
            });
        }));
    }

    let user = Uuid::new_v4();
    let conn = make_conn("c1", user);
    manager.add(conn.clone()).await.unwrap();
    hub.register(user, conn.clone()).await;
    subs.subscribe(&conn, Topic::Conversation, "convo-1").await;
    assert_eq!(subs.subscriber_count(Topic::Conversation, "convo-1").await, 1);
    assert!(hub.is_user_online(user).await);

    // A single `remove` call — the same one both the upgrade handler and the
    // stale sweep issue — must unwind every index through the hook alone.
    manager.remove("c1").await;

    // The hook's cleanup runs in a spawned task; give it a turn to complete.
    tokio::task::yield_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    assert_eq!(subs.subscriber_count(Topic::Conversation, "convo-1").await, 0);
    assert!(!hub.is_user_online(user).await);
}

#[tokio::test]
async fn high_priority_call_signal_relays_point_to_point() {
    let hub = Arc::new(Hub::new());
    let subs = Arc::new(SubscriptionManager::new());
    let broadcaster = Broadcaster::new(hub.clone(), subs);

    let caller = Uuid::new_v4();
    let callee = Uuid::new_v4();
    let callee_conn = make_conn("callee-device", callee);
    hub.register(callee, callee_conn.clone()).await;

    let mut ev = event("call.offer", vec![callee], json!({"sdp": "..."}));
    ev.sender = Some(caller);
    ev.priority = Some(Priority::High);
    let delivered = broadcaster.broadcast_to_user(callee, &ev).await;

    assert_eq!(delivered, 1);
    assert!(callee_conn.queue().recv().await.unwrap().contains("call.offer"));
}
