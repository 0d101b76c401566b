use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::broadcast::{category_for, Broadcaster, RealtimeEvent};
use crate::hub::Hub;
use crate::subscription::Topic;

/// Explicit presence status a user (or the automatic online/offline
/// transitions) can set (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Invisible,
    Offline,
}

#[derive(Clone, Debug, Serialize)]
pub struct PresenceSnapshot {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub custom_status: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub device_count: usize,
}

#[derive(Clone, Debug)]
struct PresenceEntry {
    status: PresenceStatus,
    custom_status: Option<String>,
    last_seen_at: Option<DateTime<Utc>>,
}

impl Default for PresenceEntry {
    fn default() -> Self {
        Self {
            status: PresenceStatus::Offline,
            custom_status: None,
            last_seen_at: None,
        }
    }
}

/// Derived online/away/busy/offline state layered on top of Hub device
/// counts (spec §4.9). `status` as returned by `get_presence` is `online`
/// whenever the Hub reports at least one device; otherwise it's whatever was
/// last explicitly set.
pub struct PresenceTracker {
    hub: Arc<Hub>,
    broadcaster: Arc<Broadcaster>,
    entries: tokio::sync::RwLock<HashMap<Uuid, PresenceEntry>>,
}

impl PresenceTracker {
    pub fn new(hub: Arc<Hub>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            hub,
            broadcaster,
            entries: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Store an explicit status/custom-status and broadcast the change to
    /// the global `presence` topic and to `presence@{uid}` subscribers.
    pub async fn update_presence(&self, user_id: Uuid, status: PresenceStatus, custom_status: Option<String>) {
        {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(user_id).or_default();
            entry.status = status;
            entry.custom_status = custom_status.clone();
        }
        self.broadcast_presence(user_id).await;
    }

    /// Live snapshot: device count always sourced fresh from the Hub.
    pub async fn get_presence(&self, user_id: Uuid) -> PresenceSnapshot {
        let device_count = self.hub.device_count(user_id).await;
        let entries = self.entries.read().await;
        let entry = entries.get(&user_id).cloned().unwrap_or_default();

        let status = if device_count > 0 { PresenceStatus::Online } else { entry.status };

        PresenceSnapshot {
            user_id,
            status,
            custom_status: entry.custom_status,
            last_seen_at: entry.last_seen_at,
            device_count,
        }
    }

    /// Connection-lifecycle hook: a user's first device came online.
    pub async fn on_user_connected(&self, user_id: Uuid) {
        {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(user_id).or_default();
            entry.status = PresenceStatus::Online;
        }
        self.broadcast_presence(user_id).await;
    }

    /// Connection-lifecycle hook: called after Hub.Unregister. Stamps
    /// `last_seen_at` only when the user's device count has reached zero.
    pub async fn on_user_disconnected(&self, user_id: Uuid) {
        let now_offline = self.hub.device_count(user_id).await == 0;
        if now_offline {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(user_id).or_default();
            entry.status = PresenceStatus::Offline;
            entry.last_seen_at = Some(Utc::now());
        }
        self.broadcast_presence(user_id).await;
    }

    async fn broadcast_presence(&self, user_id: Uuid) {
        let snapshot = self.get_presence(user_id).await;
        let event = RealtimeEvent {
            id: Uuid::new_v4(),
            event_type: "presence.update".to_string(),
            category: category_for("presence.update").expect("presence.update is a recognized type"),
            timestamp: Utc::now(),
            recipients: vec![],
            sender: Some(user_id),
            payload: json!({
                "user_id": snapshot.user_id,
                "status": snapshot.status,
                "custom_status": snapshot.custom_status,
                "last_seen_at": snapshot.last_seen_at,
                "device_count": snapshot.device_count,
            }),
            priority: None,
            ttl_secs: None,
        };

        self.broadcaster
            .broadcast_to_topic(Topic::Presence, Topic::Presence.default_resource_id(), &event, &Default::default())
            .await;
        self.broadcaster
            .broadcast_to_topic(Topic::Presence, &user_id.to_string(), &event, &Default::default())
            .await;
    }

    /// Evict offline entries whose `last_seen_at` is older than `max_age`.
    /// Entries with device_count > 0 are never evicted (re-checked against
    /// the Hub, since presence entries can lag by one lifecycle event).
    pub async fn evict_stale(&self, max_age: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let candidates: Vec<Uuid> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, e)| e.status == PresenceStatus::Offline && e.last_seen_at.is_some_and(|ts| ts < cutoff))
                .map(|(uid, _)| *uid)
                .collect()
        };

        for uid in candidates {
            if self.hub.device_count(uid).await == 0 {
                self.entries.write().await.remove(&uid);
            }
        }
    }

    /// Spawn the periodic offline-entry eviction task (spec §4.9, §5).
    pub fn spawn_eviction_task(self: Arc<Self>, interval: Duration, max_age: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.evict_stale(max_age).await;
            }
        })
    }
}
