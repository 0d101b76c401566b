use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connection::Connection;

/// Topics a connection can subscribe to (spec §3). `resource_id` scopes the
/// subscription within the topic; it defaults to `"global"`/`"default"` when
/// the client omits a filter for topics that need one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::EnumString, strum::Display)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Topic {
    User,
    Conversation,
    Presence,
    Typing,
    Calls,
    Notifications,
}

impl Topic {
    /// Resource-id fallback for topics that are inherently singleton/global
    /// rather than scoped to a conversation/call/user id.
    pub fn default_resource_id(&self) -> &'static str {
        match self {
            Topic::Presence => "global",
            _ => "default",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    topic: Topic,
    resource_id: String,
}

/// Forward `Topic → ResourceId → {Connection}` and reverse
/// `Connection → [(Topic, ResourceId)]` indices (spec §4.6). Every map
/// shrinks back to empty when its last entry is removed, bounding memory
/// for churny topics like `typing`.
#[derive(Default)]
pub struct SubscriptionManager {
    forward: RwLock<HashMap<Topic, HashMap<String, HashSet<String>>>>,
    reverse: RwLock<HashMap<String, HashSet<SubscriptionKey>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, conn: &Connection, topic: Topic, resource_id: impl Into<String>) {
        let resource_id = resource_id.into();
        let conn_id = conn.id.clone();

        self.forward
            .write()
            .await
            .entry(topic)
            .or_default()
            .entry(resource_id.clone())
            .or_default()
            .insert(conn_id.clone());

        self.reverse
            .write()
            .await
            .entry(conn_id)
            .or_default()
            .insert(SubscriptionKey { topic, resource_id });
    }

    /// Drop every resource-id a connection holds under `topic`.
    pub async fn unsubscribe(&self, conn_id: &str, topic: Topic) {
        let resource_ids: Vec<String> = {
            let reverse = self.reverse.read().await;
            reverse
                .get(conn_id)
                .map(|keys| {
                    keys.iter()
                        .filter(|k| k.topic == topic)
                        .map(|k| k.resource_id.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        for resource_id in resource_ids {
            self.remove_one(conn_id, topic, &resource_id).await;
        }
    }

    /// Drop every subscription a connection holds, across all topics. Called
    /// during connection teardown.
    pub async fn unsubscribe_all(&self, conn_id: &str) {
        let keys: Vec<SubscriptionKey> = self
            .reverse
            .read()
            .await
            .get(conn_id)
            .cloned()
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for key in keys {
            self.remove_one(conn_id, key.topic, &key.resource_id).await;
        }
    }

    async fn remove_one(&self, conn_id: &str, topic: Topic, resource_id: &str) {
        {
            let mut forward = self.forward.write().await;
            if let Some(by_resource) = forward.get_mut(&topic) {
                if let Some(conns) = by_resource.get_mut(resource_id) {
                    conns.remove(conn_id);
                    if conns.is_empty() {
                        by_resource.remove(resource_id);
                    }
                }
                if by_resource.is_empty() {
                    forward.remove(&topic);
                }
            }
        }
        {
            let mut reverse = self.reverse.write().await;
            if let Some(keys) = reverse.get_mut(conn_id) {
                keys.remove(&SubscriptionKey {
                    topic,
                    resource_id: resource_id.to_string(),
                });
                if keys.is_empty() {
                    reverse.remove(conn_id);
                }
            }
        }
    }

    /// Snapshot of connection ids subscribed to `(topic, resource_id)`.
    pub async fn get_subscribers(&self, topic: Topic, resource_id: &str) -> Vec<String> {
        self.forward
            .read()
            .await
            .get(&topic)
            .and_then(|by_resource| by_resource.get(resource_id))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn subscriber_count(&self, topic: Topic, resource_id: &str) -> usize {
        self.get_subscribers(topic, resource_id).await.len()
    }

    /// Resolve subscriber connection ids into live connections via the
    /// supplied lookup, dropping any that have already been torn down.
    pub async fn resolve_subscribers(
        &self,
        topic: Topic,
        resource_id: &str,
        lookup: impl Fn(&str) -> Option<Arc<Connection>>,
    ) -> Vec<Arc<Connection>> {
        self.get_subscribers(topic, resource_id)
            .await
            .iter()
            .filter_map(|id| lookup(id))
            .collect()
    }

    #[cfg(test)]
    async fn forward_is_empty(&self) -> bool {
        self.forward.read().await.is_empty()
    }

    #[cfg(test)]
    async fn reverse_is_empty(&self) -> bool {
        self.reverse.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{backpressure::PressureStrategy, ConnectionMetadata, OutboundQueue, Platform};
    use chrono::Utc;
    use uuid::Uuid;

    fn make_conn(id: &str) -> Arc<Connection> {
        let queue = OutboundQueue::new(10, 5, 1, PressureStrategy::DropNewest);
        let metadata = ConnectionMetadata {
            user_id: Uuid::new_v4(),
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

    #[tokio::test]
    async fn subscribe_adds_to_both_indices() {
        let subs = SubscriptionManager::new();
        let c1 = make_conn("c1");
        subs.subscribe(&c1, Topic::Typing, "conv-x").await;

        let subscribers = subs.get_subscribers(Topic::Typing, "conv-x").await;
        assert_eq!(subscribers, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn unsubscribe_drops_only_that_topic() {
        let subs = SubscriptionManager::new();
        let c1 = make_conn("c1");
        subs.subscribe(&c1, Topic::Typing, "conv-x").await;
        subs.subscribe(&c1, Topic::Presence, "global").await;

        subs.unsubscribe("c1", Topic::Typing).await;

        assert!(subs.get_subscribers(Topic::Typing, "conv-x").await.is_empty());
        assert_eq!(subs.get_subscribers(Topic::Presence, "global").await, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_every_topic() {
        let subs = SubscriptionManager::new();
        let c1 = make_conn("c1");
        subs.subscribe(&c1, Topic::Typing, "conv-x").await;
        subs.subscribe(&c1, Topic::Calls, "call-1").await;

        subs.unsubscribe_all("c1").await;

        assert!(subs.get_subscribers(Topic::Typing, "conv-x").await.is_empty());
        assert!(subs.get_subscribers(Topic::Calls, "call-1").await.is_empty());
    }

    #[tokio::test]
    async fn maps_shrink_to_empty_when_last_entry_removed() {
        let subs = SubscriptionManager::new();
        let c1 = make_conn("c1");
        subs.subscribe(&c1, Topic::Typing, "conv-x").await;
        subs.unsubscribe_all("c1").await;

        assert!(subs.forward_is_empty().await);
        assert!(subs.reverse_is_empty().await);
    }

    #[tokio::test]
    async fn fan_out_reaches_only_current_subscribers() {
        let subs = SubscriptionManager::new();
        let c1 = make_conn("c1");
        let c2 = make_conn("c2");
        let c3 = make_conn("c3");
        subs.subscribe(&c1, Topic::Typing, "conv-x").await;
        subs.subscribe(&c2, Topic::Typing, "conv-x").await;

        let mut subscribers = subs.get_subscribers(Topic::Typing, "conv-x").await;
        subscribers.sort();
        assert_eq!(subscribers, vec!["c1".to_string(), "c2".to_string()]);
        assert!(!subscribers.contains(&c3.id));

        subs.unsubscribe("c1", Topic::Typing).await;
        assert_eq!(subs.get_subscribers(Topic::Typing, "conv-x").await, vec!["c2".to_string()]);
    }

    #[tokio::test]
    async fn default_resource_id_distinguishes_global_topics() {
        assert_eq!(Topic::Presence.default_resource_id(), "global");
        assert_eq!(Topic::Conversation.default_resource_id(), "default");
    }
}
