pub mod category;
pub mod event;

pub use category::{category_for, EventCategory};
pub use event::{Priority, RealtimeEvent};

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::hub::Hub;
use crate::subscription::{SubscriptionManager, Topic};

/// Routes a `RealtimeEvent` to users, topics, or every connection (spec
/// §4.7). Every method enqueues best-effort and returns a delivered count;
/// none wait for client acknowledgement.
pub struct Broadcaster {
    hub: Arc<Hub>,
    subscriptions: Arc<SubscriptionManager>,
}

impl Broadcaster {
    pub fn new(hub: Arc<Hub>, subscriptions: Arc<SubscriptionManager>) -> Self {
        Self { hub, subscriptions }
    }

    /// Enqueue to every device of `user_id`. Returns 0 if the user has no
    /// live connection.
    pub async fn broadcast_to_user(&self, user_id: Uuid, event: &RealtimeEvent) -> usize {
        self.hub.send_to_user(user_id, &event.to_frame()).await
    }

    /// Deliver to each user in `user_ids`, skipping any in `exclude`.
    /// Returns the count of *users* reached (not devices).
    pub async fn broadcast_to_users(&self, user_ids: &[Uuid], event: &RealtimeEvent, exclude: &HashSet<Uuid>) -> usize {
        let frame = event.to_frame();
        let mut delivered_users = 0;
        for uid in user_ids {
            if exclude.contains(uid) {
                continue;
            }
            if self.hub.send_to_user(*uid, &frame).await > 0 {
                delivered_users += 1;
            }
        }
        delivered_users
    }

    /// Deliver to every connection subscribed to `(topic, resource_id)`,
    /// skipping connection ids in `exclude` (typically the sender's own
    /// connection). Returns the number of connections reached.
    pub async fn broadcast_to_topic(
        &self,
        topic: Topic,
        resource_id: &str,
        event: &RealtimeEvent,
        exclude: &HashSet<String>,
    ) -> usize {
        let frame = event.to_frame();
        let hub = self.hub.clone();
        let subscribers = self
            .subscriptions
            .get_subscribers(topic, resource_id)
            .await;

        let mut delivered = 0;
        for conn_id in subscribers {
            if exclude.contains(&conn_id) {
                continue;
            }
            if let Some(conn) = hub.get(&conn_id).await {
                if conn.send(frame.clone()).await.is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Deliver to every currently online connection.
    pub async fn broadcast_to_all(&self, event: &RealtimeEvent) -> usize {
        self.hub.send_to_all(&event.to_frame()).await
    }
}
