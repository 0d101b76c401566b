use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::Connection;

/// User→devices index plus the total connection count (spec §4.5).
///
/// The single authority on device counts consumed by the presence tracker:
/// all mutations happen under one write lock that keeps the per-user
/// connection set and the aggregate count in lockstep, satisfying the
/// invariant in spec §3 ("Hub's device count for user U equals the number
/// of connections in Hub whose metadata.user_id == U").
#[derive(Default)]
pub struct Hub {
    by_user: RwLock<HashMap<Uuid, HashSet<String>>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, user_id: Uuid, conn: Arc<Connection>) {
        let conn_id = conn.id.clone();
        self.connections.write().await.insert(conn_id.clone(), conn);
        self.by_user
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(conn_id);
    }

    pub async fn unregister(&self, user_id: Uuid, conn_id: &str) {
        self.connections.write().await.remove(conn_id);
        let mut by_user = self.by_user.write().await;
        if let Some(set) = by_user.get_mut(&user_id) {
            set.remove(conn_id);
            if set.is_empty() {
                by_user.remove(&user_id);
            }
        }
    }

    pub async fn is_user_online(&self, user_id: Uuid) -> bool {
        self.by_user
            .read()
            .await
            .get(&user_id)
            .is_some_and(|set| !set.is_empty())
    }

    pub async fn device_count(&self, user_id: Uuid) -> usize {
        self.by_user
            .read()
            .await
            .get(&user_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    pub async fn online_users(&self) -> Vec<Uuid> {
        self.by_user.read().await.keys().copied().collect()
    }

    pub async fn total_connections(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Look up a single connection by id, used by the Subscription Manager
    /// to resolve a topic's connection-id set into live connections.
    pub async fn get(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(conn_id).cloned()
    }

    /// Snapshot of a user's live connections, taken under a read lock and
    /// returned as owned `Arc`s so callers can `Send` without holding the
    /// lock (spec §5: "enumerate under a read lock, snapshot connections
    /// into a slice, then iterate lock-free").
    async fn connections_for_user(&self, user_id: Uuid) -> Vec<Arc<Connection>> {
        let by_user = self.by_user.read().await;
        let Some(ids) = by_user.get(&user_id) else {
            return Vec::new();
        };
        let connections = self.connections.read().await;
        ids.iter()
            .filter_map(|id| connections.get(id).cloned())
            .collect()
    }

    /// Enqueue `payload` to every connection of `user_id`. A failed send on
    /// one device never aborts the rest. Returns the number of devices the
    /// payload was successfully enqueued to.
    pub async fn send_to_user(&self, user_id: Uuid, payload: &str) -> usize {
        let conns = self.connections_for_user(user_id).await;
        let mut delivered = 0;
        for conn in conns {
            if conn.send(payload.to_string()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Enqueue `payload` to every currently online connection.
    pub async fn send_to_all(&self, payload: &str) -> usize {
        let connections: Vec<Arc<Connection>> = self.connections.read().await.values().cloned().collect();
        let mut delivered = 0;
        for conn in connections {
            if conn.send(payload.to_string()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}
