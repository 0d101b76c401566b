use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::connection::{Connection, ConnectionState};
use crate::error::{AppError, AppResult};

type DisconnectHook = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

/// Bounded registry of live connections with admission control and a stale
/// sweep (spec §4.4). Indexed by connection id; the Hub and Subscription
/// Manager are separate indices over the same connections, kept in sync by
/// the single `on_disconnect` hook fired from both `remove` and the stale
/// sweep — the upgrade handler's own teardown is just `remove`, not a
/// second copy of the index cleanup.
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    max_connections: usize,
    on_disconnect: std::sync::RwLock<Option<DisconnectHook>>,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
            on_disconnect: std::sync::RwLock::new(None),
        }
    }

    /// Register a callback invoked (outside any lock) whenever a connection
    /// is removed, whether via `remove` or the stale sweep. The callback is
    /// sync; async teardown (Hub/Subscription Manager/presence) should
    /// `tokio::spawn` its own future from inside it.
    pub fn set_on_disconnect(&self, hook: DisconnectHook) {
        *self.on_disconnect.write().unwrap() = Some(hook);
    }

    /// Admit a connection, rejecting with `MaxConnectionsReached` once the
    /// registry is at capacity.
    pub async fn add(&self, conn: Arc<Connection>) -> AppResult<()> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.max_connections {
            return Err(AppError::MaxConnectionsReached);
        }
        connections.insert(conn.id.clone(), conn);
        Ok(())
    }

    pub async fn get(&self, conn_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(conn_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Remove a connection and fire the disconnect hook. No-op if the id is
    /// already gone (teardown may race with the stale sweep).
    pub async fn remove(&self, conn_id: &str) -> Option<Arc<Connection>> {
        let removed = self.connections.write().await.remove(conn_id);
        if let Some(conn) = &removed {
            self.fire_disconnect(conn.clone());
        }
        removed
    }

    fn fire_disconnect(&self, conn: Arc<Connection>) {
        if let Some(hook) = self.on_disconnect.read().unwrap().clone() {
            hook(conn);
        }
    }

    /// Scan for connections idle longer than `stale_timeout`, close and
    /// remove them. Returns the connections that were evicted so the
    /// caller's hub/subscription indices can also be pruned via the
    /// disconnect hook (already fired here) or direct inspection.
    pub async fn sweep_stale(&self, stale_timeout: Duration) -> Vec<Arc<Connection>> {
        let stale_ids: Vec<String> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|c| c.idle_for() > stale_timeout)
                .map(|c| c.id.clone())
                .collect()
        };

        let mut evicted = Vec::with_capacity(stale_ids.len());
        for id in stale_ids {
            if let Some(conn) = self.connections.write().await.remove(&id) {
                conn.close();
                self.fire_disconnect(conn.clone());
                evicted.push(conn);
            }
        }
        evicted
    }

    /// Spawn the periodic stale-connection sweeper (spec §4.4, §5).
    pub fn spawn_cleanup_task(self: Arc<Self>, interval: Duration, stale_timeout: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = self.sweep_stale(stale_timeout).await;
                if !evicted.is_empty() {
                    tracing::info!(count = evicted.len(), "cleanup: evicted stale connections");
                }
            }
        })
    }

    /// Close and drop every connection. Used at shutdown.
    pub async fn close_all(&self) {
        let mut connections = self.connections.write().await;
        for conn in connections.values() {
            let _ = conn.transition(ConnectionState::Disconnecting);
            conn.close();
        }
        connections.clear();
    }
}
