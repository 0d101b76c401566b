use std::sync::Arc;

use crate::auth::UserDirectory;
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::connection::{Connection, RateLimiterRegistry};
use crate::hub::Hub;
use crate::manager::ConnectionManager;
use crate::offline::OfflineDispatcher;
use crate::presence::PresenceTracker;
use crate::router::Router;
use crate::subscription::SubscriptionManager;

/// Shared application state passed to every handler and extractor. Every
/// field is an `Arc`, so cloning `AppState` per request is cheap (spec §9:
/// "pass explicit context objects into constructors; avoid process-global
/// state").
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<Hub>,
    pub manager: Arc<ConnectionManager>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub broadcaster: Arc<Broadcaster>,
    pub presence: Arc<PresenceTracker>,
    pub router: Arc<Router>,
    pub rate_limiters: Arc<RateLimiterRegistry>,
    pub offline: Arc<OfflineDispatcher>,
    pub user_directory: Arc<dyn UserDirectory>,
    pub shutting_down: Arc<std::sync::atomic::AtomicBool>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        user_directory: Arc<dyn UserDirectory>,
        offline: Arc<OfflineDispatcher>,
    ) -> Self {
        let hub = Arc::new(Hub::new());
        let manager = Arc::new(ConnectionManager::new(config.server.max_connections));
        let subscriptions = Arc::new(SubscriptionManager::new());
        let broadcaster = Arc::new(Broadcaster::new(hub.clone(), subscriptions.clone()));
        let presence = Arc::new(PresenceTracker::new(hub.clone(), broadcaster.clone()));
        let router = Arc::new(Router::new(hub.clone(), subscriptions.clone(), broadcaster.clone(), presence.clone()));
        let rate_limiters = Arc::new(RateLimiterRegistry::new(crate::connection::RateLimitStrategy::TokenBucket {
            rate_per_second: config.websocket.max_messages_per_second,
            burst: config.websocket.burst_size,
        }));

        // Single teardown driver for every connection removal path (manual
        // disconnect via the upgrade handler's `manager.remove`, or the
        // stale sweep's eviction): unwind the Subscription Manager and Hub
        // indices and update presence. The hook itself must be sync, so it
        // spawns its own task for the async cleanup.
        {
            let hub = hub.clone();
            let subscriptions = subscriptions.clone();
            let presence = presence.clone();
            manager.set_on_disconnect(Arc::new(move |conn: Arc<Connection>| {
                let hub = hub.clone();
                let subscriptions = subscriptions.clone();
                let presence = presence.clone();
                tokio::spawn(async move {
                    let user_id = conn.metadata().await.user_id;
                    subscriptions.unsubscribe_all(&conn.id).await;
                    hub.unregister(user_id, &conn.id).await;
                    presence.on_user_disconnected(user_id).await;
                });
            }));
        }

        Self {
            config,
            hub,
            manager,
            subscriptions,
            broadcaster,
            presence,
            router,
            rate_limiters,
            offline,
            user_directory,
            shutting_down: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
