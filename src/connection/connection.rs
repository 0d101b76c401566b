use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::WebSocketConfig;
use crate::connection::backpressure::OutboundQueue;
use crate::connection::rate_limit::RateLimiterRegistry;
use crate::connection::state_machine::{ConnectionState, StateCell};
use crate::error::{AppError, AppResult};

/// Client platform, extracted from the `X-Platform` upgrade header (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl std::str::FromStr for Platform {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            "web" => Ok(Platform::Web),
            other => Err(AppError::Validation(format!("unknown platform: {other}"))),
        }
    }
}

/// Per-connection metadata captured at admission (spec §3).
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub user_id: Uuid,
    pub device_id: String,
    pub platform: Platform,
    pub device_name: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub app_version: Option<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point-in-time snapshot of a connection's counters, returned by `stats()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Dispatches one decoded client frame to its handler (implemented by the
/// message router, C8). Kept as a trait object so `Connection`'s pumps don't
/// need to know about the router, hub, or subscription manager.
pub trait MessageDispatch: Send + Sync + 'static {
    fn dispatch(&self, conn: Arc<Connection>, raw: String) -> BoxFuture<'static, ()>;
}

/// Owns one WebSocket's outbound queue, FSM, metadata, and stats (spec §4.3).
/// The socket itself is only ever touched by the pair of pumps spawned in
/// [`Connection::run_pumps`]; every other index (Manager, Hub, Subscription
/// Manager) holds only the `id` and a weak reference via `Arc`.
pub struct Connection {
    pub id: String,
    state: StateCell,
    metadata: RwLock<ConnectionMetadata>,
    counters: ConnectionCounters,
    queue: OutboundQueue,
    created_at: Instant,
    last_activity: std::sync::Mutex<Instant>,
}

impl Connection {
    pub fn new(id: String, metadata: ConnectionMetadata, queue: OutboundQueue) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: StateCell::new(ConnectionState::Connecting),
            metadata: RwLock::new(metadata),
            counters: ConnectionCounters::default(),
            queue,
            created_at: Instant::now(),
            last_activity: std::sync::Mutex::new(Instant::now()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn transition(&self, next: ConnectionState) -> Result<(), crate::connection::state_machine::InvalidTransition> {
        self.state.transition(next).map(|_| ())
    }

    pub async fn metadata(&self) -> ConnectionMetadata {
        self.metadata.read().await.clone()
    }

    pub async fn set_metadata(&self, metadata: ConnectionMetadata) {
        *self.metadata.write().await = metadata;
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.counters.messages_sent.load(Ordering::SeqCst),
            messages_received: self.counters.messages_received.load(Ordering::SeqCst),
            bytes_sent: self.counters.bytes_sent.load(Ordering::SeqCst),
            bytes_received: self.counters.bytes_received.load(Ordering::SeqCst),
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    pub fn touch_activity(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Enqueue a raw text frame. Non-blocking up to the queue's configured
    /// strategy; fails with `SEND_TIMEOUT` or `CONNECTION_CLOSED` per spec
    /// §4.3.
    pub async fn send(&self, text: String) -> AppResult<()> {
        if self.state() == ConnectionState::Disconnected {
            return Err(AppError::ConnectionClosed);
        }
        self.queue.enqueue(text).await
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> AppResult<()> {
        let text = serde_json::to_string(value).map_err(|e| {
            tracing::error!(error = ?e, "failed to serialize outbound frame");
            AppError::Internal
        })?;
        self.send(text).await
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Transition to Disconnecting, close the outbound queue (idempotent),
    /// and let the write pump drive the final Close frame. Safe to call
    /// more than once.
    pub fn close(&self) {
        let _ = self.state.transition(ConnectionState::Disconnecting);
        self.queue.close();
    }

    /// Spawn the read and write pumps. Returns once either pump exits; the
    /// caller is then responsible for index teardown (Manager/Hub/
    /// Subscription Manager) per spec §4.3's cleanup sequence.
    pub async fn run_pumps(
        self: Arc<Self>,
        socket: WebSocket,
        ws_config: Arc<WebSocketConfig>,
        rate_limiter: Arc<RateLimiterRegistry>,
        dispatcher: Arc<dyn MessageDispatch>,
    ) {
        let (sender, receiver) = socket.split();

        let write_conn = self.clone();
        let write_cfg = ws_config.clone();
        let mut write_task = tokio::spawn(Self::write_pump(write_conn, sender, write_cfg));

        let read_conn = self.clone();
        let mut read_task = tokio::spawn(Self::read_pump(
            read_conn,
            receiver,
            ws_config,
            rate_limiter,
            dispatcher,
        ));

        tokio::select! {
            _ = &mut write_task => { read_task.abort(); }
            _ = &mut read_task => { write_task.abort(); }
        }

        self.close();
    }

    async fn read_pump(
        conn: Arc<Connection>,
        mut receiver: SplitStream<WebSocket>,
        ws_config: Arc<WebSocketConfig>,
        rate_limiter: Arc<RateLimiterRegistry>,
        dispatcher: Arc<dyn MessageDispatch>,
    ) {
        loop {
            let next = tokio::time::timeout(ws_config.pong_wait(), receiver.next()).await;
            let frame = match next {
                Ok(frame) => frame,
                Err(_elapsed) => {
                    tracing::debug!(conn_id = %conn.id, "read pump: pong deadline exceeded");
                    break;
                }
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    conn.touch_activity();

                    if text.len() > ws_config.max_message_size {
                        conn.reject_oversize_frame().await;
                        continue;
                    }

                    conn.counters.messages_received.fetch_add(1, Ordering::SeqCst);
                    conn.counters
                        .bytes_received
                        .fetch_add(text.len() as u64, Ordering::SeqCst);

                    if !rate_limiter.allow(&conn.id).await {
                        conn.reject_rate_limited_frame().await;
                        continue;
                    }

                    dispatcher.dispatch(conn.clone(), text).await;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    conn.touch_activity();
                }
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Binary(_))) => {
                    // The client protocol is JSON-over-text; binary frames are
                    // not part of the contract and are ignored rather than
                    // treated as fatal.
                    conn.touch_activity();
                }
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn.id, error = ?e, "read pump: socket error");
                    break;
                }
                None => break,
            }
        }
    }

    /// Send a `{type:"error", payload:{code,...}}` frame without touching
    /// connection state — used for per-frame rejections that keep the
    /// connection open (spec §4.2, §4.3, §7).
    async fn send_error_frame(&self, code: &str, message: &str) {
        let frame = json!({
            "id": Uuid::new_v4(),
            "type": "error",
            "request_id": null,
            "payload": { "code": code, "message": message },
            "timestamp": Utc::now(),
        });
        let _ = self.send(frame.to_string()).await;
    }

    async fn reject_oversize_frame(&self) {
        tracing::debug!(conn_id = %self.id, "frame exceeded max message size");
        self.send_error_frame("MESSAGE_TOO_LARGE", "message exceeds maximum size").await;
    }

    async fn reject_rate_limited_frame(&self) {
        tracing::debug!(conn_id = %self.id, "read pump: rate limit exceeded");
        self.send_error_frame("RATE_LIMIT_EXCEEDED", "rate limit exceeded").await;
    }

    async fn write_pump(
        conn: Arc<Connection>,
        mut sender: SplitSink<WebSocket, Message>,
        ws_config: Arc<WebSocketConfig>,
    ) {
        let mut ping_interval = tokio::time::interval(ws_config.ping_period());
        ping_interval.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    let sent = tokio::time::timeout(
                        ws_config.write_wait(),
                        sender.send(Message::Ping(Vec::new())),
                    ).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        tracing::debug!(conn_id = %conn.id, "write pump: ping failed, treating as dead");
                        break;
                    }
                }
                item = conn.queue.recv() => {
                    match item {
                        Some(text) => {
                            let len = text.len() as u64;
                            let sent = tokio::time::timeout(
                                ws_config.write_wait(),
                                sender.send(Message::Text(text)),
                            ).await;
                            if !matches!(sent, Ok(Ok(()))) {
                                break;
                            }
                            conn.counters.messages_sent.fetch_add(1, Ordering::SeqCst);
                            conn.counters.bytes_sent.fetch_add(len, Ordering::SeqCst);
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = tokio::time::timeout(ws_config.write_wait(), sender.send(Message::Close(None))).await;
    }
}
