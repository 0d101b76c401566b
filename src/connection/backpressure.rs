use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

use crate::error::{AppError, AppResult};

/// What to do when an enqueue observes the queue at or above its high
/// watermark (spec §4.2).
#[derive(Clone, Copy, Debug)]
pub enum PressureStrategy {
    DropNewest,
    DropOldest,
    BlockWithTimeout(Duration),
}

type PressureHook = Arc<dyn Fn() + Send + Sync>;

/// Bounded outbound queue with high/low watermark backpressure. Single
/// logical producer side (many callers may enqueue, serialized by an
/// internal mutex) and a single consumer (the write pump), matching spec
/// §5's "single-producer-many-callers, single-consumer" model.
pub struct OutboundQueue {
    items: Mutex<VecDeque<String>>,
    capacity: usize,
    high: usize,
    low: usize,
    strategy: PressureStrategy,
    item_ready: Notify,
    space_freed: Notify,
    closed: AtomicBool,
    above_high: AtomicBool,
    dropped: AtomicU64,
    blocked_timeouts: AtomicU64,
    on_pressure: Mutex<Option<PressureHook>>,
    on_relief: Mutex<Option<PressureHook>>,
}

impl OutboundQueue {
    pub fn new(capacity: usize, high: usize, low: usize, strategy: PressureStrategy) -> Self {
        assert!(low < high && high <= capacity, "watermarks must satisfy low < high <= capacity");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            high,
            low,
            strategy,
            item_ready: Notify::new(),
            space_freed: Notify::new(),
            closed: AtomicBool::new(false),
            above_high: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            blocked_timeouts: AtomicU64::new(0),
            on_pressure: Mutex::new(None),
            on_relief: Mutex::new(None),
        }
    }

    pub fn set_on_pressure(&self, hook: PressureHook) {
        *self.on_pressure.lock().unwrap() = Some(hook);
    }

    pub fn set_on_relief(&self, hook: PressureHook) {
        *self.on_relief.lock().unwrap() = Some(hook);
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn blocked_timeout_count(&self) -> u64 {
        self.blocked_timeouts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue one frame, applying the configured pressure strategy if the
    /// queue is at or above its high watermark.
    pub async fn enqueue(&self, item: String) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::ConnectionClosed);
        }

        loop {
            let size = self.len();
            if size < self.high {
                break;
            }

            self.fire_pressure_if_crossing();

            match self.strategy {
                PressureStrategy::DropNewest => {
                    self.dropped.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                PressureStrategy::DropOldest => {
                    self.items.lock().unwrap().pop_front();
                    self.dropped.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                PressureStrategy::BlockWithTimeout(wait) => {
                    if timeout(wait, self.space_freed.notified()).await.is_err() {
                        self.blocked_timeouts.fetch_add(1, Ordering::SeqCst);
                        return Err(AppError::SendTimeout);
                    }
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(AppError::ConnectionClosed);
                    }
                    continue;
                }
            }
        }

        {
            let mut items = self.items.lock().unwrap();
            if items.len() >= self.capacity {
                // Hard cap even under DropOldest/BlockWithTimeout races.
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::SeqCst);
            }
            items.push_back(item);
        }
        self.item_ready.notify_one();
        Ok(())
    }

    /// Pop the next frame, waiting for one to arrive. Returns `None` once
    /// the queue is closed and drained.
    pub async fn recv(&self) -> Option<String> {
        loop {
            {
                let mut items = self.items.lock().unwrap();
                if let Some(item) = items.pop_front() {
                    let size = items.len();
                    drop(items);
                    self.space_freed.notify_waiters();
                    self.fire_relief_if_crossing(size);
                    return Some(item);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.item_ready.notified().await;
        }
    }

    /// Idempotent close: wakes any blocked enqueuer/consumer.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.item_ready.notify_waiters();
        self.space_freed.notify_waiters();
    }

    fn fire_pressure_if_crossing(&self) {
        if !self.above_high.swap(true, Ordering::SeqCst) {
            if let Some(hook) = self.on_pressure.lock().unwrap().clone() {
                tokio::spawn(async move { hook() });
            }
        }
    }

    fn fire_relief_if_crossing(&self, size_after_pop: usize) {
        if size_after_pop <= self.low && self.above_high.swap(false, Ordering::SeqCst) {
            if let Some(hook) = self.on_relief.lock().unwrap().clone() {
                tokio::spawn(async move { hook() });
            }
        }
    }
}
