use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{Quota, RateLimiter as GovernorLimiter};
use tokio::sync::RwLock;

/// Strategy selected at construction for a single client's limiter (spec
/// §4.2). Both strategies answer the single `allow()` query; frames that
/// fail it are dropped with `RATE_LIMIT_EXCEEDED`, never disconnected.
pub trait RateLimiter: Send + Sync {
    fn allow(&self) -> bool;
}

/// Refill-based limiter backed by `governor`'s lock-free direct rate limiter.
pub struct TokenBucket {
    inner: GovernorLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl TokenBucket {
    pub fn new(rate_per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(rate_per_second.max(1)).unwrap();
        let burst = NonZeroU32::new(burst.max(1)).unwrap();
        let quota = Quota::per_second(rate).allow_burst(burst);
        Self {
            inner: GovernorLimiter::direct(quota),
        }
    }
}

impl RateLimiter for TokenBucket {
    fn allow(&self) -> bool {
        self.inner.check().is_ok()
    }
}

/// Counts timestamps in a rolling window; admits a frame only while fewer
/// than `max` timestamps fall within the last `window`.
pub struct SlidingWindow {
    window: Duration,
    max: usize,
    timestamps: std::sync::Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            window,
            max,
            timestamps: std::sync::Mutex::new(VecDeque::new()),
        }
    }
}

impl RateLimiter for SlidingWindow {
    fn allow(&self) -> bool {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap();
        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() >= self.max {
            return false;
        }
        timestamps.push_back(now);
        true
    }
}

/// Which strategy new per-client limiters should use (spec §4.2: "selected
/// at construction").
#[derive(Clone, Copy, Debug)]
pub enum RateLimitStrategy {
    TokenBucket { rate_per_second: u32, burst: u32 },
    SlidingWindow { max: usize, window: Duration },
}

impl RateLimitStrategy {
    fn build(self) -> Arc<dyn RateLimiter> {
        match self {
            RateLimitStrategy::TokenBucket { rate_per_second, burst } => {
                Arc::new(TokenBucket::new(rate_per_second, burst))
            }
            RateLimitStrategy::SlidingWindow { max, window } => {
                Arc::new(SlidingWindow::new(max, window))
            }
        }
    }

    fn window(self) -> Duration {
        match self {
            RateLimitStrategy::TokenBucket { .. } => Duration::from_secs(1),
            RateLimitStrategy::SlidingWindow { window, .. } => window,
        }
    }
}

/// Registry of per-client-id rate limiters with a sweep that evicts entries
/// idle for more than `2 * window` (spec §4.2).
pub struct RateLimiterRegistry {
    strategy: RateLimitStrategy,
    limiters: RwLock<HashMap<String, (Arc<dyn RateLimiter>, Instant)>>,
}

impl RateLimiterRegistry {
    pub fn new(strategy: RateLimitStrategy) -> Self {
        Self {
            strategy,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// The only query: whether `client_id` may send one more frame right now.
    pub async fn allow(&self, client_id: &str) -> bool {
        {
            let limiters = self.limiters.read().await;
            if let Some((limiter, _)) = limiters.get(client_id) {
                let allowed = limiter.allow();
                drop(limiters);
                self.touch(client_id).await;
                return allowed;
            }
        }

        let mut limiters = self.limiters.write().await;
        let entry = limiters
            .entry(client_id.to_string())
            .or_insert_with(|| (self.strategy.build(), Instant::now()));
        entry.1 = Instant::now();
        entry.0.allow()
    }

    async fn touch(&self, client_id: &str) {
        if let Some(entry) = self.limiters.write().await.get_mut(client_id) {
            entry.1 = Instant::now();
        }
    }

    /// Remove limiters whose last-seen timestamp is older than `2 * window`.
    pub async fn sweep(&self) {
        let stale_after = self.strategy.window() * 2;
        let now = Instant::now();
        self.limiters
            .write()
            .await
            .retain(|_, (_, last_seen)| now.duration_since(*last_seen) <= stale_after);
    }

    pub async fn len(&self) -> usize {
        self.limiters.read().await.len()
    }
}
