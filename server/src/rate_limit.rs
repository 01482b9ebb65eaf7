//! Keyed rate limiting using the token bucket algorithm.
//!
//! Two limiters run in the server:
//!
//! - the ingest limiter, keyed by the `X-Source-ID` of the publishing service;
//! - the chat limiter, keyed by the posting [`UserId`](crate::types::UserId).
//!
//! Each key has its own bucket that holds up to `capacity` tokens and refills
//! at `rate` tokens per second. Every check consumes one token.
//!
//! # Example
//!
//! ```rust
//! use toppet_server::rate_limit::{RateLimiter, RateLimitResult};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let limiter: RateLimiter<String> = RateLimiter::new(100.0, 100);
//!
//! match limiter.check("votes-service".to_string()).await {
//!     RateLimitResult::Allowed => {}
//!     RateLimitResult::Limited { retry_after_secs } => {
//!         println!("retry in {retry_after_secs}s");
//!     }
//! }
//! # }
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default ingest rate: 100 events per second per source.
pub const DEFAULT_RATE: f64 = 100.0;

/// Default ingest burst.
pub const DEFAULT_CAPACITY: u32 = 100;

/// Buckets idle for longer than this are dropped by the cleanup task.
pub const STALE_ENTRY_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,

    /// Rejected; a token becomes available after `retry_after_secs`.
    Limited { retry_after_secs: u64 },
}

impl RateLimitResult {
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    #[inline]
    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    /// Seconds to wait before retrying, if limited.
    #[inline]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Allowed => None,
            Self::Limited { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

/// A single refilling bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: u32,
    rate: f64,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: Instant::now(),
            capacity,
            rate,
        }
    }

    /// Refills by elapsed time, then tries to take one token.
    pub fn try_consume(&mut self) -> RateLimitResult {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(f64::from(self.capacity));
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateLimitResult::Allowed;
        }

        let wait = (1.0 - self.tokens) / self.rate;
        RateLimitResult::Limited {
            retry_after_secs: (wait.ceil() as u64).max(1),
        }
    }

    /// Time since this bucket was last touched.
    pub fn idle_for(&self) -> Duration {
        self.last_refill.elapsed()
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Shared per-key rate limiter.
///
/// Cloning is cheap; clones share the same buckets.
#[derive(Debug)]
pub struct RateLimiter<K = String> {
    inner: Arc<Mutex<HashMap<K, TokenBucket>>>,
    rate: f64,
    capacity: u32,
}

impl<K> Clone for RateLimiter<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            rate: self.rate,
            capacity: self.capacity,
        }
    }
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Send + 'static,
{
    /// Creates a limiter that grants `rate` tokens per second with bursts of
    /// up to `capacity`.
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    /// Consumes one token from `key`'s bucket, creating it on first use.
    pub async fn check(&self, key: K) -> RateLimitResult {
        let mut buckets = self.inner.lock().await;
        buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(self.rate, self.capacity))
            .try_consume()
    }

    /// Drops buckets idle for longer than [`STALE_ENTRY_TIMEOUT`].
    pub async fn cleanup_stale_entries(&self) -> usize {
        self.cleanup_idle_for(STALE_ENTRY_TIMEOUT).await
    }

    /// Drops buckets idle for longer than `timeout`. Returns how many were removed.
    pub async fn cleanup_idle_for(&self, timeout: Duration) -> usize {
        let mut buckets = self.inner.lock().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.idle_for() < timeout);
        before - buckets.len()
    }

    /// Number of keys currently tracked.
    pub async fn key_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Spawns a task that runs [`cleanup_stale_entries`](Self::cleanup_stale_entries)
    /// every `every`.
    pub fn spawn_cleanup_task(&self, name: &'static str, every: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = limiter.cleanup_stale_entries().await;
                if removed > 0 {
                    debug!(limiter = name, removed_count = removed, "Cleaned up stale rate limit entries");
                }
            }
        })
    }
}

impl Default for RateLimiter<String> {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_CAPACITY)
    }
}
