//! Keyed rate limiter: one token bucket per key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::RandomState;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::bucket::{Reservation, TokenBucket};
use crate::error::WaitError;

/// Interval between reclamation passes used by the preset limiters
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// What the periodic reclamation pass removes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReclaimPolicy {
    /// Keep every bucket for the limiter's lifetime
    Never,
    /// Drop buckets untouched for this long that have refilled completely
    IdleFor(Duration),
}

/// Configuration for [`RateLimiter`].
#[derive(Clone, Debug)]
pub struct RateLimiterOptions {
    /// Tokens added per second to each key's bucket
    pub rate: f64,
    /// Bucket ceiling
    pub burst: u32,
    /// Reclamation policy for idle buckets
    pub reclaim_policy: ReclaimPolicy,
    /// How often the background pass runs
    pub reclaim_interval: Duration,
}

impl RateLimiterOptions {
    /// Options with reclamation disabled
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst,
            reclaim_policy: ReclaimPolicy::Never,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
        }
    }

    /// Reclaim buckets idle for `idle_for`, checking every `interval`
    pub fn reclaim_idle(mut self, idle_for: Duration, interval: Duration) -> Self {
        self.reclaim_policy = ReclaimPolicy::IdleFor(idle_for);
        self.reclaim_interval = interval;
        self
    }
}

/// Token-bucket rate limiter over an open set of keys.
///
/// Buckets are created the first time a key is seen. The common path takes
/// only the shared lock; a new key upgrades to the exclusive lock and checks
/// again so two racing callers end up with the same bucket.
///
/// Each key costs one bucket until a reclamation pass removes it. With
/// [`ReclaimPolicy::Never`] memory grows with the number of distinct keys.
pub struct RateLimiter {
    options: RateLimiterOptions,
    buckets: RwLock<HashMap<String, Arc<TokenBucket>, RandomState>>,
}

impl RateLimiter {
    /// Create a limiter. Call [`spawn_reclaimer`](Self::spawn_reclaimer) to
    /// start the background pass.
    pub fn new(options: RateLimiterOptions) -> Self {
        Self {
            options,
            buckets: RwLock::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Options this limiter was built with
    pub fn options(&self) -> &RateLimiterOptions {
        &self.options
    }

    /// Take a token for `key` if one is available right now
    pub fn allow(&self, key: &str) -> bool {
        self.bucket(key).allow()
    }

    /// Wait for a token for `key` until `cancel` completes.
    ///
    /// Returns [`WaitError::Cancelled`] when `cancel` wins.
    pub async fn wait<F>(&self, key: &str, cancel: F) -> Result<(), WaitError>
    where
        F: Future<Output = ()>,
    {
        let bucket = self.bucket(key);
        bucket.wait(cancel).await
    }

    /// Wait for a token for `key` for at most `timeout`
    pub async fn wait_timeout(&self, key: &str, timeout: Duration) -> Result<(), WaitError> {
        let bucket = self.bucket(key);
        bucket.wait_timeout(timeout).await
    }

    /// Reserve a token for `key` without blocking
    pub fn reserve(&self, key: &str) -> Reservation {
        self.bucket(key).reserve()
    }

    /// Number of live buckets
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    /// Check if no bucket has been created yet
    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    /// Run one reclamation pass, returning how many buckets were dropped
    pub fn reclaim(&self) -> usize {
        let idle_for = match self.options.reclaim_policy {
            ReclaimPolicy::Never => return 0,
            ReclaimPolicy::IdleFor(idle_for) => idle_for,
        };

        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        // A bucket someone still holds (a pending wait or reservation) stays.
        buckets.retain(|_, bucket| {
            Arc::strong_count(bucket) > 1 || !bucket.is_reclaimable(now, idle_for)
        });
        let removed = before - buckets.len();

        debug!(removed, remaining = buckets.len(), "rate limiter reclamation pass");
        removed
    }

    /// Start the periodic reclamation task on the current Tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the limiter is
    /// dropped.
    pub fn spawn_reclaimer(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        let period = self.options.reclaim_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => {
                        limiter.reclaim();
                    }
                    None => break,
                }
            }
        })
    }

    fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.read().get(key) {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write();
        // Another caller may have created it between the two locks.
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }

        let bucket = Arc::new(TokenBucket::new(self.options.rate, self.options.burst));
        buckets.insert(key.to_string(), Arc::clone(&bucket));
        bucket
    }
}

/// Rate limiter keyed by client IP address
pub struct IpRateLimiter {
    inner: Arc<RateLimiter>,
}

impl IpRateLimiter {
    /// Per-IP limiter reclaiming buckets idle for ten minutes
    pub fn new(rate: f64, burst: u32) -> Self {
        let options = RateLimiterOptions::new(rate, burst)
            .reclaim_idle(DEFAULT_RECLAIM_INTERVAL, DEFAULT_RECLAIM_INTERVAL);
        Self::with_limiter(RateLimiter::new(options))
    }

    /// Wrap an already configured limiter
    pub fn with_limiter(inner: RateLimiter) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Take a token for `ip` if one is available
    pub fn allow_ip(&self, ip: &str) -> bool {
        self.inner.allow(ip)
    }

    /// Underlying keyed limiter
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tokio::time::advance;

    fn limiter(rate: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimiterOptions::new(rate, burst))
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_then_deny_then_refill() {
        let limiter = limiter(1.0, 1);

        assert!(limiter.allow("client"));
        assert!(!limiter.allow("client"));

        advance(Duration::from_secs(1)).await;
        assert!(limiter.allow("client"));
    }

    #[test]
    fn test_keys_have_independent_buckets() {
        let limiter = limiter(1.0, 1);

        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("a"));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_racing_first_use_creates_one_bucket() {
        let limiter = Arc::new(limiter(0.0, 10));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || limiter.allow("shared"))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(admitted, 10);
        assert_eq!(limiter.len(), 1);
        assert!(!limiter.allow("shared"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_by_key() {
        let limiter = limiter(4.0, 1);
        assert!(limiter.allow("k"));

        let start = Instant::now();
        limiter.wait("k", std::future::pending()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));

        let cancelled = limiter
            .wait("k", tokio::time::sleep(Duration::from_millis(10)))
            .await;
        assert_eq!(cancelled, Err(WaitError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_by_key() {
        let limiter = limiter(1.0, 1);

        assert_eq!(limiter.reserve("k").delay(), Duration::ZERO);
        let pending = limiter.reserve("k");
        assert!(pending.ok());
        assert_eq!(pending.delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_never_policy_keeps_buckets() {
        let limiter = limiter(1.0, 1);
        limiter.allow("a");

        assert_eq!(limiter.reclaim(), 0);
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_policy_drops_refilled_buckets() {
        let options = RateLimiterOptions::new(1.0, 1)
            .reclaim_idle(Duration::from_secs(5), Duration::from_secs(1));
        let limiter = RateLimiter::new(options);

        limiter.allow("idle");
        advance(Duration::from_secs(4)).await;
        limiter.allow("busy");
        advance(Duration::from_secs(2)).await;

        assert_eq!(limiter.reclaim(), 1);
        assert_eq!(limiter.len(), 1);
        // A recreated bucket starts full, same as the one dropped.
        assert!(limiter.allow("idle"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaimer_task_runs_and_stops() {
        let options = RateLimiterOptions::new(10.0, 1)
            .reclaim_idle(Duration::from_secs(1), Duration::from_secs(2));
        let limiter = Arc::new(RateLimiter::new(options));
        limiter.allow("a");
        limiter.allow("b");

        let handle = limiter.spawn_reclaimer();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(limiter.is_empty());

        drop(limiter);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(handle.is_finished());
    }

    #[test]
    fn test_ip_limiter_allows_by_ip() {
        let limiter = IpRateLimiter::new(1.0, 2);

        assert!(limiter.allow_ip("10.0.0.1"));
        assert!(limiter.allow_ip("10.0.0.1"));
        assert!(!limiter.allow_ip("10.0.0.1"));
        assert!(limiter.allow_ip("10.0.0.2"));
    }
}
