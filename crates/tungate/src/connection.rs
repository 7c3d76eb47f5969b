//! Per-key connection limiting: a request rate plus a concurrency ceiling.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::Mutex;

use crate::limiter::{RateLimiter, RateLimiterOptions, DEFAULT_RECLAIM_INTERVAL};

/// Limits how fast a key may open connections and how many it may hold.
///
/// The token bucket and the in-flight counters live behind separate locks,
/// so a rate check and the count check that follows are not one atomic step.
pub struct ConnectionLimiter {
    limiter: Arc<RateLimiter>,
    max_connections: usize,
    connections: Mutex<HashMap<String, usize, RandomState>>,
}

impl ConnectionLimiter {
    /// Connection limiter reclaiming rate buckets idle for ten minutes
    pub fn new(rate: f64, burst: u32, max_connections: usize) -> Self {
        let options = RateLimiterOptions::new(rate, burst)
            .reclaim_idle(DEFAULT_RECLAIM_INTERVAL, DEFAULT_RECLAIM_INTERVAL);
        Self::with_limiter(RateLimiter::new(options), max_connections)
    }

    /// Build around an already configured rate limiter
    pub fn with_limiter(limiter: RateLimiter, max_connections: usize) -> Self {
        Self {
            limiter: Arc::new(limiter),
            max_connections,
            connections: Mutex::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Admit a new connection for `key`.
    ///
    /// A token is taken first; if the key is then at its ceiling the token
    /// stays spent. Every `true` must be paired with one
    /// [`release_connection`](Self::release_connection).
    pub fn allow_connection(&self, key: &str) -> bool {
        if !self.limiter.allow(key) {
            return false;
        }

        let mut connections = self.connections.lock();
        let count = connections.entry(key.to_string()).or_insert(0);
        if *count >= self.max_connections {
            if *count == 0 {
                connections.remove(key);
            }
            return false;
        }
        *count += 1;
        true
    }

    /// Give back a connection slot. Unknown keys are ignored.
    pub fn release_connection(&self, key: &str) {
        let mut connections = self.connections.lock();
        if let Some(count) = connections.get_mut(key) {
            if *count > 0 {
                *count -= 1;
            }
            if *count == 0 {
                connections.remove(key);
            }
        }
    }

    /// Admit a connection and return a permit that releases it on drop
    pub fn acquire(self: &Arc<Self>, key: &str) -> Option<ConnectionPermit> {
        if self.allow_connection(key) {
            Some(ConnectionPermit {
                limiter: Arc::clone(self),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    /// Connections currently held by `key`
    pub fn active(&self, key: &str) -> usize {
        self.connections.lock().get(key).copied().unwrap_or(0)
    }

    /// Number of keys holding at least one connection
    pub fn active_keys(&self) -> usize {
        self.connections.lock().len()
    }

    /// Underlying rate limiter
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

/// An admitted connection slot, released when dropped.
///
/// Dropping runs during unwinding too, so a panicking connection task still
/// gives its slot back.
#[must_use = "dropping the permit releases the connection slot"]
pub struct ConnectionPermit {
    limiter: Arc<ConnectionLimiter>,
    key: String,
}

impl ConnectionPermit {
    /// Key this slot was admitted under
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.limiter.release_connection(&self.key);
    }
}

impl std::fmt::Debug for ConnectionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPermit")
            .field("key", &self.key)
            .finish()
    }
}
