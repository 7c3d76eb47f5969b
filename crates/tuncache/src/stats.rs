//! Cache statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Running hit/miss/eviction counters for a cache instance
#[derive(Debug, Default)]
pub struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    inserts: AtomicU64,
}

impl Counters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lookup that found its key
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lookup that missed
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `n` evicted entries
    pub fn record_evictions(&self, n: usize) {
        if n > 0 {
            self.evictions.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Record an insert or update
    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total hits
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get total misses
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get total evictions
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get total inserts
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of a cache
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of entries
    pub length: u64,
    /// Total weight of all entries
    pub size: u64,
    /// Weight ceiling
    pub capacity: u64,
    /// Last access of the least recently used entry, `None` when empty
    pub oldest_access: Option<DateTime<Utc>>,
    /// Lookups that found their key
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Entries dropped by capacity enforcement
    pub evictions: u64,
    /// Calls to `set`, inserts and updates alike
    pub inserts: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Render as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
