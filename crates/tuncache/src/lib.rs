//! # tuncache
//!
//! Weight-bounded LRU cache backing the tunnel registry.
//!
//! ## Architecture
//! - **HashMap**: AHash index from key to list slot (O(1))
//! - **LRU List**: index-linked list over a node slab for promotion and eviction (O(1))
//! - **Accounting**: every value reports its own size through [`Weighted`];
//!   the cache evicts from the tail until the total fits the capacity
//! - **Snapshots**: entries can be saved to and replayed from a byte stream

#![warn(missing_docs)]

mod cache;
mod error;
mod lru;
mod snapshot;
mod stats;
mod weight;

pub use cache::{RegistryCache, StringCache};
pub use error::{Error, Result};
pub use snapshot::{MAX_RECORD_SIZE, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use stats::{CacheStats, Counters};
pub use weight::Weighted;
