//! # Cache Module
//!
//! Concurrent metadata cache used by the source resolver.
//!
//! Looking up a URL means spawning an extractor process, which takes
//! seconds. Resolved [`TrackInfo`] is cached per URL so queueing the same
//! link again (or loading a playlist that repeats it) is instant.
//!
//! ## Features
//!
//! - **LRU Eviction**: the least recently read entry goes first when full
//! - **TTL Support**: entries expire after `METADATA_CACHE_TTL` seconds
//! - **Thread Safety**: backed by [`dashmap`], clones share storage
//! - **Metrics**: hit/miss/eviction counters
//!
//! ## Configuration
//!
//! ```env
//! METADATA_CACHE_TTL=3600     # Time-to-live in seconds (1 hour)
//! ```

pub mod lru_cache;

use std::time::Duration;
use tracing::info;

use crate::audio::track::TrackInfo;
use lru_cache::LRUCache;

/// Entradas máximas de metadatos
pub const METADATA_CACHE_CAPACITY: usize = 500;

/// Track metadata keyed by source URL.
pub type MetadataCache = LRUCache<String, TrackInfo>;

impl MetadataCache {
    pub fn for_ttl(ttl: Duration) -> Self {
        Self::with_ttl(METADATA_CACHE_CAPACITY, ttl)
    }

    /// Removes expired entries; meant to run from a periodic task.
    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            let metrics = self.metrics();
            info!(
                "🧹 Cache cleanup: removed {} expired entries (hit rate {:.0}%)",
                removed,
                metrics.hit_rate() * 100.0
            );
        }
    }
}
