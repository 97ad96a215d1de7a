//! Observed-state cache backed by moka.
//!
//! Entries expire after a fixed TTL applied here, so callers never stamp
//! expiry themselves. Losing the cache only means every resource reads as
//! "unknown" to the drift sweep.

use std::time::Duration;

use async_trait::async_trait;
use keel_core::{ObservedEntry, ResourceId};
use moka::sync::Cache;

use crate::error::PersistenceResult;
use crate::repository::ObservedCache;

/// Cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub max_capacity: u64,
    /// Time to live for entries
    pub ttl: Duration,
}

impl CacheConfig {
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_max_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = max_capacity;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
            ttl: Duration::from_secs(120),
        }
    }
}

/// In-process observed-state cache.
#[derive(Clone)]
pub struct MokaObservedCache {
    cache: Cache<ResourceId, ObservedEntry>,
}

impl MokaObservedCache {
    /// Create a cache with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create a cache with custom configuration
    #[must_use]
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(config.max_capacity)
                .time_to_live(config.ttl)
                .build(),
        }
    }

    /// Get the current number of cached entries
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Run pending maintenance tasks (cleanup, eviction)
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }
}

impl Default for MokaObservedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MokaObservedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaObservedCache")
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

#[async_trait]
impl ObservedCache for MokaObservedCache {
    async fn get(&self, resource_id: &ResourceId) -> PersistenceResult<Option<ObservedEntry>> {
        Ok(self.cache.get(resource_id))
    }

    async fn set(&self, resource_id: &ResourceId, entry: ObservedEntry) -> PersistenceResult<()> {
        self.cache.insert(resource_id.clone(), entry);
        Ok(())
    }

    async fn invalidate(&self, resource_id: &ResourceId) -> PersistenceResult<()> {
        self.cache.invalidate(resource_id);
        Ok(())
    }
}
