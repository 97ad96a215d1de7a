//! Explicit handle bundle passed to the engine.
//!
//! The engine never reaches for process-wide singletons; it receives a
//! [`Repositories`] at construction and clones the `Arc`s it needs.

use std::sync::Arc;

use crate::client::ControlPlaneStore;
use crate::memory::{InMemoryOutbox, InMemoryResources, InMemorySecrets, InMemoryStatuses};
use crate::observed::{CacheConfig, MokaObservedCache};
use crate::repository::{
    ObservedCache, OutboxConfig, OutboxQueue, ResourceRepository, SecretsRepository,
    StatusRepository,
};
use crate::surreal::{SurrealOutbox, SurrealResources, SurrealSecrets, SurrealStatuses};

/// Every persistence handle the engine uses.
#[derive(Clone)]
pub struct Repositories {
    pub resources: Arc<dyn ResourceRepository>,
    pub statuses: Arc<dyn StatusRepository>,
    pub outbox: Arc<dyn OutboxQueue>,
    pub secrets: Arc<dyn SecretsRepository>,
    pub observed: Arc<dyn ObservedCache>,
}

impl Repositories {
    /// SurrealDB-backed repositories sharing one store connection, with a
    /// process-local observed cache.
    #[must_use]
    pub fn surreal(
        store: &ControlPlaneStore,
        outbox: OutboxConfig,
        cache: CacheConfig,
    ) -> Self {
        Self {
            resources: Arc::new(SurrealResources::new(store.clone())),
            statuses: Arc::new(SurrealStatuses::new(store.clone())),
            outbox: Arc::new(SurrealOutbox::new(store.clone(), outbox)),
            secrets: Arc::new(SurrealSecrets::new(store.clone())),
            observed: Arc::new(MokaObservedCache::with_config(cache)),
        }
    }
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}

/// In-memory backend keeping typed handles so callers can seed and inspect
/// state directly.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    pub resources: Arc<InMemoryResources>,
    pub statuses: Arc<InMemoryStatuses>,
    pub outbox: Arc<InMemoryOutbox>,
    pub secrets: Arc<InMemorySecrets>,
    pub observed: Arc<MokaObservedCache>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new(outbox: OutboxConfig, cache: CacheConfig) -> Self {
        Self {
            resources: Arc::new(InMemoryResources::new()),
            statuses: Arc::new(InMemoryStatuses::new()),
            outbox: Arc::new(InMemoryOutbox::new(outbox)),
            secrets: Arc::new(InMemorySecrets::new()),
            observed: Arc::new(MokaObservedCache::with_config(cache)),
        }
    }

    /// Trait-object view over the same underlying state.
    #[must_use]
    pub fn repositories(&self) -> Repositories {
        Repositories {
            resources: self.resources.clone(),
            statuses: self.statuses.clone(),
            outbox: self.outbox.clone(),
            secrets: self.secrets.clone(),
            observed: self.observed.clone(),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(OutboxConfig::default(), CacheConfig::default())
    }
}
