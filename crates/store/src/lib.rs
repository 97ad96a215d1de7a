//! Persistence layer for keel.
//!
//! Declared resources, their status documents, the transactional outbox,
//! secrets and the observed-state cache. SurrealDB is the durable backend;
//! in-memory implementations of the same traits back unit tests and local
//! runs.

pub mod client;
pub mod error;
pub mod memory;
pub mod observed;
pub mod repositories;
pub mod repository;
pub mod surreal;

pub use client::{ControlPlaneStore, Credentials, StoreConfig};
pub use error::{PersistenceError, PersistenceResult, from_surrealdb_error};
pub use memory::{InMemoryOutbox, InMemoryResources, InMemorySecrets, InMemoryStatuses};
pub use observed::{CacheConfig, MokaObservedCache};
pub use repositories::{InMemoryBackend, Repositories};
pub use repository::{
    ObservedCache, OutboxConfig, OutboxQueue, ResourceFilter, ResourceRepository,
    SecretsRepository, StatusRepository,
};
pub use surreal::{SurrealOutbox, SurrealResources, SurrealSecrets, SurrealStatuses};
