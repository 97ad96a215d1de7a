//! Identifier newtypes.
//!
//! Resource and secret ids are assigned by the API layer, so they wrap plain
//! strings. Event and request ids are generated here from ULIDs, which keeps
//! them lexicographically ordered by creation time.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an id from an existing string.
            #[must_use]
            pub fn from_string(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Unique identifier of a resource, assigned by the API.
    ResourceId
);

string_id!(
    /// Identifier of a project owning resources.
    ProjectId
);

string_id!(
    /// Unique identifier of an outbox event.
    EventId
);

string_id!(
    /// Identity of a worker process holding outbox leases.
    WorkerId
);

string_id!(
    /// Identifier of a stored secret.
    SecretId
);

string_id!(
    /// Correlation id for one reconcile attempt.
    RequestId
);

impl EventId {
    /// Generate a new time-ordered event id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }
}

impl SecretId {
    /// Generate a new secret id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("sec-{}", Ulid::new()))
    }
}

impl WorkerId {
    /// Generate a worker id from a host label plus a random suffix.
    #[must_use]
    pub fn generate(host: &str) -> Self {
        Self(format!("{host}-{}", Ulid::new()))
    }
}

impl RequestId {
    /// Request id for an attempt triggered by an outbox event.
    #[must_use]
    pub fn for_event(worker: &WorkerId, event: &EventId) -> Self {
        Self(format!("{worker}:{event}"))
    }

    /// Request id for an attempt triggered by the drift sweep.
    #[must_use]
    pub fn for_sweep(worker: &WorkerId, resource: &ResourceId) -> Self {
        Self(format!("sweep:{worker}:{resource}:{}", Ulid::new()))
    }
}
