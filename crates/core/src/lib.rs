//! Ingressor core types: resource keys, errors, ownership helpers and the
//! traits the reconciliation core consumes (listers, event handlers, store).

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::networking::v1::Ingress;

mod key;
mod memory;
pub mod owner;

pub use key::{ResourceKey, KEY_SEPARATOR};
pub use memory::MemoryLister;

/// Annotation on a Service whose presence requests an Ingress.
pub const DEFAULT_ENABLE_ANNOTATION: &str = "dependent/enabled";

/// Errors surfaced by the core and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A key that can never be split into namespace/name.
    #[error("malformed key: {0:?}")]
    MalformedKey(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Lister failure other than absence.
    #[error("lookup: {0}")]
    Lookup(String),
    /// Transient failure reported by the resource store.
    #[error("store: {0}")]
    Store(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, Error::AlreadyExists(_)) }

    /// Whether retrying the same key could ever succeed.
    pub fn is_retryable(&self) -> bool { !matches!(self, Error::MalformedKey(_)) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Read-only view of a locally cached collection, keyed by namespace + name.
pub trait Lister<K>: Send + Sync {
    /// `Ok(None)` means the object is absent from the cache.
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>>;
}

/// Callbacks delivered by an event source for one watched collection.
/// Implementations must not block; they only decide what to enqueue.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &K) {}
    fn on_update(&self, _old: &K, _new: &K) {}
    fn on_delete(&self, _obj: &K) {}
}

/// Mutating calls against the store that owns dependent Ingresses.
#[async_trait::async_trait]
pub trait DependentStore: Send + Sync {
    async fn create(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

pub mod prelude {
    pub use super::{DependentStore, Error, EventHandler, Lister, MemoryLister, ResourceKey, Result};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_malformed_keys_are_permanent() {
        assert!(!Error::MalformedKey("a/b/c".into()).is_retryable());
        assert!(Error::Store("connection reset".into()).is_retryable());
        assert!(Error::AlreadyExists("default/web".into()).is_retryable());
        assert!(Error::NotFound("default/web".into()).is_not_found());
        assert!(Error::AlreadyExists("default/web".into()).is_already_exists());
    }
}
