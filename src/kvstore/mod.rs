//! The `KVStore` abstraction: a uniform interface over the backing
//! key/value server(s), independent of whether the concrete backend has a
//! native approximate-vector search capability.
//!
//! Modeled the way a `TokenStorage` trait typically is: a `Send + Sync`
//! trait with a blanket impl for `Arc<T>` so callers can hold a `dyn
//! KVStore` behind that pointer type interchangeably.

mod memory;
mod surreal;

pub use memory::InMemoryKvStore;
pub use surreal::SurrealKvStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Errors a `KVStore` implementation can surface.
///
/// `Conflict` is not an error path for callers of `set_if_absent` — it is
/// the expected "someone else already holds this" signal and is handled
/// by returning `Ok(false)` from that method instead. It remains in this
/// enum only because some backends report it at the wire-protocol level
/// and need a typed place to land before being translated.
#[derive(Debug, thiserror::Error, Clone)]
pub enum KvError {
    #[error("key/value store unavailable: {0}")]
    Unavailable(String),

    #[error("capability not supported by this backend: {0}")]
    NotSupported(&'static str),

    #[error("conflict")]
    Conflict,

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Vector search parameters accepted by [`KVStore::vector_index_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Cosine,
}

/// A single ANN match: the matched key and a similarity score (cosine,
/// higher is more similar).
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub key: String,
    pub score: f32,
}

/// Uniform interface over the backing key/value server.
///
/// All methods are safe to call concurrently from multiple tasks; a
/// well-behaved implementation does not hold a lock across an `.await`
/// point longer than the single operation it protects.
#[async_trait]
pub trait KVStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// `ttl = Duration::ZERO` means "no expiry".
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError>;

    /// Atomically create `key` with `value` only if absent. Returns `true`
    /// if this call created the key, `false` if it already existed — the
    /// latter is a normal result, not an error.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration)
        -> Result<bool, KvError>;

    /// Delete zero or more keys; returns the number actually removed.
    async fn delete(&self, keys: &[&str]) -> Result<u64, KvError>;

    /// Delete `key` only if its current value equals `expected` exactly
    /// (compare-and-delete). Returns `true` if deleted.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, KvError>;

    /// Atomically increment a key by `delta`, creating it at 0 first if
    /// absent, and return the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError>;

    /// Push `value` onto the right (tail) of the list at `key`, returning
    /// the new list length.
    async fn list_push_right(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError>;

    /// Pop up to `count` elements from the left (head) of the list at
    /// `key`, in FIFO order.
    async fn list_pop_left(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>, KvError>;

    /// Set one or more hash fields on `key`.
    async fn hash_set(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> Result<(), KvError>;

    /// Fetch every field of the hash at `key`.
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, KvError>;

    /// Enumerate keys matching `pattern` (e.g. `"embedding:prompt:*"`)
    /// non-blockingly. Implementations must use a cursor-based scan, never
    /// a full-keyspace `KEYS` listing.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    /// Idempotently create a vector index. Returns `Err(NotSupported)` on
    /// backends without native ANN search.
    async fn vector_index_create(
        &self,
        name: &str,
        prefix: &str,
        dim: u16,
        metric: DistanceMetric,
    ) -> Result<(), KvError>;

    /// k-nearest-neighbour search. Returns `Err(NotSupported)` on backends
    /// without native ANN search — callers should fall back to
    /// [`crate::vector_index::brute_force`].
    async fn vector_knn(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorMatch>, KvError>;

    /// Whether this backend has a native vector search capability. Lets
    /// callers skip a doomed `vector_knn` call and log the fallback once.
    fn supports_vectors(&self) -> bool;
}

#[async_trait]
impl<T: KVStore + ?Sized> KVStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        (**self).get(key).await
    }
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        (**self).set(key, value, ttl).await
    }
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        (**self).set_if_absent(key, value, ttl).await
    }
    async fn delete(&self, keys: &[&str]) -> Result<u64, KvError> {
        (**self).delete(keys).await
    }
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, KvError> {
        (**self).delete_if_equals(key, expected).await
    }
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        (**self).incr_by(key, delta).await
    }
    async fn list_push_right(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        (**self).list_push_right(key, value).await
    }
    async fn list_pop_left(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>, KvError> {
        (**self).list_pop_left(key, count).await
    }
    async fn hash_set(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> Result<(), KvError> {
        (**self).hash_set(key, fields).await
    }
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        (**self).hash_get_all(key).await
    }
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        (**self).scan(pattern).await
    }
    async fn vector_index_create(
        &self,
        name: &str,
        prefix: &str,
        dim: u16,
        metric: DistanceMetric,
    ) -> Result<(), KvError> {
        (**self).vector_index_create(name, prefix, dim, metric).await
    }
    async fn vector_knn(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorMatch>, KvError> {
        (**self).vector_knn(name, vector, k).await
    }
    fn supports_vectors(&self) -> bool {
        (**self).supports_vectors()
    }
}

/// Build a namespaced cache key: `<namespace>:<rest...>`, joined with `:`,
/// the sole hierarchy delimiter. Enforces the 512-byte key size invariant
/// as a contract violation (caller bug), not a recoverable error — checked
/// in every build, not just debug, since a release build silently storing
/// an oversized key is exactly the failure mode this guards against.
pub fn cache_key(parts: &[&str]) -> String {
    let key = parts.join(":");
    assert!(
        key.len() <= 512,
        "cache key exceeds 512 bytes: {} bytes",
        key.len()
    );
    key
}
