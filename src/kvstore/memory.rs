//! Plain in-memory `KVStore`: no vector capability, representing the
//! "ordinary key/value server" backend family. Shaped like a
//! `MemoryTokenStorage`: an `Arc<RwLock<HashMap>>` guard, made async and
//! generalized from token storage to the full `KVStore` surface (strings,
//! counters, lists, hashes).

use super::{DistanceMetric, KVStore, KvError, VectorMatch};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::instrument;

#[derive(Clone)]
enum Entry {
    Bytes(Vec<u8>),
    List(Vec<Vec<u8>>),
    Hash(Vec<(String, Vec<u8>)>),
}

struct Slot {
    value: Entry,
    expires_at: Option<Instant>,
}

/// In-memory `KVStore`. Useful for tests and for components that need no
/// vector search (e.g. a cache-aside-only deployment). The storage is
/// `Clone` and shares its backing map across clones.
#[derive(Clone)]
pub struct InMemoryKvStore {
    inner: std::sync::Arc<RwLock<HashMap<String, Slot>>>,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn live(slot: &Slot) -> bool {
        match slot.expires_at {
            Some(at) => at > Instant::now(),
            None => true,
        }
    }
}

#[async_trait]
impl KVStore for InMemoryKvStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let guard = self.inner.read().expect("lock poisoned");
        match guard.get(key) {
            Some(slot) if Self::live(slot) => match &slot.value {
                Entry::Bytes(b) => Ok(Some(b.clone())),
                _ => Err(KvError::Serialization(format!(
                    "key `{key}` does not hold a scalar value"
                ))),
            },
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        let mut guard = self.inner.write().expect("lock poisoned");
        guard.insert(
            key.to_string(),
            Slot {
                value: Entry::Bytes(value),
                expires_at: if ttl.is_zero() {
                    None
                } else {
                    Some(Instant::now() + ttl)
                },
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut guard = self.inner.write().expect("lock poisoned");
        if let Some(slot) = guard.get(key) {
            if Self::live(slot) {
                return Ok(false);
            }
        }
        guard.insert(
            key.to_string(),
            Slot {
                value: Entry::Bytes(value),
                expires_at: if ttl.is_zero() {
                    None
                } else {
                    Some(Instant::now() + ttl)
                },
            },
        );
        Ok(true)
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64, KvError> {
        let mut guard = self.inner.write().expect("lock poisoned");
        Ok(keys.iter().filter(|k| guard.remove(**k).is_some()).count() as u64)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, KvError> {
        let mut guard = self.inner.write().expect("lock poisoned");
        let matches = matches!(
            guard.get(key),
            Some(Slot { value: Entry::Bytes(b), .. }) if b.as_slice() == expected
        );
        if matches {
            guard.remove(key);
        }
        Ok(matches)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let mut guard = self.inner.write().expect("lock poisoned");
        let current = match guard.get(key) {
            Some(Slot { value: Entry::Bytes(b), .. }) => {
                std::str::from_utf8(b)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| KvError::Serialization(format!("key `{key}` is not an integer")))?
            }
            Some(_) => {
                return Err(KvError::Serialization(format!(
                    "key `{key}` does not hold a scalar value"
                )))
            }
            None => 0,
        };
        let next = current + delta;
        guard.insert(
            key.to_string(),
            Slot {
                value: Entry::Bytes(next.to_string().into_bytes()),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn list_push_right(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        let mut guard = self.inner.write().expect("lock poisoned");
        let slot = guard.entry(key.to_string()).or_insert(Slot {
            value: Entry::List(Vec::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Entry::List(list) => {
                list.push(value);
                Ok(list.len() as u64)
            }
            _ => Err(KvError::Serialization(format!(
                "key `{key}` does not hold a list"
            ))),
        }
    }

    async fn list_pop_left(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>, KvError> {
        let mut guard = self.inner.write().expect("lock poisoned");
        match guard.get_mut(key) {
            Some(Slot { value: Entry::List(list), .. }) => {
                let n = count.min(list.len());
                Ok(list.drain(..n).collect())
            }
            Some(_) => Err(KvError::Serialization(format!(
                "key `{key}` does not hold a list"
            ))),
            None => Ok(Vec::new()),
        }
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> Result<(), KvError> {
        let mut guard = self.inner.write().expect("lock poisoned");
        let slot = guard.entry(key.to_string()).or_insert(Slot {
            value: Entry::Hash(Vec::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Entry::Hash(existing) => {
                for (field, value) in fields {
                    if let Some(entry) = existing.iter_mut().find(|(f, _)| f == field) {
                        entry.1 = value.clone();
                    } else {
                        existing.push((field.to_string(), value.clone()));
                    }
                }
                Ok(())
            }
            _ => Err(KvError::Serialization(format!(
                "key `{key}` does not hold a hash"
            ))),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let guard = self.inner.read().expect("lock poisoned");
        match guard.get(key) {
            Some(Slot { value: Entry::Hash(fields), .. }) => Ok(fields.clone()),
            Some(_) => Err(KvError::Serialization(format!(
                "key `{key}` does not hold a hash"
            ))),
            None => Ok(Vec::new()),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let prefix = pattern.trim_end_matches('*');
        let guard = self.inner.read().expect("lock poisoned");
        Ok(guard
            .iter()
            .filter(|(k, slot)| k.starts_with(prefix) && Self::live(slot))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn vector_index_create(
        &self,
        _name: &str,
        _prefix: &str,
        _dim: u16,
        _metric: DistanceMetric,
    ) -> Result<(), KvError> {
        Err(KvError::NotSupported("InMemoryKvStore has no vector index"))
    }

    async fn vector_knn(
        &self,
        _name: &str,
        _vector: &[f32],
        _k: usize,
    ) -> Result<Vec<VectorMatch>, KvError> {
        Err(KvError::NotSupported("InMemoryKvStore has no vector index"))
    }

    fn supports_vectors(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_store_is_empty() {
        let store = InMemoryKvStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemoryKvStore::new();
        store.set("k", b"v".to_vec(), Duration::ZERO).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn set_if_absent_rejects_existing_key() {
        let store = InMemoryKvStore::new();
        assert!(store.set_if_absent("k", b"a".to_vec(), Duration::ZERO).await.unwrap());
        assert!(!store.set_if_absent("k", b"b".to_vec(), Duration::ZERO).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn ttl_expiry_is_observed() {
        let store = InMemoryKvStore::new();
        store
            .set("k", b"v".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_by_creates_then_accumulates() {
        let store = InMemoryKvStore::new();
        assert_eq!(store.incr_by("counter", 5).await.unwrap(), 5);
        assert_eq!(store.incr_by("counter", -2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn list_push_and_pop_is_fifo() {
        let store = InMemoryKvStore::new();
        store.list_push_right("q", b"1".to_vec()).await.unwrap();
        store.list_push_right("q", b"2".to_vec()).await.unwrap();
        let popped = store.list_pop_left("q", 1).await.unwrap();
        assert_eq!(popped, vec![b"1".to_vec()]);
    }

    #[tokio::test]
    async fn delete_if_equals_only_deletes_on_match() {
        let store = InMemoryKvStore::new();
        store.set("k", b"v".to_vec(), Duration::ZERO).await.unwrap();
        assert!(!store.delete_if_equals("k", b"wrong").await.unwrap());
        assert!(store.delete_if_equals("k", b"v").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn vectors_are_not_supported() {
        let store = InMemoryKvStore::new();
        assert!(!store.supports_vectors());
        assert!(matches!(
            store
                .vector_knn("idx", &[0.1, 0.2], 5)
                .await
                .unwrap_err(),
            KvError::NotSupported(_)
        ));
    }
}
