//! Vector-capable `KVStore` over an embedded SurrealDB instance.
//!
//! Follows a `CacheStore`-style shape: schema versioning, a
//! `DEFINE INDEX ... HNSW` vector index, cosine-similarity recomputation
//! on every hit (never trusting the ANN backend's raw distance score),
//! and a dimension-mismatch compatibility guard that purges rather than
//! silently corrupts. Generalized here from a single fixed table of
//! response entries to the full `KVStore` surface: scalar get/set,
//! counters, lists, hashes, and named vector indexes over arbitrary key
//! prefixes.

use super::{DistanceMetric, KVStore, KvError, VectorMatch};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use surrealdb::engine::local::{Db, Mem, RocksDb};
use surrealdb::Surreal;
use tracing::{instrument, warn};

const CURRENT_SCHEMA_VERSION: i64 = 1;

/// A registered vector index: `set()` calls on keys under `prefix` are
/// mirrored into the `vectors` table so `vector_knn` can find them.
#[derive(Clone)]
struct IndexDef {
    name: String,
    prefix: String,
    dim: u16,
}

/// `KVStore` backed by embedded SurrealDB with a native HNSW vector index.
///
/// A key matching a registered index's prefix is mirrored into the index
/// as soon as its vector bytes are written, whether via a plain `set()`
/// (a raw little-endian float32 value) or via `hash_set()`'s `embedding`
/// field (an `EmbeddingRecord`) — callers never call a separate "insert
/// vector" method.
#[derive(Clone)]
pub struct SurrealKvStore {
    db: Surreal<Db>,
    indexes: Arc<RwLock<Vec<IndexDef>>>,
}

impl SurrealKvStore {
    /// Ephemeral in-memory instance. Suitable for tests and for the
    /// `cache-ephemeral` feature.
    #[cfg(feature = "cache-ephemeral")]
    pub async fn ephemeral() -> Result<Self, KvError> {
        let db = Surreal::new::<Mem>(())
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Self::init(db).await
    }

    /// Persistent instance backed by RocksDB at `path`.
    #[cfg(feature = "cache-persistent")]
    pub async fn persistent(path: &str) -> Result<Self, KvError> {
        let db = Surreal::new::<RocksDb>(path)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Self::init(db).await
    }

    async fn init(db: Surreal<Db>) -> Result<Self, KvError> {
        db.use_ns("skycache")
            .use_db("kv")
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let store = Self {
            db,
            indexes: Arc::new(RwLock::new(Vec::new())),
        };
        store.apply_schema().await?;
        Ok(store)
    }

    fn matching_index(&self, key: &str) -> Option<IndexDef> {
        self.indexes
            .read()
            .expect("lock poisoned")
            .iter()
            .find(|idx| key.starts_with(&idx.prefix))
            .cloned()
    }

    fn decode_vector(bytes: &[u8], dim: u16) -> Option<Vec<f32>> {
        if bytes.len() != dim as usize * 4 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    async fn mirror_into_index(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let Some(idx) = self.matching_index(key) else {
            return Ok(());
        };
        let Some(vector) = Self::decode_vector(value, idx.dim) else {
            warn!(key, index = idx.name.as_str(), "value is not a valid embedding vector, skipping index mirror");
            return Ok(());
        };
        let field = format!("embedding_{}", idx.name);
        let sql = format!(
            "UPDATE type::thing('vectors', $key) MERGE {{ key: $key, index_name: $name, {field}: $vec }}"
        );
        self.db
            .query(&sql)
            .bind(("key", key.to_string()))
            .bind(("name", idx.name))
            .bind(("vec", vector))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(())
    }

    /// Define the backing tables and check schema version. Table schemas
    /// are `SCHEMALESS` here since `KVStore` is a generic byte-oriented
    /// interface, not a fixed entity shape.
    async fn apply_schema(&self) -> Result<(), KvError> {
        self.db
            .query(
                "DEFINE TABLE IF NOT EXISTS schema_version SCHEMAFULL;
                 DEFINE FIELD IF NOT EXISTS version ON schema_version TYPE int;
                 DEFINE TABLE IF NOT EXISTS kv SCHEMALESS;
                 DEFINE INDEX IF NOT EXISTS idx_kv_key ON kv FIELDS key UNIQUE;
                 DEFINE TABLE IF NOT EXISTS vectors SCHEMALESS;
                 DEFINE INDEX IF NOT EXISTS idx_vectors_key ON vectors FIELDS key UNIQUE;",
            )
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;

        let mut resp = self
            .db
            .query("SELECT version FROM schema_version LIMIT 1")
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let rows: Vec<BTreeMap<String, i64>> = resp
            .take(0)
            .map_err(|e| KvError::Unavailable(e.to_string()))?;

        if rows.is_empty() {
            self.db
                .query("INSERT INTO schema_version { version: $v }")
                .bind(("v", CURRENT_SCHEMA_VERSION))
                .await
                .map_err(|e| KvError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Purge every row in a named vector index whose stored dimension no
    /// longer matches `dim`, logging once rather than silently returning
    /// garbage neighbours on a dimension mismatch.
    async fn guard_dimension(&self, name: &str, dim: u16) -> Result<(), KvError> {
        let field = format!("embedding_{name}");
        let sql = format!(
            "SELECT array::len({field}) AS len FROM vectors WHERE index_name = $name LIMIT 1"
        );
        let mut resp = self
            .db
            .query(&sql)
            .bind(("name", name.to_string()))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let rows: Vec<BTreeMap<String, i64>> = resp
            .take(0)
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        if let Some(row) = rows.first() {
            if let Some(&existing) = row.get("len") {
                if existing > 0 && existing as u16 != dim {
                    warn!(
                        index = name,
                        expected = dim,
                        actual = existing,
                        "vector index dimension mismatch, purging"
                    );
                    self.db
                        .query("DELETE FROM vectors WHERE index_name = $name")
                        .bind(("name", name.to_string()))
                        .await
                        .map_err(|e| KvError::Unavailable(e.to_string()))?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KVStore for SurrealKvStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut resp = self
            .db
            .query(
                "SELECT value FROM kv
                 WHERE key = $key AND (expires_at IS NONE OR expires_at > time::now())
                 LIMIT 1",
            )
            .bind(("key", key.to_string()))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let rows: Vec<BTreeMap<String, String>> = resp
            .take(0)
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        rows.first()
            .and_then(|r| r.get("value"))
            .map(|v| STANDARD.decode(v).map_err(|e| KvError::Serialization(e.to_string())))
            .transpose()
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: std::time::Duration) -> Result<(), KvError> {
        let encoded = STANDARD.encode(&value);
        let ttl_secs = ttl.as_secs();
        self.db
            .query(
                "UPDATE type::thing('kv', $key) MERGE {
                     key: $key, value: $encoded,
                     expires_at: IF $ttl > 0 THEN time::now() + duration::from_secs($ttl) ELSE NONE END
                 }",
            )
            .bind(("key", key.to_string()))
            .bind(("encoded", encoded))
            .bind(("ttl", ttl_secs))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        self.mirror_into_index(key, &value).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: std::time::Duration,
    ) -> Result<bool, KvError> {
        if self.get(key).await?.is_some() {
            return Ok(false);
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64, KvError> {
        let mut removed = 0u64;
        for key in keys {
            let existed = self.get(key).await?.is_some();
            self.db
                .query("DELETE FROM kv WHERE key = $key")
                .bind(("key", key.to_string()))
                .await
                .map_err(|e| KvError::Unavailable(e.to_string()))?;
            if existed {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, KvError> {
        match self.get(key).await? {
            Some(current) if current == expected => {
                self.delete(&[key]).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let current = match self.get(key).await? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| KvError::Serialization(format!("key `{key}` is not an integer")))?,
            None => 0,
        };
        let next = current + delta;
        self.set(key, next.to_string().into_bytes(), std::time::Duration::ZERO)
            .await?;
        Ok(next)
    }

    async fn list_push_right(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        let encoded = STANDARD.encode(&value);
        let mut resp = self
            .db
            .query(
                "UPDATE type::thing('kv', $key) MERGE { key: $key, list: array::append(list OR [], $v) } RETURN AFTER",
            )
            .bind(("key", key.to_string()))
            .bind(("v", encoded))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let rows: Vec<BTreeMap<String, serde_json::Value>> = resp
            .take(0)
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(rows
            .first()
            .and_then(|r| r.get("list"))
            .and_then(|v| v.as_array())
            .map(|a| a.len() as u64)
            .unwrap_or(0))
    }

    async fn list_pop_left(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>, KvError> {
        let mut resp = self
            .db
            .query("SELECT list FROM kv WHERE key = $key LIMIT 1")
            .bind(("key", key.to_string()))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let rows: Vec<BTreeMap<String, Vec<String>>> = resp
            .take(0)
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let Some(list) = rows.into_iter().next().and_then(|mut r| r.remove("list")) else {
            return Ok(Vec::new());
        };
        let n = count.min(list.len());
        let (popped, rest) = list.split_at(n);
        let rest = rest.to_vec();
        self.db
            .query("UPDATE type::thing('kv', $key) MERGE { list: $rest }")
            .bind(("key", key.to_string()))
            .bind(("rest", rest))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        popped
            .iter()
            .map(|s| STANDARD.decode(s).map_err(|e| KvError::Serialization(e.to_string())))
            .collect()
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> Result<(), KvError> {
        // `MERGE` only merges at the top level, so a nested `hash` object
        // would be replaced wholesale rather than updated field-by-field.
        // Ensure the container exists, then set each field by its own path.
        self.db
            .query("UPDATE type::thing('kv', $key) MERGE { key: $key, hash: hash OR {} }")
            .bind(("key", key.to_string()))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        for (field, value) in fields {
            let path = format!("hash.{field}");
            self.db
                .query(format!("UPDATE type::thing('kv', $key) SET {path} = $value"))
                .bind(("key", key.to_string()))
                .bind(("value", STANDARD.encode(value)))
                .await
                .map_err(|e| KvError::Unavailable(e.to_string()))?;
        }
        // `EmbeddingRecord`s are hashes with an `embedding` field, not
        // plain scalar values — mirror that field the same way `set()`
        // mirrors a plain vector write.
        if let Some((_, vector_bytes)) = fields.iter().find(|(name, _)| *name == "embedding") {
            self.mirror_into_index(key, vector_bytes).await?;
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let mut resp = self
            .db
            .query("SELECT hash FROM kv WHERE key = $key LIMIT 1")
            .bind(("key", key.to_string()))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let rows: Vec<BTreeMap<String, BTreeMap<String, String>>> = resp
            .take(0)
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let Some(hash) = rows.into_iter().next().and_then(|mut r| r.remove("hash")) else {
            return Ok(Vec::new());
        };
        hash.into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(&v)
                    .map(|bytes| (k, bytes))
                    .map_err(|e| KvError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let prefix = pattern.trim_end_matches('*');
        let mut resp = self
            .db
            .query("SELECT key FROM kv WHERE string::starts_with(key, $prefix)")
            .bind(("prefix", prefix.to_string()))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let rows: Vec<BTreeMap<String, String>> = resp
            .take(0)
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(rows.into_iter().filter_map(|mut r| r.remove("key")).collect())
    }

    async fn vector_index_create(
        &self,
        name: &str,
        prefix: &str,
        dim: u16,
        metric: DistanceMetric,
    ) -> Result<(), KvError> {
        let DistanceMetric::Cosine = metric;
        self.guard_dimension(name, dim).await?;
        let field = format!("embedding_{name}");
        let ddl = format!(
            "DEFINE FIELD IF NOT EXISTS {field} ON vectors TYPE option<array<float>>;
             DEFINE INDEX IF NOT EXISTS hnsw_{name} ON vectors FIELDS {field}
                 HNSW DIMENSION {dim} DIST COSINE;"
        );
        self.db
            .query(&ddl)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;

        let mut indexes = self.indexes.write().expect("lock poisoned");
        if let Some(existing) = indexes.iter_mut().find(|idx| idx.name == name) {
            existing.prefix = prefix.to_string();
            existing.dim = dim;
        } else {
            indexes.push(IndexDef {
                name: name.to_string(),
                prefix: prefix.to_string(),
                dim,
            });
        }
        Ok(())
    }

    async fn vector_knn(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<VectorMatch>, KvError> {
        let field = format!("embedding_{name}");
        let sql = format!(
            "SELECT key, vector::similarity::cosine({field}, $vec) AS score
             FROM vectors
             WHERE index_name = $name AND {field} <|{k}, COSINE|> $vec
             ORDER BY score DESC LIMIT {k}"
        );
        let mut resp = self
            .db
            .query(&sql)
            .bind(("vec", vector.to_vec()))
            .bind(("name", name.to_string()))
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        let rows: Vec<BTreeMap<String, serde_json::Value>> = resp
            .take(0)
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let key = r.get("key")?.as_str()?.to_string();
                let score = r.get("score")?.as_f64()? as f32;
                Some(VectorMatch { key, score })
            })
            .collect())
    }

    fn supports_vectors(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[cfg(feature = "cache-ephemeral")]
mod tests {
    use super::*;
    use crate::kvstore::DistanceMetric;
    use std::time::Duration;

    #[tokio::test]
    async fn scalar_round_trip() -> Result<(), KvError> {
        let store = SurrealKvStore::ephemeral().await?;
        store.set("airport:JFK", b"John F Kennedy".to_vec(), Duration::ZERO).await?;
        assert_eq!(
            store.get("airport:JFK").await?,
            Some(b"John F Kennedy".to_vec())
        );
        Ok(())
    }

    #[tokio::test]
    async fn vector_knn_recovers_nearest_neighbour() -> Result<(), KvError> {
        let store = SurrealKvStore::ephemeral().await?;
        store
            .vector_index_create("prompt_embeddings", "embedding:prompt:", 3, DistanceMetric::Cosine)
            .await?;

        let close: Vec<f32> = vec![1.0, 0.0, 0.0];
        let far: Vec<f32> = vec![0.0, 1.0, 0.0];
        let close_bytes: Vec<u8> = close.iter().flat_map(|f| f.to_le_bytes()).collect();
        let far_bytes: Vec<u8> = far.iter().flat_map(|f| f.to_le_bytes()).collect();

        store
            .set("embedding:prompt:a", close_bytes, Duration::ZERO)
            .await?;
        store
            .set("embedding:prompt:b", far_bytes, Duration::ZERO)
            .await?;

        let hits = store
            .vector_knn("prompt_embeddings", &[0.99, 0.01, 0.0], 1)
            .await?;
        assert_eq!(hits.first().map(|h| h.key.as_str()), Some("embedding:prompt:a"));
        Ok(())
    }

    #[tokio::test]
    async fn set_if_absent_rejects_existing_key() -> Result<(), KvError> {
        let store = SurrealKvStore::ephemeral().await?;
        assert!(store.set_if_absent("lock:a", b"1".to_vec(), Duration::ZERO).await?);
        assert!(!store.set_if_absent("lock:a", b"2".to_vec(), Duration::ZERO).await?);
        Ok(())
    }

    #[tokio::test]
    async fn hash_set_updates_fields_independently() -> Result<(), KvError> {
        let store = SurrealKvStore::ephemeral().await?;
        store.hash_set("flight:UA100", &[("status", b"on_time".to_vec())]).await?;
        store.hash_set("flight:UA100", &[("gate", b"B12".to_vec())]).await?;
        let fields = store.hash_get_all("flight:UA100").await?;
        assert_eq!(fields.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn hash_set_embedding_field_is_mirrored_into_the_vector_index() -> Result<(), KvError> {
        let store = SurrealKvStore::ephemeral().await?;
        store
            .vector_index_create("prompt_embeddings", "embedding:prompt:", 2, DistanceMetric::Cosine)
            .await?;

        let vector: Vec<f32> = vec![1.0, 0.0];
        let bytes: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        store
            .hash_set(
                "embedding:prompt:abc",
                &[
                    ("prompt", b"nonstop flights to denver".to_vec()),
                    ("query_key", b"query:deadbeef".to_vec()),
                    ("embedding", bytes),
                ],
            )
            .await?;

        let hits = store.vector_knn("prompt_embeddings", &[0.9, 0.1], 1).await?;
        assert_eq!(hits.first().map(|h| h.key.as_str()), Some("embedding:prompt:abc"));
        Ok(())
    }
}
