//! Cache-aside read path: `query:<fingerprint>` keys, JSON-encoded rows.
//!
//! Mirrors a classic `cache/store.rs` lookup-then-populate pattern,
//! generalized from a single chat-response cache to an arbitrary SQL result
//! cache keyed by [`fingerprint`].

use crate::error::CoreError;
use crate::fingerprint::fingerprint;
use crate::kvstore::{cache_key, KVStore};
use crate::row::RowSet;
use crate::sot::SoTStore;
use crate::stats::{CacheStats, CacheStatsSnapshot};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Where an `execute` result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    CacheHit,
    CacheMiss,
}

/// Outcome of [`CacheAside::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub rows: RowSet,
    pub source: Source,
    pub latency: Duration,
}

/// Cache-aside orchestrator over one `KVStore` and one `SoTStore`.
pub struct CacheAside<K, S> {
    kv: K,
    sot: S,
    namespace_prefix: String,
    stats: CacheStats,
}

impl<K: KVStore, S: SoTStore> CacheAside<K, S> {
    pub fn new(kv: K, sot: S, namespace_prefix: impl Into<String>) -> Self {
        Self {
            kv,
            sot,
            namespace_prefix: namespace_prefix.into(),
            stats: CacheStats::new(),
        }
    }

    /// Point-in-time hit/miss counters, for operational visibility.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    fn key_for(&self, sql: &str, params: &[JsonValue]) -> String {
        let fp = fingerprint(sql, params);
        if self.namespace_prefix.is_empty() {
            cache_key(&["query", &fp])
        } else {
            cache_key(&[&self.namespace_prefix, "query", &fp])
        }
    }

    /// Execute `sql` against the cache-aside path. `params` defaults to `&[]`.
    /// `force_refresh` skips the read but still writes on success.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[JsonValue],
        ttl: Duration,
        force_refresh: bool,
    ) -> Result<ExecuteResult, CoreError> {
        let started = Instant::now();
        let key = self.key_for(sql, params);

        if !force_refresh {
            match self.kv.get(&key).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<RowSet>(&bytes) {
                    Ok(rows) => {
                        self.stats.record_hit();
                        return Ok(ExecuteResult {
                            rows,
                            source: Source::CacheHit,
                            latency: started.elapsed(),
                        });
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "cached entry has an invalid shape, treating as a miss");
                        if let Err(err) = self.kv.delete(&[&key]).await {
                            warn!(key = %key, error = %err, "failed to purge malformed cache entry");
                        }
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    warn!(key = %key, error = %err, "cache read failed, falling through to source of truth");
                }
            }
        }

        self.stats.record_miss();
        let rows = self.sot.execute(sql, params).await?;

        match serde_json::to_vec(&rows) {
            Ok(bytes) => {
                if let Err(err) = self.kv.set(&key, bytes, ttl).await {
                    warn!(key = %key, error = %err, "cache write failed after a source-of-truth hit");
                }
            }
            Err(err) => {
                warn!(key = %key, error = %err, "row set could not serialize, skipping cache write");
            }
        }

        Ok(ExecuteResult {
            rows,
            source: Source::CacheMiss,
            latency: started.elapsed(),
        })
    }

    /// Delete the cache entry for `(sql, params)`, returning whether it
    /// existed.
    pub async fn invalidate(&self, sql: &str, params: &[JsonValue]) -> bool {
        let key = self.key_for(sql, params);
        match self.kv.delete(&[&key]).await {
            Ok(count) => count > 0,
            Err(err) => {
                warn!(key = %key, error = %err, "invalidate failed");
                false
            }
        }
    }
}

// A separate `Arc<K>`/`Arc<S>` constructor would be redundant: `KVStore` and
// `SoTStore` both have blanket `Arc<T>` impls, so `CacheAside::new` already
// accepts `Arc<dyn KVStore>`/`Arc<dyn SoTStore>` directly.
pub type SharedCacheAside = CacheAside<Arc<dyn KVStore>, Arc<dyn SoTStore>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::InMemoryKvStore;
    use crate::sot::SqliteSotStore;

    fn sample_sql() -> &'static str {
        "SELECT * FROM flights WHERE origin = ?"
    }

    async fn seeded_store() -> SqliteSotStore {
        let store = SqliteSotStore::open_in_memory().unwrap();
        store
            .execute(
                "INSERT INTO airports (code, name, city, country) VALUES ('JFK', 'JFK', 'New York', 'US')",
                &[],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn first_call_is_a_miss_second_is_a_hit() {
        let kv = InMemoryKvStore::new();
        let sot = seeded_store().await;
        let cache = CacheAside::new(kv, sot, "");

        let params = [JsonValue::from("JFK")];
        let first = cache
            .execute(
                "SELECT code FROM airports WHERE code = ?",
                &params,
                Duration::from_secs(60),
                false,
            )
            .await
            .unwrap();
        assert_eq!(first.source, Source::CacheMiss);

        let second = cache
            .execute(
                "SELECT code FROM airports WHERE code = ?",
                &params,
                Duration::from_secs(60),
                false,
            )
            .await
            .unwrap();
        assert_eq!(second.source, Source::CacheHit);
        assert_eq!(second.rows, first.rows);
    }

    #[tokio::test]
    async fn force_refresh_skips_the_read_but_still_writes() {
        let kv = InMemoryKvStore::new();
        let sot = seeded_store().await;
        let cache = CacheAside::new(kv, sot, "");

        let _ = cache
            .execute(sample_sql(), &[], Duration::from_secs(60), false)
            .await
            .unwrap();
        let refreshed = cache
            .execute(sample_sql(), &[], Duration::from_secs(60), true)
            .await
            .unwrap();
        assert_eq!(refreshed.source, Source::CacheMiss);
    }

    #[tokio::test]
    async fn invalidate_reports_whether_the_key_existed() {
        let kv = InMemoryKvStore::new();
        let sot = seeded_store().await;
        let cache = CacheAside::new(kv, sot, "");

        assert!(!cache.invalidate(sample_sql(), &[]).await);
        let _ = cache
            .execute(sample_sql(), &[], Duration::from_secs(60), false)
            .await
            .unwrap();
        assert!(cache.invalidate(sample_sql(), &[]).await);
        assert!(!cache.invalidate(sample_sql(), &[]).await);
    }

    #[tokio::test]
    async fn malformed_cache_entry_is_treated_as_a_miss_and_purged() {
        let kv = InMemoryKvStore::new();
        let sot = seeded_store().await;
        let key = cache_key(&["query", &fingerprint(sample_sql(), &[])]);
        kv.set(&key, b"not json rows".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let cache = CacheAside::new(kv.clone(), sot, "");
        let result = cache
            .execute(sample_sql(), &[], Duration::from_secs(60), false)
            .await
            .unwrap();
        assert_eq!(result.source, Source::CacheMiss);
        assert!(kv.get(&key).await.unwrap().is_some(), "SoT result repopulates the key");
    }

    #[tokio::test]
    async fn namespace_prefix_is_applied_to_the_key() {
        let kv = InMemoryKvStore::new();
        let sot = seeded_store().await;
        let cache = CacheAside::new(kv.clone(), sot, "tenant-a");

        let _ = cache
            .execute(sample_sql(), &[], Duration::from_secs(60), false)
            .await
            .unwrap();
        let expected_key = cache_key(&["tenant-a", "query", &fingerprint(sample_sql(), &[])]);
        assert!(kv.get(&expected_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_track_misses_then_hits() {
        let kv = InMemoryKvStore::new();
        let sot = seeded_store().await;
        let cache = CacheAside::new(kv, sot, "");

        let _ = cache
            .execute(sample_sql(), &[], Duration::from_secs(60), false)
            .await
            .unwrap();
        let _ = cache
            .execute(sample_sql(), &[], Duration::from_secs(60), false)
            .await
            .unwrap();

        let snap = cache.stats();
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.hits, 1);
    }
}
