//! Semantic caching: exact-prompt O(1) reuse backed by an approximate
//! vector search with a mandatory, recomputed cosine-similarity gatekeeper.
//!
//! Follows a `cache/store.rs`/`cache/embedder.rs`-style pairing (embed,
//! ANN lookup, recompute the authoritative score, never trust the
//! backend's raw distance), extended with an exact-prompt pointer layer
//! and optional MMR reranking on top of that shape.

use crate::config::SemanticConfig;
use crate::error::CoreError;
use crate::kvstore::{cache_key, KVStore};
use crate::mmr::{self, Candidate};
use crate::stats::{SemanticCacheStats, SemanticCacheStatsSnapshot};
use crate::vector_index::{self, cosine_similarity, decode_vector, encode_vector};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::warn;

const INDEX_NAME: &str = "prompt_embeddings";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("generation failed: {0}")]
    Generation(String),
}

/// Raw SQL-generation output from an `LLMGenerator`.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub sql: String,
    pub generation_time: Duration,
    pub prompt_tokens: u32,
    pub output_tokens: u32,
}

/// Generates SQL for a natural-language prompt. The only collaborator
/// whose failure is surfaced to the caller: embedding and ANN failures
/// degrade gracefully instead.
#[async_trait]
pub trait LLMGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<GenerationOutput, LlmError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("{0}")]
    Provider(String),
}

/// Embeds a prompt into a fixed-dimension vector. Mirrors
/// [`crate::embedding::EmbeddingProvider`] with the narrower surface this
/// module needs, so callers can plug either that trait's implementations
/// or a bespoke one in.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[async_trait]
impl<T: crate::embedding::EmbeddingProvider> EmbeddingProvider for T {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        crate::embedding::EmbeddingProvider::embed(self, text)
            .await
            .map_err(|e| EmbeddingError::Provider(e.to_string()))
    }
}

/// `query:<r>` payload: the generated SQL plus generation metadata.
///
/// `created_at`/`last_hit_at`/`hit_count` are crate-private bookkeeping,
/// not part of the public result shape; they back the eviction helpers
/// below (`evict_expired`, `evict_lru`), the same way a `CacheEntry`'s
/// `created_at`/`last_hit`/`hit_count` fields would.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueryResult {
    sql: String,
    generation_time_secs: f64,
    prompt_tokens: u32,
    output_tokens: u32,
    total_tokens: u32,
    created_at: String,
    last_hit_at: Option<String>,
    hit_count: u64,
}

/// Where the result in [`SemanticResult`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Exact,
    Semantic,
    None,
}

/// Outcome of [`SemanticCache::get_or_generate_sql`].
#[derive(Debug, Clone)]
pub struct SemanticResult {
    pub sql: String,
    pub generation_time: Duration,
    pub total_tokens: u32,
    pub cache_hit: bool,
    pub cache_kind: CacheKind,
    pub similarity: Option<f32>,
    pub similar_prompt: Option<String>,
    pub lookup_time: Duration,
}

pub struct SemanticCache<K, E, L> {
    kv: K,
    embedder: E,
    generator: L,
    config: SemanticConfig,
    namespace_prefix: String,
    index_ready: OnceCell<()>,
    stats: SemanticCacheStats,
}

impl<K: KVStore, E: EmbeddingProvider, L: LLMGenerator> SemanticCache<K, E, L> {
    pub fn new(kv: K, embedder: E, generator: L, config: SemanticConfig, namespace_prefix: impl Into<String>) -> Self {
        Self {
            kv,
            embedder,
            generator,
            config,
            namespace_prefix: namespace_prefix.into(),
            index_ready: OnceCell::new(),
            stats: SemanticCacheStats::new(),
        }
    }

    /// Point-in-time exact/semantic/miss counters, for operational
    /// visibility.
    pub fn stats(&self) -> SemanticCacheStatsSnapshot {
        self.stats.snapshot()
    }

    fn key(&self, parts: &[&str]) -> String {
        if self.namespace_prefix.is_empty() {
            cache_key(parts)
        } else {
            let mut namespaced = vec![self.namespace_prefix.as_str()];
            namespaced.extend_from_slice(parts);
            cache_key(&namespaced)
        }
    }

    /// `embedding:prompt:` scan prefix, namespaced like every other key this
    /// component writes — `EMBEDDING_PREFIX` used to be a bare constant that
    /// skipped `namespace_prefix`, silently mismatching the keys `hash_set`
    /// actually wrote under a non-empty tenant prefix.
    fn embedding_prefix(&self) -> String {
        self.key(&["embedding", "prompt", ""])
    }

    /// `query:` scan prefix, used by the eviction helpers.
    fn query_prefix(&self) -> String {
        self.key(&["query", ""])
    }

    /// The vector index name is namespaced too, so two tenants sharing one
    /// `KVStore` don't search each other's embeddings.
    fn index_name(&self) -> String {
        if self.namespace_prefix.is_empty() {
            INDEX_NAME.to_string()
        } else {
            format!("{}:{INDEX_NAME}", self.namespace_prefix)
        }
    }

    async fn ensure_index(&self) {
        let prefix = self.embedding_prefix();
        let name = self.index_name();
        let _ = self
            .index_ready
            .get_or_init(|| async move {
                if let Err(err) = vector_index::ensure(&self.kv, &name, &prefix, self.config.embedding_dim).await {
                    warn!(error = %err, "failed to ensure the semantic vector index, relying on brute_force");
                }
            })
            .await;
    }

    /// Embedding/ANN/cache failures degrade gracefully; only an
    /// `LLMGenerator` failure surfaces to the caller.
    pub async fn get_or_generate_sql(&self, prompt: &str, verbose: bool) -> Result<SemanticResult, CoreError> {
        let started = Instant::now();
        let h = sha256_hex(prompt.as_bytes());
        let mapping_key = self.key(&["semantic", "prompt", &h]);

        // Exact lookup.
        if let Ok(Some(pointer)) = self.kv.get(&mapping_key).await {
            if let Ok(query_key) = String::from_utf8(pointer) {
                if let Some(result) = self.load_query_result(&query_key).await {
                    if verbose {
                        warn!(prompt_hash = %h, query_key = %query_key, "exact semantic cache hit");
                    }
                    self.stats.record_exact_hit();
                    self.record_hit(&query_key, result.clone()).await;
                    return Ok(SemanticResult {
                        sql: result.sql,
                        generation_time: Duration::from_secs_f64(result.generation_time_secs),
                        total_tokens: result.total_tokens,
                        cache_hit: true,
                        cache_kind: CacheKind::Exact,
                        similarity: None,
                        similar_prompt: None,
                        lookup_time: started.elapsed(),
                    });
                }
            }
        }

        let embedding = self.embedder.embed(prompt).await.ok();

        if let Some(v) = embedding.as_deref() {
            if let Some(hit) = self.semantic_lookup(&h, prompt, v, started).await {
                return Ok(hit);
            }
        }

        // Nothing matched above the threshold (or embedding failed):
        // generate.
        self.stats.record_miss();
        let generation = self.generator.generate(prompt).await?;
        let r = sha256_hex(generation.sql.as_bytes());
        let query_key = self.key(&["query", &r]);
        let total_tokens = generation.prompt_tokens + generation.output_tokens;

        let payload = QueryResult {
            sql: generation.sql.clone(),
            generation_time_secs: generation.generation_time.as_secs_f64(),
            prompt_tokens: generation.prompt_tokens,
            output_tokens: generation.output_tokens,
            total_tokens,
            created_at: Utc::now().to_rfc3339(),
            last_hit_at: None,
            hit_count: 0,
        };

        if let Ok(bytes) = serde_json::to_vec(&payload) {
            if let Err(err) = self.kv.set(&query_key, bytes, Duration::ZERO).await {
                warn!(key = %query_key, error = %err, "failed to cache generated query result");
            }
        }
        if let Err(err) = self.kv.set(&mapping_key, query_key.clone().into_bytes(), Duration::ZERO).await {
            warn!(key = %mapping_key, error = %err, "failed to write exact-prompt pointer");
        }
        if let Some(v) = embedding {
            let embedding_key = self.key(&["embedding", "prompt", &h]);
            let fields: Vec<(&str, Vec<u8>)> = vec![
                ("prompt", prompt.as_bytes().to_vec()),
                ("query_key", query_key.clone().into_bytes()),
                ("embedding", encode_vector(&v)),
            ];
            if let Err(err) = self.kv.hash_set(&embedding_key, &fields).await {
                warn!(key = %embedding_key, error = %err, "failed to write embedding record");
            }
        }

        Ok(SemanticResult {
            sql: payload.sql,
            generation_time: Duration::from_secs_f64(payload.generation_time_secs),
            total_tokens,
            cache_hit: false,
            cache_kind: CacheKind::None,
            similarity: None,
            similar_prompt: None,
            lookup_time: started.elapsed(),
        })
    }

    async fn load_query_result(&self, query_key: &str) -> Option<QueryResult> {
        let bytes = self.kv.get(query_key).await.ok().flatten()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Best-effort `hit_count`/`last_hit_at` bump on a cache hit. Never
    /// fails the caller: a lost increment just under-counts an entry's
    /// popularity for [`Self::evict_lru`], it doesn't corrupt anything.
    async fn record_hit(&self, query_key: &str, mut result: QueryResult) {
        result.hit_count += 1;
        result.last_hit_at = Some(Utc::now().to_rfc3339());
        match serde_json::to_vec(&result) {
            Ok(bytes) => {
                if let Err(err) = self.kv.set(query_key, bytes, Duration::ZERO).await {
                    warn!(key = %query_key, error = %err, "failed to record cache hit metadata");
                }
            }
            Err(err) => {
                warn!(key = %query_key, error = %err, "query result could not re-serialize for hit tracking");
            }
        }
    }

    /// Evict entries untouched for longer than `ttl`, measured from
    /// `last_hit_at` when present and `created_at` otherwise. Returns the
    /// number of entries removed.
    ///
    pub async fn evict_expired(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let mut removed = 0usize;
        let pattern = format!("{}*", self.query_prefix());
        let Ok(keys) = self.kv.scan(&pattern).await else {
            return 0;
        };
        for key in keys {
            let Some(result) = self.load_query_result(&key).await else {
                continue;
            };
            let reference = result
                .last_hit_at
                .as_deref()
                .or(Some(result.created_at.as_str()))
                .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok());
            let Some(reference) = reference else {
                continue;
            };
            if reference < cutoff {
                if let Err(err) = self.kv.delete(&[&key]).await {
                    warn!(key = %key, error = %err, "failed to evict expired semantic cache entry");
                } else {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Trim the `query:*` population down to `max_entries`, evicting
    /// never-hit entries first (oldest `created_at` first), then hit
    /// entries ordered by oldest `last_hit_at`. Returns the number removed.
    pub async fn evict_lru(&self, max_entries: usize) -> usize {
        let pattern = format!("{}*", self.query_prefix());
        let Ok(keys) = self.kv.scan(&pattern).await else {
            return 0;
        };
        if keys.len() <= max_entries {
            return 0;
        }

        let mut entries: Vec<(String, QueryResult)> = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(result) = self.load_query_result(&key).await {
                entries.push((key, result));
            }
        }

        entries.sort_by(|(_, a), (_, b)| {
            let a_key = (a.last_hit_at.is_some(), a.last_hit_at.as_deref().unwrap_or(&a.created_at));
            let b_key = (b.last_hit_at.is_some(), b.last_hit_at.as_deref().unwrap_or(&b.created_at));
            a_key.cmp(&b_key)
        });

        let overflow = entries.len().saturating_sub(max_entries);
        let mut removed = 0usize;
        for (key, _) in entries.into_iter().take(overflow) {
            if let Err(err) = self.kv.delete(&[&key]).await {
                warn!(key = %key, error = %err, "failed to evict semantic cache entry under pressure");
            } else {
                removed += 1;
            }
        }
        removed
    }

    async fn semantic_lookup(&self, h: &str, _prompt: &str, v: &[f32], started: Instant) -> Option<SemanticResult> {
        self.ensure_index().await;

        let k_initial = if self.config.use_mmr {
            self.config.k_final * 3
        } else {
            self.config.k_final
        };

        let prefix = self.embedding_prefix();
        let matches = if self.kv.supports_vectors() {
            match vector_index::knn(&self.kv, &self.index_name(), v, k_initial).await {
                Ok(hits) => hits,
                Err(_) => vector_index::brute_force(&self.kv, &prefix, v, k_initial)
                    .await
                    .unwrap_or_default(),
            }
        } else {
            vector_index::brute_force(&self.kv, &prefix, v, k_initial)
                .await
                .unwrap_or_default()
        };

        struct ScoredCandidate {
            similarity: f32,
            prompt: String,
            query_key: String,
            embedding: Vec<f32>,
        }

        let mut candidates: Vec<ScoredCandidate> = Vec::with_capacity(matches.len());
        for hit in matches {
            let Ok(fields) = self.kv.hash_get_all(&hit.key).await else {
                continue;
            };
            let mut prompt_text = None;
            let mut query_key = None;
            let mut embedding_bytes = None;
            for (name, value) in fields {
                match name.as_str() {
                    "prompt" => prompt_text = String::from_utf8(value).ok(),
                    "query_key" => query_key = String::from_utf8(value).ok(),
                    "embedding" => embedding_bytes = Some(value),
                    _ => {}
                }
            }
            let (Some(prompt_text), Some(query_key), Some(embedding_bytes)) = (prompt_text, query_key, embedding_bytes) else {
                continue;
            };
            let Some(candidate_vector) = decode_vector(&embedding_bytes) else {
                continue;
            };
            // Recomputed score is authoritative; the ANN backend's raw
            // score never participates in the threshold comparison.
            let similarity = cosine_similarity(v, &candidate_vector);
            if similarity < self.config.similarity_threshold {
                continue;
            }
            candidates.push(ScoredCandidate {
                similarity,
                prompt: prompt_text,
                query_key,
                embedding: candidate_vector,
            });
        }

        if candidates.is_empty() {
            return None;
        }

        let best_index = if self.config.use_mmr {
            let pool: Vec<Candidate> = candidates
                .iter()
                .enumerate()
                .map(|(i, c)| Candidate {
                    key: i.to_string(),
                    embedding: c.embedding.clone(),
                    relevance: c.similarity,
                })
                .collect();
            let reranked = mmr::rerank(&pool, self.config.mmr_lambda, self.config.k_final);
            reranked.first()?.key.parse::<usize>().ok()?
        } else {
            candidates
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.similarity.partial_cmp(&b.similarity).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i)?
        };

        let best = candidates.into_iter().nth(best_index)?;
        let similarity = best.similarity;
        let similar_prompt = best.prompt;
        let query_key = best.query_key;
        let result = self.load_query_result(&query_key).await?;

        let mapping_key = self.key(&["semantic", "prompt", h]);
        if let Err(err) = self.kv.set(&mapping_key, query_key.clone().into_bytes(), Duration::ZERO).await {
            warn!(error = %err, "failed to write the new exact-prompt pointer after a semantic hit");
        }

        self.stats.record_semantic_hit();
        self.record_hit(&query_key, result.clone()).await;

        Some(SemanticResult {
            sql: result.sql,
            generation_time: Duration::from_secs_f64(result.generation_time_secs),
            total_tokens: result.total_tokens,
            cache_hit: true,
            cache_kind: CacheKind::Semantic,
            similarity: Some(similarity),
            similar_prompt: Some(similar_prompt),
            lookup_time: started.elapsed(),
        })
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbeddingProvider;
    use crate::kvstore::InMemoryKvStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingGenerator {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl LLMGenerator for CountingGenerator {
        async fn generate(&self, prompt: &str) -> Result<GenerationOutput, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GenerationOutput {
                sql: format!("SELECT * FROM flights WHERE note = '{prompt}'"),
                generation_time: Duration::from_millis(5),
                prompt_tokens: 10,
                output_tokens: 5,
            })
        }
    }

    fn config() -> SemanticConfig {
        SemanticConfig {
            similarity_threshold: 0.70,
            k_final: 1,
            use_mmr: false,
            mmr_lambda: 0.5,
            embedding_dim: 16,
            ann_algorithm: crate::config::AnnAlgorithm::Hnsw,
        }
    }

    #[tokio::test]
    async fn identical_prompt_takes_the_exact_path_second_time() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = SemanticCache::new(
            InMemoryKvStore::new(),
            MockEmbeddingProvider::new(16),
            CountingGenerator { calls: calls.clone() },
            config(),
            "",
        );

        let first = cache.get_or_generate_sql("flights to denver", false).await.unwrap();
        assert_eq!(first.cache_kind, CacheKind::None);
        assert!(!first.cache_hit);

        let second = cache.get_or_generate_sql("flights to denver", false).await.unwrap();
        assert_eq!(second.cache_kind, CacheKind::Exact);
        assert!(second.cache_hit);
        assert_eq!(second.sql, first.sql);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_prompt_generates_again() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = SemanticCache::new(
            InMemoryKvStore::new(),
            MockEmbeddingProvider::new(16),
            CountingGenerator { calls: calls.clone() },
            config(),
            "",
        );

        let _ = cache.get_or_generate_sql("flights to denver", false).await.unwrap();
        let second = cache.get_or_generate_sql("hotel rooms in miami", false).await.unwrap();
        assert_eq!(second.cache_kind, CacheKind::None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn below_threshold_similarity_falls_through_to_generate() {
        let mut cfg = config();
        cfg.similarity_threshold = 1.01; // unreachable, forces a miss every time
        let calls = Arc::new(AtomicU32::new(0));
        let cache = SemanticCache::new(
            InMemoryKvStore::new(),
            MockEmbeddingProvider::new(16),
            CountingGenerator { calls: calls.clone() },
            cfg,
            "",
        );

        let _ = cache.get_or_generate_sql("flights to denver", false).await.unwrap();
        let second = cache.get_or_generate_sql("flights near denver", false).await.unwrap();
        assert_eq!(second.cache_kind, CacheKind::None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stats_distinguish_exact_hits_from_misses() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = SemanticCache::new(
            InMemoryKvStore::new(),
            MockEmbeddingProvider::new(16),
            CountingGenerator { calls: calls.clone() },
            config(),
            "",
        );

        let _ = cache.get_or_generate_sql("flights to denver", false).await.unwrap();
        let _ = cache.get_or_generate_sql("flights to denver", false).await.unwrap();

        let snap = cache.stats();
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.hits_exact, 1);
        assert_eq!(snap.hits_semantic, 0);
    }

    #[tokio::test]
    async fn evict_expired_removes_only_the_stale_entry() {
        let cache = SemanticCache::new(
            InMemoryKvStore::new(),
            MockEmbeddingProvider::new(16),
            CountingGenerator { calls: Arc::new(AtomicU32::new(0)) },
            config(),
            "",
        );

        let fresh = cache.get_or_generate_sql("flights to denver", false).await.unwrap();
        assert_eq!(fresh.cache_kind, CacheKind::None);

        // Hand-seed a second entry whose `created_at` is already outside any
        // sane TTL window, bypassing `get_or_generate_sql` so its timestamp
        // isn't tied to wall-clock test execution time.
        let stale_key = cache.key(&["query", "stale"]);
        let stale = QueryResult {
            sql: "SELECT 1".to_string(),
            generation_time_secs: 0.0,
            prompt_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            created_at: "2000-01-01T00:00:00Z".to_string(),
            last_hit_at: None,
            hit_count: 0,
        };
        cache
            .kv
            .set(&stale_key, serde_json::to_vec(&stale).unwrap(), Duration::ZERO)
            .await
            .unwrap();

        let removed = cache.evict_expired(Duration::from_secs(3600)).await;
        assert_eq!(removed, 1);
        assert!(cache.kv.get(&stale_key).await.unwrap().is_none());

        let replay = cache.get_or_generate_sql("flights to denver", false).await.unwrap();
        assert_eq!(replay.cache_kind, CacheKind::Exact, "the fresh entry survives the eviction pass");
    }

    #[tokio::test]
    async fn evict_lru_trims_down_to_the_cap_evicting_never_hit_entries_first() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = SemanticCache::new(
            InMemoryKvStore::new(),
            MockEmbeddingProvider::new(16),
            CountingGenerator { calls: calls.clone() },
            config(),
            "",
        );

        let a = cache.get_or_generate_sql("flights to denver", false).await.unwrap();
        let b = cache.get_or_generate_sql("hotel rooms in miami", false).await.unwrap();
        // Re-request `a` so it picks up a `last_hit_at`, making `b` the
        // least-recently-touched (never-hit) entry.
        let _ = cache.get_or_generate_sql("flights to denver", false).await.unwrap();

        let removed = cache.evict_lru(1).await;
        assert_eq!(removed, 1);

        let a_replay = cache.get_or_generate_sql("flights to denver", false).await.unwrap();
        assert_eq!(a_replay.sql, a.sql, "the hit entry survives eviction");
        assert_eq!(calls.load(Ordering::SeqCst), 2, "only `b` was regenerated");

        let b_replay = cache.get_or_generate_sql("hotel rooms in miami", false).await.unwrap();
        assert_eq!(b_replay.cache_kind, CacheKind::None, "`b` was evicted and had to regenerate");
        assert_eq!(b_replay.sql, b.sql);
    }
}
