//! `VectorIndex`: the ANN-or-brute-force abstraction `SemanticCache` sits
//! on top of.
//!
//! `ensure`/`knn` delegate to [`KVStore`]'s native vector operations when
//! the backend supports them; `brute_force` always works by scanning the
//! prefix and recomputing cosine similarity in process — the same
//! never-trust-the-backend's-raw-score fallback-scan shape a
//! `CacheStore::lookup_approximate` would use.

use crate::config::AnnAlgorithm;
use crate::kvstore::{DistanceMetric, KVStore, KvError, VectorMatch};
use tracing::warn;

/// Cosine similarity: `dot(a,b) / (||a|| · ||b||)`, `0` if either norm is
/// `0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Decode a little-endian float32 stream. Returns `None` if `bytes.len()`
/// is not a multiple of 4.
pub fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Idempotently create `name` over `prefix`, swallowing `NotSupported` so
/// callers can rely purely on `brute_force` against backends without
/// native ANN search.
pub async fn ensure<K: KVStore>(kv: &K, name: &str, prefix: &str, dim: u16) -> Result<(), KvError> {
    match kv.vector_index_create(name, prefix, dim, DistanceMetric::Cosine).await {
        Ok(()) => Ok(()),
        Err(KvError::NotSupported(_)) => {
            warn!(name, "backend has no native vector search, relying on brute_force only");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// `ensure` accepts `ann_algorithm` only to document intent in call sites;
/// the `KVStore` trait's `vector_index_create` takes a metric, not an
/// algorithm hint, since that is a backend-internal construction detail.
pub fn algorithm_hint(algorithm: AnnAlgorithm) -> &'static str {
    match algorithm {
        AnnAlgorithm::Hnsw => "hnsw",
        AnnAlgorithm::Flat => "flat",
    }
}

/// Native ANN search. Callers should fall back to [`brute_force`] on
/// `Err(KvError::NotSupported(_))`.
pub async fn knn<K: KVStore>(kv: &K, name: &str, vector: &[f32], k: usize) -> Result<Vec<VectorMatch>, KvError> {
    kv.vector_knn(name, vector, k).await
}

/// Scan every key under `prefix`, decode each record's `embedding` hash
/// field as a little-endian float32 vector, and return the top `k` by
/// recomputed cosine similarity. Always available regardless of backend
/// capability. `EmbeddingRecord`s are hashes (`prompt`, `query_key`,
/// `embedding`), not plain scalar values.
pub async fn brute_force<K: KVStore>(kv: &K, prefix: &str, vector: &[f32], k: usize) -> Result<Vec<VectorMatch>, KvError> {
    let pattern = format!("{prefix}*");
    let keys = kv.scan(&pattern).await?;

    let mut scored = Vec::with_capacity(keys.len());
    for key in keys {
        let Ok(fields) = kv.hash_get_all(&key).await else {
            continue;
        };
        let Some((_, bytes)) = fields.iter().find(|(name, _)| name == "embedding") else {
            continue;
        };
        let Some(candidate) = decode_vector(bytes) else {
            continue;
        };
        if candidate.len() != vector.len() {
            continue;
        }
        scored.push(VectorMatch {
            key,
            score: cosine_similarity(vector, &candidate),
        });
    }

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    Ok(scored)
}
