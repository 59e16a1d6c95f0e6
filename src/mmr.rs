//! Maximal Marginal Relevance reranking, an optional diversification pass
//! over `SemanticCache`'s candidate pool.
//!
//! The standard MMR formulation: greedy selection trading off query
//! relevance against redundancy with already-chosen candidates, scored by
//! cosine similarity throughout to stay consistent with
//! [`crate::vector_index::cosine_similarity`].

use crate::vector_index::cosine_similarity;

/// One candidate in the MMR pool: its key, its embedding, and its
/// already-recomputed relevance score against the query vector.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: String,
    pub embedding: Vec<f32>,
    pub relevance: f32,
}

/// Greedily select `k_final` candidates from `pool`, trading off
/// `relevance` (similarity to the query) against `lambda` against
/// redundancy (max similarity to an already-selected candidate).
///
/// `lambda = 1.0` reduces to pure relevance ranking; `lambda = 0.0`
/// maximizes diversity regardless of relevance. The default is 0.5.
pub fn rerank(pool: &[Candidate], lambda: f32, k_final: usize) -> Vec<Candidate> {
    if pool.is_empty() || k_final == 0 {
        return Vec::new();
    }

    let mut remaining: Vec<&Candidate> = pool.iter().collect();
    let mut selected: Vec<Candidate> = Vec::with_capacity(k_final.min(pool.len()));

    while !remaining.is_empty() && selected.len() < k_final {
        let (best_idx, _) = remaining
            .iter()
            .enumerate()
            .map(|(i, candidate)| {
                let redundancy = selected
                    .iter()
                    .map(|chosen| cosine_similarity(&candidate.embedding, &chosen.embedding))
                    .fold(f32::MIN, f32::max);
                let redundancy = if redundancy == f32::MIN { 0.0 } else { redundancy };
                let mmr_score = lambda * candidate.relevance - (1.0 - lambda) * redundancy;
                (i, mmr_score)
            })
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .expect("remaining is non-empty");

        selected.push(remaining.remove(best_idx).clone());
    }

    selected
}
