//! `EmbeddingProvider`: turns a prompt into a fixed-dimension vector for
//! `SemanticCache`.
//!
//! Modeled on an OpenAI-compatible `/v1/embeddings` HTTP call, wrapped
//! behind a trait so the index dimension and generation can be swapped or
//! mocked in tests — the dependency is constructed lazily, on first use,
//! rather than eagerly at startup.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("response had dimension {actual}, expected {expected}")]
    DimensionMismatch { actual: usize, expected: usize },
}

/// Produces an embedding vector for a prompt. Implementations are expected
/// to be cheap to clone (an `Arc`-wrapped HTTP client, or similar).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Dimensionality this provider always returns. `SemanticCache` uses
    /// this to validate `semantic.embedding_dim` before first use.
    fn dimension(&self) -> u16;
}

/// Calls an OpenAI-compatible `/v1/embeddings` endpoint.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    dim: u16,
}

impl HttpEmbeddingProvider {
    pub fn new(url: impl Into<String>, model: impl Into<String>, api_key: Option<String>, dim: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            model: model.into(),
            api_key,
            dim,
        }
    }
}

#[derive(serde::Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingDataItem>,
}

#[derive(serde::Deserialize)]
struct EmbeddingDataItem {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EmbeddingError::Request(format!("HTTP request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::Request(format!("embedding API returned {status}: {body}")));
        }

        let resp_body: EmbeddingApiResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Request(format!("failed to parse response: {e}")))?;

        let vector = resp_body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::Request("empty embedding response".into()))?;

        if vector.len() != self.dim as usize {
            return Err(EmbeddingError::DimensionMismatch {
                actual: vector.len(),
                expected: self.dim as usize,
            });
        }
        Ok(vector)
    }

    fn dimension(&self) -> u16 {
        self.dim
    }
}

/// Deterministic embedding for tests: hashes the prompt into a seed and
/// fills the vector from it, then L2-normalizes. Two equal prompts embed
/// identically; distinct prompts embed to (very likely) distinct vectors.
pub struct MockEmbeddingProvider {
    dim: u16,
}

impl MockEmbeddingProvider {
    pub fn new(dim: u16) -> Self {
        Self { dim }
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(text.as_bytes());
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[0..8]);
        let mut state = u64::from_le_bytes(seed);

        let mut vector = Vec::with_capacity(self.dim as usize);
        for _ in 0..self.dim {
            // xorshift64, adequate for deterministic test fixtures only.
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let unit = (state % 2000) as f32 / 1000.0 - 1.0;
            vector.push(unit);
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> u16 {
        self.dim
    }
}
