//! Crate-wide error surface.
//!
//! Each component has its own narrow error enum (`KvError`, `SotError`,
//! `WriteBehindError`, `StampedeError`); [`CoreError`] is the type
//! user-visible operations (`CacheAside::execute`, `WriteThrough::update_entity`,
//! `WriteBehind::update_entity`, `SemanticCache::get_or_generate_sql`)
//! actually return, bridging the component errors the same way an
//! `AppError` enum typically bridges
//! `rusqlite::Error`/`reqwest::Error`/`ProviderError` into one type.

use crate::kvstore::KvError;
use crate::sot::SotError;
use crate::write_behind::WriteBehindError;

/// Top-level error type for operations that can fail user-visibly.
///
/// Cache-side failures (serialization, capability-missing, lock
/// contention) are deliberately *not* representable here for the read
/// paths that degrade gracefully by design — those are logged and
/// swallowed at the point of occurrence instead.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("source-of-truth error: {0}")]
    Sot(#[from] SotError),

    #[error("key/value store error: {0}")]
    Kv(#[from] KvError),

    #[error("write-behind error: {0}")]
    WriteBehind(#[from] WriteBehindError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("LLM generator error: {0}")]
    Llm(String),

    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("contract violation: {0}")]
    Contract(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<crate::semantic_cache::LlmError> for CoreError {
    fn from(err: crate::semantic_cache::LlmError) -> Self {
        Self::Llm(err.to_string())
    }
}

impl From<crate::embedding::EmbeddingError> for CoreError {
    fn from(err: crate::embedding::EmbeddingError) -> Self {
        Self::Embedding(err.to_string())
    }
}

impl From<crate::stampede::StampedeError> for CoreError {
    fn from(err: crate::stampede::StampedeError) -> Self {
        match err {
            crate::stampede::StampedeError::Timeout => Self::Contract("stampede guard timed out".into()),
            crate::stampede::StampedeError::Producer(msg) => Self::Contract(msg),
        }
    }
}
