//! Crate-wide configuration.
//!
//! Follows a `Config::load`/`save` pattern (TOML via
//! `toml::from_str`/`toml::to_string_pretty`, per-field
//! `#[serde(default = "fn")]` functions, one `impl Default` per sub-struct).
//! An `EnvOverrides`/`SettingEntry`/`apply_env_overrides` layer is
//! deliberately not included: that machinery exists to drive a settings UI,
//! and there is no such UI here. Env-var coupling, if ever
//! wanted, belongs to a hosting binary built on top of this crate, not the
//! core itself.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for every component in this crate. Each
/// sub-struct can be constructed and passed independently (e.g. a caller
/// that only uses `CacheAside` need not build a `SemanticConfig`), but
/// loading from a single file is the common path.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub stampede: StampedeConfig,
    #[serde(default)]
    pub write_behind: WriteBehindConfig,
    #[serde(default)]
    pub semantic: SemanticConfig,
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            tracing::warn!("config file not found at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Serialize the configuration to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("failed to serialize config: {e}"))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// `CacheAside` and `WriteThrough` population behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Default TTL applied to cache-aside and write-through populations.
    #[serde(default = "default_ttl_default", with = "duration_secs")]
    pub ttl_default: Duration,
    /// Prepended to every key, for multi-tenant isolation. Empty disables
    /// namespacing.
    #[serde(default)]
    pub namespace_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_default: default_ttl_default(),
            namespace_prefix: String::new(),
        }
    }
}

/// Single-flight lock lifetime and retry/backoff policy for `StampedeGuard`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StampedeConfig {
    #[serde(default = "default_lock_ttl", with = "duration_secs")]
    pub lock_ttl: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(default = "default_cap_delay", with = "duration_millis")]
    pub cap_delay: Duration,
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            lock_ttl: default_lock_ttl(),
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            cap_delay: default_cap_delay(),
            on_timeout: TimeoutPolicy::default(),
        }
    }
}

/// What a waiter does when it exhausts its backoff budget without the
/// lock-holder ever publishing a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutPolicy {
    /// Fall through to the source of truth directly.
    #[default]
    FailOpen,
    /// Return an error instead of hitting the source of truth.
    FailClosed,
}

/// Batch drain policy for the `WriteBehind` queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriteBehindConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Similarity gatekeeper and ANN index parameters for `SemanticCache`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SemanticConfig {
    /// Minimum cosine similarity, recomputed from raw vectors, required to
    /// treat an ANN candidate as a hit.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// How many reranked matches to keep after the gatekeeper.
    #[serde(default = "default_k_final")]
    pub k_final: usize,
    #[serde(default)]
    pub use_mmr: bool,
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,
    /// Must match the embedding provider's output dimensionality.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: u16,
    #[serde(default)]
    pub ann_algorithm: AnnAlgorithm,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            k_final: default_k_final(),
            use_mmr: false,
            mmr_lambda: default_mmr_lambda(),
            embedding_dim: default_embedding_dim(),
            ann_algorithm: AnnAlgorithm::default(),
        }
    }
}

/// Index construction hint passed to `KVStore::vector_index_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnnAlgorithm {
    #[default]
    Hnsw,
    Flat,
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_ttl_default() -> Duration {
    Duration::from_secs(3600)
}
const fn default_lock_ttl() -> Duration {
    Duration::from_secs(10)
}
const fn default_max_attempts() -> u32 {
    5
}
const fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}
const fn default_cap_delay() -> Duration {
    Duration::from_secs(2)
}
const fn default_batch_size() -> usize {
    100
}
const fn default_similarity_threshold() -> f32 {
    0.70
}
const fn default_k_final() -> usize {
    1
}
const fn default_mmr_lambda() -> f32 {
    0.5
}
const fn default_embedding_dim() -> u16 {
    384
}

/// `Duration` serializes as whole seconds in TOML, matching how
/// `ttl_default`/`lock_ttl`/`cap_delay` are expressed as plain seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// `Duration` serializes as whole milliseconds, for the sub-second backoff
/// fields (`base_delay`).
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
