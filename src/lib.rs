// Enforce mutual exclusivity of cache features at compile time.
#[cfg(all(feature = "cache-persistent", feature = "cache-ephemeral"))]
compile_error!(
    "Features `cache-persistent` and `cache-ephemeral` are mutually exclusive. \
     Please enable only one."
);

pub mod cache_aside;
pub mod cancel;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod kvstore;
pub mod mmr;
pub mod row;
pub mod semantic_cache;
pub mod sot;
pub mod stampede;
pub mod stats;
pub mod vector_index;
pub mod write_behind;
pub mod write_through;

pub use cache_aside::CacheAside;
pub use config::Config;
pub use error::CoreError;
pub use kvstore::KVStore;
pub use semantic_cache::SemanticCache;
pub use sot::SoTStore;
pub use stampede::StampedeGuard;
pub use stats::{CacheStats, SemanticCacheStats};
pub use write_behind::WriteBehind;
pub use write_through::WriteThrough;
