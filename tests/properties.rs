//! Property-based tests for the cache-aside invariants: miss-then-hit,
//! and post-invalidate miss. `proptest` can't drive an async body
//! directly, so each case builds a fresh single-threaded runtime and
//! blocks on it, mirroring the crate's own `#[tokio::test]` fixtures.

use proptest::prelude::*;
use serde_json::Value as JsonValue;
use skycache::cache_aside::{CacheAside, Source};
use skycache::kvstore::InMemoryKvStore;
use skycache::sot::SqliteSotStore;
use std::time::Duration;

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime builds")
}

fn store() -> SqliteSotStore {
    SqliteSotStore::open_in_memory().expect("in-memory sqlite opens")
}

proptest! {
    /// Invariant 1: a back-to-back pair of `execute` calls where the first
    /// is a miss always makes the second a hit, with identical rows.
    #[test]
    fn miss_then_hit_for_any_param(id in 1i64..10_000) {
        rt().block_on(async {
            let cache = CacheAside::new(InMemoryKvStore::new(), store(), "");
            let params = [JsonValue::from(id)];

            let first = cache
                .execute("SELECT ?1 AS id", &params, Duration::from_secs(60), false)
                .await
                .unwrap();
            prop_assert_eq!(first.source, Source::CacheMiss);

            let second = cache
                .execute("SELECT ?1 AS id", &params, Duration::from_secs(60), false)
                .await
                .unwrap();
            prop_assert_eq!(second.source, Source::CacheHit);
            prop_assert_eq!(second.rows, first.rows);
            Ok(())
        })?;
    }

    /// Invariant 2: after `invalidate`, the next `execute` is always a miss.
    #[test]
    fn invalidate_always_forces_the_next_miss(id in 1i64..10_000) {
        rt().block_on(async {
            let cache = CacheAside::new(InMemoryKvStore::new(), store(), "");
            let params = [JsonValue::from(id)];

            let _ = cache
                .execute("SELECT ?1 AS id", &params, Duration::from_secs(60), false)
                .await
                .unwrap();
            prop_assert!(cache.invalidate("SELECT ?1 AS id", &params).await);

            let after = cache
                .execute("SELECT ?1 AS id", &params, Duration::from_secs(60), false)
                .await
                .unwrap();
            prop_assert_eq!(after.source, Source::CacheMiss);
            Ok(())
        })?;
    }
}
