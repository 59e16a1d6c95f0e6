//! Cache-stampede prevention: single-flight production behind a
//! compare-and-delete lock, with jittered exponential backoff for waiters.
//!
//! Follows a reservation-dance shape (acquire a short-lived marker, do the
//! guarded work, release by comparing the marker back) generalized from a
//! single fixed operation to an arbitrary producer closure.

use crate::cancel::CancelToken;
use crate::config::{StampedeConfig, TimeoutPolicy};
use crate::kvstore::{cache_key, KVStore};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Runs `producer` behind a single-flight lock keyed on `subject_key`. At
/// most one caller across the process (and, with a shared `KVStore`, across
/// processes) invokes `producer` at a time; the rest either observe the
/// value it populates or, on an expired wait, proceed per `on_timeout`.
///
/// `lookup` re-checks the cache under the double-check and the waiter path;
/// it is supplied separately from `producer` because the value a producer
/// computes is not always exactly what gets cached (see `SemanticCache`,
/// which writes three related keys from one generation call).
pub async fn single_flight<K, T, Lookup, LookupFut, Produce, ProduceFut>(
    kv: &K,
    subject_key: &str,
    cancel: &CancelToken,
    config: &StampedeConfig,
    lookup: Lookup,
    producer: Produce,
) -> Result<T, StampedeError>
where
    K: KVStore,
    Lookup: Fn() -> LookupFut,
    LookupFut: Future<Output = Option<T>>,
    Produce: FnOnce() -> ProduceFut,
    ProduceFut: Future<Output = Result<T, StampedeError>>,
{
    let lock_key = cache_key(&["lock", subject_key]);
    let nonce = Uuid::new_v4().to_string().into_bytes();

    let acquired = kv
        .set_if_absent(&lock_key, nonce.clone(), config.lock_ttl)
        .await
        .unwrap_or_else(|err| {
            warn!(key = %lock_key, error = %err, "lock service unavailable, degrading to direct production");
            true
        });

    if acquired {
        if let Some(value) = lookup().await {
            debug!(key = %subject_key, "value appeared between lock acquisition and double-check");
            release(kv, &lock_key, &nonce).await;
            return Ok(value);
        }

        let result = producer().await;
        release(kv, &lock_key, &nonce).await;
        return result;
    }

    for attempt in 0..config.max_attempts.saturating_sub(1) {
        let backoff = backoff_delay(config, attempt);
        if cancel.sleep(backoff).await {
            debug!(key = %subject_key, "single_flight wait cancelled");
            break;
        }
        if let Some(value) = lookup().await {
            return Ok(value);
        }
    }

    match config.on_timeout {
        TimeoutPolicy::FailOpen => {
            debug!(key = %subject_key, "backoff exhausted, falling open to direct production");
            producer().await
        }
        TimeoutPolicy::FailClosed => Err(StampedeError::Timeout),
    }
}

/// `min(cap_delay, base_delay * 2^attempt) + uniform(0, base_delay)`.
fn backoff_delay(config: &StampedeConfig, attempt: u32) -> Duration {
    let exponential = config.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = exponential.min(config.cap_delay);
    let jitter_millis = rand::rng().random_range(0..=config.base_delay.as_millis().max(1) as u64);
    capped + Duration::from_millis(jitter_millis)
}

async fn release<K: KVStore>(kv: &K, lock_key: &str, nonce: &[u8]) {
    match kv.delete_if_equals(lock_key, nonce).await {
        Ok(true) => {}
        Ok(false) => debug!(key = %lock_key, "lock already released or stolen by a stale TTL expiry"),
        Err(err) => warn!(key = %lock_key, error = %err, "failed to release lock"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StampedeError {
    #[error("timed out waiting for the lock holder to populate the value")]
    Timeout,
    #[error("producer failed: {0}")]
    Producer(String),
}

/// A thin struct wrapper for call sites that want a reusable guard object
/// bound to one `KVStore` and one backoff policy, rather than threading
/// `&K`/`&StampedeConfig` through every call.
pub struct StampedeGuard<K> {
    kv: K,
    config: StampedeConfig,
}

impl<K: KVStore> StampedeGuard<K> {
    pub fn new(kv: K, config: StampedeConfig) -> Self {
        Self { kv, config }
    }

    pub async fn single_flight<T, Lookup, LookupFut, Produce, ProduceFut>(
        &self,
        subject_key: &str,
        cancel: &CancelToken,
        lookup: Lookup,
        producer: Produce,
    ) -> Result<T, StampedeError>
    where
        Lookup: Fn() -> LookupFut,
        LookupFut: Future<Output = Option<T>>,
        Produce: FnOnce() -> ProduceFut,
        ProduceFut: Future<Output = Result<T, StampedeError>>,
    {
        single_flight(&self.kv, subject_key, cancel, &self.config, lookup, producer).await
    }
}
