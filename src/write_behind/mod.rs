//! Asynchronous write-behind: the caller's cache write and queue push are
//! synchronous, the SoT mutation happens later in a background worker.
//!
//! Follows a `spawn_audit_logger`/batch-flush shape (buffer mutations,
//! flush a batch on a worker loop, honor a cancellation signal), extended
//! here with a reliable-queue "atomic move to an in-flight list" scheme: a
//! worker crash between `list_pop_left` and SoT commit must not silently
//! drop the record.

use crate::cancel::CancelToken;
use crate::error::CoreError;
use crate::kvstore::{cache_key, KVStore};
use crate::row::RowSet;
use crate::sot::{SotError, SoTStore};
use crate::write_through::EntityMapper;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

const QUEUE_MAIN: &str = "queue:mutations";
const QUEUE_INFLIGHT: &str = "queue:mutations:inflight";
const QUEUE_DLQ: &str = "queue:mutations:dlq";

/// Base/cap for the retry backoff stamped onto `not_before`, the same
/// `min(cap, base * 2^attempt) + jitter` shape as `stampede::backoff_delay`.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_CAP_DELAY: Duration = Duration::from_secs(60);

/// One queued mutation, written by the enqueue path below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub op: String,
    pub payload: JsonValue,
    pub enqueued_at: String,
    /// Earliest instant this record may be popped and applied. Equal to
    /// `enqueued_at` until a failed attempt pushes it out by a backoff
    /// delay; `drain_once` re-queues records it pops before their time.
    pub not_before: String,
    pub attempt_count: u32,
    pub user: String,
    pub comment: String,
}

impl MutationRecord {
    fn new(entity_kind: &str, entity_id: &str, payload: JsonValue, user: &str, comment: &str, now: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_kind: entity_kind.to_string(),
            entity_id: entity_id.to_string(),
            op: "update".to_string(),
            payload,
            enqueued_at: now.to_string(),
            not_before: now.to_string(),
            attempt_count: 0,
            user: user.to_string(),
            comment: comment.to_string(),
        }
    }

    /// Whether `now` has reached this record's `not_before`. An unparseable
    /// `not_before` is treated as already due rather than stuck forever.
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        DateTime::parse_from_rfc3339(&self.not_before)
            .map(|dt| dt.with_timezone(&Utc) <= now)
            .unwrap_or(true)
    }
}

/// `min(cap, base * 2^(attempt - 1)) + uniform(0, base)`, `attempt` being
/// the post-increment `attempt_count` (so the first retry's exponent is 0).
fn retry_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let exponential = RETRY_BASE_DELAY.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
    let capped = exponential.min(RETRY_CAP_DELAY);
    let jitter_millis = rand::rng().random_range(0..=RETRY_BASE_DELAY.as_millis().max(1) as u64);
    capped + Duration::from_millis(jitter_millis)
}

/// Result of draining the queue: `(applied, failed)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: u64,
    pub failed: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum WriteBehindError {
    #[error("cache write failed, mutation was not enqueued: {0}")]
    CacheWrite(String),
    #[error("queue push failed: {0}")]
    QueuePush(String),
}

/// Write-behind engine for one entity kind, paired with the `SoTStore`
/// mutation logic in [`EntityMapper`].
pub struct WriteBehind<K, S, M> {
    kv: K,
    sot: S,
    mapper: M,
    ttl: Duration,
    max_attempts: u32,
    namespace_prefix: String,
}

impl<K: KVStore, S: SoTStore, M: EntityMapper + Clone + 'static> WriteBehind<K, S, M> {
    pub fn new(
        kv: K,
        sot: S,
        mapper: M,
        ttl: Duration,
        max_attempts: u32,
        namespace_prefix: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            sot,
            mapper,
            ttl,
            max_attempts,
            namespace_prefix: namespace_prefix.into(),
        }
    }

    fn cache_key_for(&self, entity_id: &str) -> String {
        if self.namespace_prefix.is_empty() {
            cache_key(&[self.mapper.entity_kind(), entity_id])
        } else {
            cache_key(&[&self.namespace_prefix, self.mapper.entity_kind(), entity_id])
        }
    }

    /// Caller-thread enqueue path: set the cache immediately so readers see
    /// the new value, then push the mutation onto the durable queue.
    /// A cache-write failure aborts before enqueue (the caller can retry);
    /// a queue-push failure is fatal to the call.
    pub async fn update_entity(
        &self,
        entity_id: &str,
        new_state: JsonValue,
        user: &str,
        comment: &str,
        now: &str,
    ) -> Result<(), CoreError> {
        let key = self.cache_key_for(entity_id);
        let bytes = serde_json::to_vec(&new_state).map_err(|e| WriteBehindError::CacheWrite(e.to_string()))?;
        self.kv
            .set(&key, bytes, self.ttl)
            .await
            .map_err(|e| WriteBehindError::CacheWrite(e.to_string()))?;

        let record = MutationRecord::new(self.mapper.entity_kind(), entity_id, new_state, user, comment, now);
        let encoded = serde_json::to_vec(&record).map_err(|e| WriteBehindError::QueuePush(e.to_string()))?;
        self.kv
            .list_push_right(QUEUE_MAIN, encoded)
            .await
            .map_err(|e| WriteBehindError::QueuePush(e.to_string()))?;
        Ok(())
    }

    /// Pop up to `batch_size` records, atomically moving each into the
    /// in-flight list before applying it, per the reliable-queue pattern.
    /// A record whose `not_before` hasn't arrived yet is pushed straight
    /// back to the tail rather than applied, skipping early retries.
    pub async fn drain_once(&self, batch_size: usize) -> DrainReport {
        let popped = match self.kv.list_pop_left(QUEUE_MAIN, batch_size).await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "failed to pop from the mutation queue");
                return DrainReport::default();
            }
        };

        let now = Utc::now();
        let mut report = DrainReport::default();
        for encoded in popped {
            let Ok(record) = serde_json::from_slice::<MutationRecord>(&encoded) else {
                error!("dropping unparseable queue record");
                report.failed += 1;
                continue;
            };

            if !record.is_due(now) {
                debug!(id = %record.id, not_before = %record.not_before, "record not yet due, re-queuing");
                if let Err(err) = self.kv.list_push_right(QUEUE_MAIN, encoded).await {
                    error!(id = %record.id, error = %err, "failed to re-queue a not-yet-due record, it is now lost");
                }
                continue;
            }

            if let Err(err) = self.kv.list_push_right(QUEUE_INFLIGHT, encoded.clone()).await {
                warn!(error = %err, "failed to mirror record into the in-flight list, continuing without it");
            }

            if self.apply_one(&record).await {
                report.applied += 1;
            } else {
                report.failed += 1;
            }
            self.remove_from_inflight(&record.id).await;
        }
        report
    }

    async fn apply_one(&self, record: &MutationRecord) -> bool {
        let mapper = self.mapper.clone();
        let entity_id = record.entity_id.clone();
        let payload = record.payload.clone();
        let user = record.user.clone();
        let comment = record.comment.clone();

        let outcome: Result<RowSet, SotError> = self
            .sot
            .transaction(Box::new(move |tx| {
                let before = mapper.read(tx, &entity_id)?;
                mapper.apply(tx, &entity_id, &payload)?;
                let after = mapper.read(tx, &entity_id)?;
                mapper.append_audit(tx, &entity_id, &before, &after, &user, &comment)?;
                Ok(after)
            }))
            .await;

        match outcome {
            Ok(_) => {
                debug!(id = %record.id, entity_id = %record.entity_id, "mutation applied");
                true
            }
            Err(err) => {
                warn!(id = %record.id, error = %err, "mutation commit failed");
                self.retry_or_dead_letter(record.clone()).await;
                false
            }
        }
    }

    async fn retry_or_dead_letter(&self, mut record: MutationRecord) {
        record.attempt_count += 1;

        if record.attempt_count < self.max_attempts {
            let delay = chrono::Duration::from_std(retry_backoff(record.attempt_count)).unwrap_or(chrono::Duration::zero());
            record.not_before = (Utc::now() + delay).to_rfc3339();
            let Ok(encoded) = serde_json::to_vec(&record) else {
                error!(id = %record.id, "failed to re-serialize record for retry, dropping");
                return;
            };
            if let Err(err) = self.kv.list_push_right(QUEUE_MAIN, encoded).await {
                error!(id = %record.id, error = %err, "failed to re-enqueue record, it is now lost");
            }
        } else {
            let Ok(encoded) = serde_json::to_vec(&record) else {
                error!(id = %record.id, "failed to re-serialize record for dead-lettering, dropping");
                return;
            };
            if let Err(err) = self.kv.list_push_right(QUEUE_DLQ, encoded).await {
                error!(id = %record.id, error = %err, "failed to dead-letter record after exhausting attempts, it is now lost");
            }
        }
    }

    /// Best-effort removal of a processed record from the in-flight list:
    /// read the whole list, drop the matching id, rewrite it. Acceptable
    /// at `write_behind.batch_size` scale (default 100); not a
    /// general-purpose list-delete primitive.
    async fn remove_from_inflight(&self, id: &str) {
        let Ok(all) = self.kv.list_pop_left(QUEUE_INFLIGHT, usize::MAX).await else {
            return;
        };
        for encoded in all {
            let keep = match serde_json::from_slice::<MutationRecord>(&encoded) {
                Ok(record) => record.id != id,
                Err(_) => true,
            };
            if keep {
                let _ = self.kv.list_push_right(QUEUE_INFLIGHT, encoded).await;
            }
        }
    }

    /// Move every record currently in the in-flight list back onto the
    /// main queue. Intended for startup recovery after an unclean shutdown,
    /// where some records may be stuck in-flight from a worker that died
    /// mid-commit.
    pub async fn reclaim_stale(&self) -> u64 {
        let stuck = match self.kv.list_pop_left(QUEUE_INFLIGHT, usize::MAX).await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "failed to read the in-flight list for reclaim");
                return 0;
            }
        };
        let count = stuck.len() as u64;
        for encoded in stuck {
            if let Err(err) = self.kv.list_push_right(QUEUE_MAIN, encoded).await {
                error!(error = %err, "failed to reclaim a stale in-flight record, it is now lost");
            }
        }
        count
    }

    /// Read-only peek at the dead-letter queue, for operator inspection.
    /// Pops the whole list and rewrites it rather than destructively
    /// draining it, matching [`Self::remove_from_inflight`]'s pattern.
    pub async fn dead_letters(&self) -> Vec<MutationRecord> {
        let Ok(encoded) = self.kv.list_pop_left(QUEUE_DLQ, usize::MAX).await else {
            return Vec::new();
        };
        let mut records = Vec::with_capacity(encoded.len());
        for bytes in &encoded {
            if let Ok(record) = serde_json::from_slice::<MutationRecord>(bytes) {
                records.push(record);
            }
            if let Err(err) = self.kv.list_push_right(QUEUE_DLQ, bytes.clone()).await {
                error!(error = %err, "failed to restore a dead-letter record after peeking");
            }
        }
        records
    }

    /// Drain on an interval until `cancel` fires.
    pub async fn drain_forever(&self, interval: Duration, batch_size: usize, cancel: &CancelToken) {
        while !cancel.is_cancelled() {
            let report = self.drain_once(batch_size).await;
            if report.applied > 0 || report.failed > 0 {
                debug!(applied = report.applied, failed = report.failed, "drain cycle complete");
            }
            if cancel.sleep(interval).await {
                break;
            }
        }
    }

    /// Shutdown helper: drain repeatedly until the queue is empty or
    /// `grace` elapses.
    pub async fn drain_until_empty(&self, batch_size: usize, grace: Duration) -> DrainReport {
        let deadline = tokio::time::Instant::now() + grace;
        let mut total = DrainReport::default();
        loop {
            let report = self.drain_once(batch_size).await;
            total.applied += report.applied;
            total.failed += report.failed;
            if report.applied == 0 && report.failed == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }
        total
    }
}
