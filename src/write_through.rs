//! Synchronous write-through updates: the SoT transaction is the only
//! consistency boundary, the cache set afterward is best-effort.
//!
//! Follows an "apply then append an audit row in the same transaction"
//! pattern, generalized from a single fixed mutation to an arbitrary
//! entity mutation via [`EntityMapper`].

use crate::error::CoreError;
use crate::kvstore::{cache_key, KVStore};
use crate::row::RowSet;
use crate::sot::{SotError, SotTransaction, SoTStore};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

/// Maps a logical entity kind (e.g. `"flight"`, `"booking"`) onto concrete
/// SoT reads/writes. One `WriteThrough` is constructed per entity kind,
/// since `update_entity(entity_id, new_state, user, comment)` carries no
/// `entity_kind` parameter of its own.
pub trait EntityMapper: Send + Sync {
    /// Used in audit rows and as part of the cache key.
    fn entity_kind(&self) -> &str;

    /// Read the entity's current row(s), for the audit `before` snapshot
    /// and the post-commit cache refresh.
    fn read(&self, tx: &mut dyn SotTransaction, entity_id: &str) -> Result<RowSet, SotError>;

    /// Apply `new_state` to the entity.
    fn apply(
        &self,
        tx: &mut dyn SotTransaction,
        entity_id: &str,
        new_state: &JsonValue,
    ) -> Result<(), SotError>;

    /// Append one row to the audit log, in the same transaction as `apply`.
    fn append_audit(
        &self,
        tx: &mut dyn SotTransaction,
        entity_id: &str,
        before: &RowSet,
        after: &RowSet,
        user: &str,
        comment: &str,
    ) -> Result<(), SotError>;
}

/// Write-through engine for one entity kind.
pub struct WriteThrough<K, S, M> {
    kv: K,
    sot: S,
    mapper: M,
    ttl: Duration,
    namespace_prefix: String,
}

impl<K: KVStore, S: SoTStore, M: EntityMapper + Clone + 'static> WriteThrough<K, S, M> {
    pub fn new(kv: K, sot: S, mapper: M, ttl: Duration, namespace_prefix: impl Into<String>) -> Self {
        Self {
            kv,
            sot,
            mapper,
            ttl,
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

    /// Applies `new_state` to `entity_id` inside one SoT transaction
    /// (read-before, apply, append-audit, commit), then best-effort
    /// refreshes the cache entry. SoT failures roll back and surface;
    /// a cache-write failure after commit is logged and swallowed.
    pub async fn update_entity(
        &self,
        entity_id: &str,
        new_state: JsonValue,
        user: &str,
        comment: &str,
    ) -> Result<(), CoreError> {
        let mapper = self.mapper.clone();
        let entity_id_owned = entity_id.to_string();
        let user_owned = user.to_string();
        let comment_owned = comment.to_string();

        let after = self
            .sot
            .transaction(Box::new(move |tx| {
                let before = mapper.read(tx, &entity_id_owned)?;
                mapper.apply(tx, &entity_id_owned, &new_state)?;
                let after = mapper.read(tx, &entity_id_owned)?;
                mapper.append_audit(tx, &entity_id_owned, &before, &after, &user_owned, &comment_owned)?;
                Ok(after)
            }))
            .await?;

        let key = self.cache_key_for(entity_id);
        match serde_json::to_vec(&after) {
            Ok(bytes) => {
                if let Err(err) = self.kv.set(&key, bytes, self.ttl).await {
                    warn!(key = %key, error = %err, "cache refresh failed after a committed write-through; next reader repopulates via cache-aside");
                }
            }
            Err(err) => {
                warn!(key = %key, error = %err, "committed row set could not serialize, skipping cache refresh");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::InMemoryKvStore;
    use crate::row::Value;
    use crate::sot::SqliteSotStore;

    #[derive(Clone)]
    struct FlightMapper;

    impl EntityMapper for FlightMapper {
        fn entity_kind(&self) -> &str {
            "flight"
        }

        fn read(&self, tx: &mut dyn SotTransaction, entity_id: &str) -> Result<RowSet, SotError> {
            tx.read(
                "SELECT * FROM flights WHERE id = ?1",
                &[JsonValue::String(entity_id.to_string())],
            )
        }

        fn apply(
            &self,
            tx: &mut dyn SotTransaction,
            entity_id: &str,
            new_state: &JsonValue,
        ) -> Result<(), SotError> {
            let status = new_state
                .get("status")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| SotError::Transaction("new_state missing `status`".into()))?;
            tx.update(
                "UPDATE flights SET status = ?1 WHERE id = ?2",
                &[JsonValue::String(status.to_string()), JsonValue::String(entity_id.to_string())],
            )?;
            Ok(())
        }

        fn append_audit(
            &self,
            tx: &mut dyn SotTransaction,
            entity_id: &str,
            before: &RowSet,
            after: &RowSet,
            user: &str,
            comment: &str,
        ) -> Result<(), SotError> {
            tx.insert(
                "INSERT INTO audit_log (entity_kind, entity_id, before_json, after_json, user, comment)
                 VALUES ('flight', ?1, ?2, ?3, ?4, ?5)",
                &[
                    JsonValue::String(entity_id.to_string()),
                    JsonValue::String(serde_json::to_string(before).unwrap_or_default()),
                    JsonValue::String(serde_json::to_string(after).unwrap_or_default()),
                    JsonValue::String(user.to_string()),
                    JsonValue::String(comment.to_string()),
                ],
            )?;
            Ok(())
        }
    }

    async fn seeded_store() -> SqliteSotStore {
        let store = SqliteSotStore::open_in_memory().unwrap();
        store
            .execute("INSERT INTO airlines (code, name, country) VALUES ('UA', 'United', 'US')", &[])
            .await
            .unwrap();
        store
            .execute(
                "INSERT INTO airports (code, name, city, country) VALUES
                 ('JFK', 'JFK', 'New York', 'US'), ('LAX', 'LAX', 'Los Angeles', 'US')",
                &[],
            )
            .await
            .unwrap();
        store
            .execute(
                "INSERT INTO flights (id, number, airline_code, origin, destination, departure, arrival)
                 VALUES (1, 'UA100', 'UA', 'JFK', 'LAX', '2025-11-20T10:00:00', '2025-11-20T13:00:00')",
                &[],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn update_commits_audits_and_refreshes_the_cache() {
        let kv = InMemoryKvStore::new();
        let sot = seeded_store().await;
        let wt = WriteThrough::new(kv.clone(), sot.clone(), FlightMapper, Duration::from_secs(60), "");

        wt.update_entity("1", serde_json::json!({"status": "delayed"}), "ops", "weather")
            .await
            .unwrap();

        let rows = sot.execute("SELECT status FROM flights WHERE id = 1", &[]).await.unwrap();
        assert_eq!(rows[0].get("status").and_then(Value::as_text), Some("delayed"));

        let audit = sot.execute("SELECT * FROM audit_log", &[]).await.unwrap();
        assert_eq!(audit.len(), 1);

        let key = cache_key(&["flight", "1"]);
        let cached = kv.get(&key).await.unwrap();
        assert!(cached.is_some());
        let rows: RowSet = serde_json::from_slice(&cached.unwrap()).unwrap();
        assert_eq!(rows[0].get("status").and_then(Value::as_text), Some("delayed"));
    }

    #[tokio::test]
    async fn invalid_new_state_rolls_back_and_leaves_no_audit_row() {
        let kv = InMemoryKvStore::new();
        let sot = seeded_store().await;
        let wt = WriteThrough::new(kv, sot.clone(), FlightMapper, Duration::from_secs(60), "");

        let err = wt
            .update_entity("1", serde_json::json!({"no_status_field": true}), "ops", "oops")
            .await;
        assert!(err.is_err());

        let audit = sot.execute("SELECT * FROM audit_log", &[]).await.unwrap();
        assert!(audit.is_empty());
    }
}
