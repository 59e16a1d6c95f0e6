//! SQLite implementation of [`SoTStore`].
//!
//! `Arc<Mutex<Connection>>`, WAL mode, `busy_timeout`, an inline `SCHEMA`
//! constant applied on open via `run_migrations`. The schema here models
//! the workbench's aviation entities (airports, airlines, flights,
//! weather, bookings) plus the `audit_log` table every SoT mutation this
//! core performs appends to.

use super::{SoTStore, SotError, SotTransaction};
use crate::row::{Row, RowSet, Value};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Transaction};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe SQLite handle, the SQLite dialect of [`SoTStore`].
#[derive(Clone)]
pub struct SqliteSotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSotStore {
    pub fn open(path: &Path) -> Result<Self, SotError> {
        let conn = Connection::open(path).map_err(|e| SotError::Query(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SotError::Query(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| SotError::Query(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| SotError::Query(e.to_string()))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| SotError::Query(e.to_string()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, SotError> {
        let conn = Connection::open_in_memory().map_err(|e| SotError::Query(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| SotError::Query(e.to_string()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), SotError> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.execute_batch(SCHEMA)
            .map_err(|e| SotError::Query(e.to_string()))
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS airports (
    code        TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    city        TEXT NOT NULL,
    country     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS airlines (
    code        TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    country     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS flights (
    id              INTEGER PRIMARY KEY,
    number          TEXT NOT NULL,
    airline_code    TEXT NOT NULL REFERENCES airlines(code),
    origin          TEXT NOT NULL REFERENCES airports(code),
    destination     TEXT NOT NULL REFERENCES airports(code),
    departure       TEXT NOT NULL,
    arrival         TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'scheduled'
);
CREATE INDEX IF NOT EXISTS idx_flights_number ON flights(number);

CREATE TABLE IF NOT EXISTS weather (
    country     TEXT NOT NULL,
    zip         TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    conditions  TEXT NOT NULL,
    temp_c      REAL NOT NULL,
    PRIMARY KEY (country, zip, recorded_at)
);

CREATE TABLE IF NOT EXISTS bookings (
    id              INTEGER PRIMARY KEY,
    passenger_id    TEXT NOT NULL,
    flight_id       INTEGER NOT NULL REFERENCES flights(id),
    seat            TEXT,
    status          TEXT NOT NULL DEFAULT 'confirmed'
);
CREATE INDEX IF NOT EXISTS idx_bookings_passenger ON bookings(passenger_id);

CREATE TABLE IF NOT EXISTS audit_log (
    id              INTEGER PRIMARY KEY,
    entity_kind     TEXT NOT NULL,
    entity_id       TEXT NOT NULL,
    before_json     TEXT NOT NULL,
    after_json      TEXT NOT NULL,
    user            TEXT NOT NULL,
    comment         TEXT NOT NULL DEFAULT '',
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_audit_log_entity ON audit_log(entity_kind, entity_id);
"#;

fn json_to_sql(value: &JsonValue) -> rusqlite::types::Value {
    match value {
        JsonValue::Null => rusqlite::types::Value::Null,
        JsonValue::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        JsonValue::Number(n) => n
            .as_i64()
            .map(rusqlite::types::Value::Integer)
            .unwrap_or_else(|| rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))),
        JsonValue::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn sql_value_to_row_value(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn rows_from_statement(
    stmt: &mut rusqlite::Statement<'_>,
    params: &[rusqlite::types::Value],
) -> Result<RowSet, SotError> {
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let param_refs: Vec<&dyn rusqlite::ToSql> =
        params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
    let mut result = Vec::new();
    let mut rows = stmt
        .query(param_refs.as_slice())
        .map_err(|e| SotError::Query(e.to_string()))?;
    while let Some(row) = rows.next().map_err(|e| SotError::Query(e.to_string()))? {
        let mut out = Row::new();
        for (i, name) in column_names.iter().enumerate() {
            let value_ref = row
                .get_ref(i)
                .map_err(|e| SotError::Query(e.to_string()))?;
            out.push(name.clone(), sql_value_to_row_value(value_ref));
        }
        result.push(out);
    }
    Ok(result)
}

fn execute_read(conn: &Connection, sql: &str, params: &[JsonValue]) -> Result<RowSet, SotError> {
    let bound: Vec<rusqlite::types::Value> = params.iter().map(json_to_sql).collect();
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| SotError::Query(e.to_string()))?;
    rows_from_statement(&mut stmt, &bound)
}

#[async_trait]
impl SoTStore for SqliteSotStore {
    async fn execute(&self, sql: &str, params: &[JsonValue]) -> Result<RowSet, SotError> {
        let conn = self.conn.clone();
        let sql = sql.to_string();
        let params = params.to_vec();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("database mutex poisoned");
            execute_read(&guard, &sql, &params)
        })
        .await
        .map_err(|e| SotError::Query(e.to_string()))?
    }

    async fn transaction(
        &self,
        body: Box<dyn FnOnce(&mut dyn SotTransaction) -> Result<RowSet, SotError> + Send + 'static>,
    ) -> Result<RowSet, SotError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().expect("database mutex poisoned");
            let tx = guard
                .transaction()
                .map_err(|e| SotError::Transaction(e.to_string()))?;
            let mut ctx = RusqliteTransaction { tx };
            match body(&mut ctx) {
                Ok(rows) => {
                    ctx.tx
                        .commit()
                        .map_err(|e| SotError::Transaction(e.to_string()))?;
                    Ok(rows)
                }
                Err(err) => {
                    let _ = ctx.tx.rollback();
                    Err(err)
                }
            }
        })
        .await
        .map_err(|e| SotError::Transaction(e.to_string()))?
    }
}

struct RusqliteTransaction<'conn> {
    tx: Transaction<'conn>,
}

impl SotTransaction for RusqliteTransaction<'_> {
    fn read(&mut self, sql: &str, params: &[JsonValue]) -> Result<RowSet, SotError> {
        execute_read(&self.tx, sql, params)
    }

    fn update(&mut self, sql: &str, params: &[JsonValue]) -> Result<u64, SotError> {
        let bound: Vec<rusqlite::types::Value> = params.iter().map(json_to_sql).collect();
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            bound.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
        self.tx
            .execute(sql, param_refs.as_slice())
            .map(|n| n as u64)
            .map_err(|e| SotError::Query(e.to_string()))
    }

    fn insert(&mut self, sql: &str, params: &[JsonValue]) -> Result<u64, SotError> {
        self.update(sql, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_create_expected_tables() {
        let store = SqliteSotStore::open_in_memory().unwrap();
        let rows = store
            .execute(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                &[],
            )
            .await
            .unwrap();
        let names: Vec<String> = rows
            .iter()
            .filter_map(|r| r.get("name").and_then(Value::as_text).map(str::to_string))
            .collect();
        assert!(names.contains(&"flights".to_string()));
        assert!(names.contains(&"audit_log".to_string()));
    }

    #[tokio::test]
    async fn transaction_commits_update_and_audit_together() {
        let store = SqliteSotStore::open_in_memory().unwrap();
        store
            .execute(
                "INSERT INTO airlines (code, name, country) VALUES ('UA', 'United', 'US')",
                &[],
            )
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

        let result = store
            .transaction(Box::new(|tx| {
                tx.update(
                    "UPDATE flights SET departure = ?1 WHERE id = 1",
                    &[JsonValue::String("2025-11-20T12:00:00".into())],
                )?;
                tx.insert(
                    "INSERT INTO audit_log (entity_kind, entity_id, before_json, after_json, user, comment)
                     VALUES ('flight', '1', '{}', '{}', 'ops', 'weather')",
                    &[],
                )?;
                tx.read("SELECT * FROM flights WHERE id = 1", &[])
            }))
            .await
            .unwrap();

        assert_eq!(
            result[0].get("departure").and_then(Value::as_text),
            Some("2025-11-20T12:00:00")
        );

        let audit = store
            .execute("SELECT * FROM audit_log", &[])
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let store = SqliteSotStore::open_in_memory().unwrap();
        let err = store
            .transaction(Box::new(|tx| {
                tx.insert(
                    "INSERT INTO airlines (code, name, country) VALUES ('UA', 'United', 'US')",
                    &[],
                )?;
                Err(SotError::Query("simulated failure".into()))
            }))
            .await;
        assert!(err.is_err());

        let rows = store.execute("SELECT * FROM airlines", &[]).await.unwrap();
        assert!(rows.is_empty());
    }
}
