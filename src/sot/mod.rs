//! The `SoTStore` abstraction over the relational source of truth.
//!
//! Follows a `Database`-style shape: a cloneable handle wrapping a
//! pooled/locked connection, with `run_migrations` applying an inline
//! `SCHEMA` constant on open. Expressed here as a trait so the core can
//! in principle swap RDBMS dialects without touching call sites; only the
//! SQLite dialect ships in this crate.

mod sqlite;

pub use sqlite::SqliteSotStore;

use crate::row::RowSet;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

#[derive(Debug, thiserror::Error, Clone)]
pub enum SotError {
    #[error("query failed: {0}")]
    Query(String),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("entity not found: {0}")]
    NotFound(String),
}

/// Parameterized query execution plus a transactional read/update/insert
/// context: `SoTStore.execute(sql, params) → rows`;
/// `SoTStore.transaction() → ctx`.
#[async_trait]
pub trait SoTStore: Send + Sync {
    /// Execute a parameterized query and return its rows. Used by the
    /// read path (`CacheAside::execute`) and by `SotTransaction::read`.
    async fn execute(&self, sql: &str, params: &[JsonValue]) -> Result<RowSet, SotError>;

    /// Run `body` inside a single SoT transaction, committing if it
    /// returns `Ok` and rolling back otherwise. `body` receives a
    /// `&mut dyn SotTransaction` bound to the open connection and returns
    /// the canonical row set representing the entity's state after the
    /// mutation, re-read in the same transaction.
    ///
    /// `body` must be `'static`: implementations run it on a blocking
    /// worker thread (`tokio::task::spawn_blocking`), so it cannot borrow
    /// from the caller's stack.
    async fn transaction(
        &self,
        body: Box<dyn FnOnce(&mut dyn SotTransaction) -> Result<RowSet, SotError> + Send + 'static>,
    ) -> Result<RowSet, SotError>;
}

/// Operations available inside an open `SoTStore` transaction.
pub trait SotTransaction {
    fn read(&mut self, sql: &str, params: &[JsonValue]) -> Result<RowSet, SotError>;
    fn update(&mut self, sql: &str, params: &[JsonValue]) -> Result<u64, SotError>;
    fn insert(&mut self, sql: &str, params: &[JsonValue]) -> Result<u64, SotError>;
}

#[async_trait]
impl<T: SoTStore + ?Sized> SoTStore for Arc<T> {
    async fn execute(&self, sql: &str, params: &[JsonValue]) -> Result<RowSet, SotError> {
        (**self).execute(sql, params).await
    }

    async fn transaction(
        &self,
        body: Box<dyn FnOnce(&mut dyn SotTransaction) -> Result<RowSet, SotError> + Send + 'static>,
    ) -> Result<RowSet, SotError> {
        (**self).transaction(body).await
    }
}
