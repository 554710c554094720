//! The `EntityStore` trait — versioned CRUD over user entities.
//!
//! Every mutating operation is tagged with the caller's current checkpoint
//! and runs in one serializable database transaction. Within a checkpoint,
//! successive writes to the same row collapse into a single version (the
//! squash rule); across checkpoints they append to the row's version chain.

use async_trait::async_trait;
use std::sync::Arc;

use chainstore_core::{Checkpoint, Row, Schema, StoreError, Value};

use crate::filter::{Filter, OrderBy};

/// Upper bound on rows per physical INSERT in [`EntityStore::create_many`].
///
/// Each chunk commits on its own: a failing chunk leaves earlier chunks in
/// place, so `create_many` is not atomic across chunks.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Store-level tunables.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Largest `take` a `find_many` call may request.
    pub max_page_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_page_size: 1000,
        }
    }
}

/// How `update` / `upsert` compute the new column values.
pub enum Patch {
    /// A plain patch object; listed keys overwrite the current row.
    Set(Row),
    /// Computed from the decoded current row (bigints and lists included).
    With(Box<dyn Fn(&Row) -> Row + Send + Sync>),
}

impl Patch {
    pub fn set(row: Row) -> Self {
        Self::Set(row)
    }

    pub fn with(f: impl Fn(&Row) -> Row + Send + Sync + 'static) -> Self {
        Self::With(Box::new(f))
    }

    /// Resolve against the current row.
    pub fn resolve(&self, current: &Row) -> Row {
        match self {
            Self::Set(row) => row.clone(),
            Self::With(f) => f(current),
        }
    }
}

impl std::fmt::Debug for Patch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Set(row) => f.debug_tuple("Set").field(row).finish(),
            Self::With(_) => f.write_str("With(<fn>)"),
        }
    }
}

/// Arguments to [`EntityStore::find_many`].
#[derive(Debug, Default)]
pub struct FindMany {
    pub filter: Option<Filter>,
    pub order_by: Option<OrderBy>,
    pub skip: Option<usize>,
    pub take: Option<usize>,
    /// Read as of this checkpoint; `None` reads current versions.
    pub at: Option<Checkpoint>,
}

/// Versioned CRUD over user entities, plus the namespace and revert
/// lifecycle. One store instance owns one namespace; there is no
/// multi-writer support.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// The schema the store currently serves.
    fn schema(&self) -> Arc<Schema>;

    /// Validate `schema`, register this run's namespace, and (re)create its
    /// versioned tables. Any previous content of the namespace is dropped.
    async fn reload(&self, schema: Schema) -> Result<(), StoreError>;

    /// Atomically promote this run's namespace to the stable public surface
    /// and clean up every older namespace.
    async fn publish(&self) -> Result<(), StoreError>;

    /// Roll every table back to `safe`: versions written at or after it are
    /// deleted and the surviving chain tails are re-opened. Idempotent.
    async fn revert(&self, safe: Checkpoint) -> Result<(), StoreError>;

    /// Close the connection pool. A second close is a no-op.
    async fn close(&self) -> Result<(), StoreError>;

    async fn create(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        id: Value,
        data: Row,
    ) -> Result<Row, StoreError>;

    /// Insert many rows (each carrying its `id` column) in chunks of
    /// [`MAX_BATCH_SIZE`]. Results come back flat, in input order.
    async fn create_many(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        rows: Vec<Row>,
    ) -> Result<Vec<Row>, StoreError>;

    async fn update(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        id: Value,
        patch: Patch,
    ) -> Result<Row, StoreError>;

    /// Apply the single-row update rule to every current version matching
    /// `filter`, inside one transaction.
    async fn update_many(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        filter: Option<Filter>,
        patch: Patch,
    ) -> Result<Vec<Row>, StoreError>;

    async fn upsert(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        id: Value,
        create: Row,
        update: Patch,
    ) -> Result<Row, StoreError>;

    /// Remove `id` as of `checkpoint`. A version created within the same
    /// checkpoint disappears without trace; otherwise the current version's
    /// validity is truncated. Returns `true` if anything was affected.
    async fn delete(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        id: Value,
    ) -> Result<bool, StoreError>;

    /// The version of `id` visible at `at` (`None` = current), if any.
    async fn find_unique(
        &self,
        table: &str,
        id: &Value,
        at: Option<Checkpoint>,
    ) -> Result<Option<Row>, StoreError>;

    async fn find_many(&self, table: &str, query: FindMany) -> Result<Vec<Row>, StoreError>;
}

/// Shared `take` validation for both backends.
pub(crate) fn validate_take(take: Option<usize>, max: usize) -> Result<(), StoreError> {
    if let Some(take) = take {
        if take > max {
            return Err(StoreError::PageSizeExceeded { take, max });
        }
    }
    Ok(())
}

/// Split `rows` into insert chunks.
pub(crate) fn chunks(rows: &[Row]) -> impl Iterator<Item = &[Row]> {
    rows.chunks(MAX_BATCH_SIZE)
}

/// Render an id for error messages.
pub(crate) fn display_id(id: &Value) -> String {
    match id {
        Value::String(s) | Value::Bytes(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Bigint(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}

/// Map a driver error onto the store taxonomy: NOT NULL and CHECK
/// violations become SchemaConflict, everything else stays a database
/// error. Codes cover Postgres (23502/23514) and SQLite extended results
/// (1299 NOTNULL / 275 CHECK); the message probes catch drivers that
/// report bare primary codes.
pub(crate) fn classify_db_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
        let message = db.message();
        let not_null = code == "23502"
            || code == "1299"
            || message.contains("not-null constraint")
            || message.contains("NOT NULL constraint");
        let check = code == "23514" || code == "275" || message.contains("CHECK constraint");
        if not_null || check {
            return StoreError::SchemaConflict(message.to_string());
        }
    }
    StoreError::Database(e.to_string())
}

/// `create` on an id that already has a current version trips the
/// `(id, effectiveToCheckpoint)` primary key.
pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = e {
        let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
        return code == "23505"
            || code == "1555"
            || code == "2067"
            || db.message().contains("UNIQUE constraint");
    }
    false
}
