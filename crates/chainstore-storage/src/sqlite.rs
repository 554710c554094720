//! SQLite entity-store backend.
//!
//! SQLite has no schemas and no notification channel, so the namespace
//! becomes a table-name prefix (`ponder_<tag>_<table>_versioned`) and
//! publish promotes plain views without a publish signal. The version
//! chains and the squash/branch and revert rules match the Postgres
//! backend statement for statement.
//!
//! # Usage
//! ```rust,no_run
//! use chainstore_storage::sqlite::SqliteEntityStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteEntityStore::open("./index.db", Default::default()).await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteEntityStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Row as _, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use chainstore_core::value::{
    canonicalize_row, decode_value, encode_row, encode_value, merge_patch, Physical, StorageType,
};
use chainstore_core::{Checkpoint, Row, Schema, StoreError, TableDef, Value, CHECKPOINT_LATEST};
use chainstore_observability::ChainStoreMetrics;

use crate::sql::{self, Dialect, ParamKind, SqlParam, TableRef};
use crate::store::{
    chunks, classify_db_error, display_id, is_unique_violation, validate_take, EntityStore,
    FindMany, Patch, StoreOptions,
};

const DIALECT: Dialect = Dialect::Sqlite;

struct VersionRow {
    row: Row,
    from: String,
}

/// SQLite-backed versioned entity store.
pub struct SqliteEntityStore {
    pool: SqlitePool,
    namespace: String,
    schema: RwLock<Arc<Schema>>,
    options: StoreOptions,
    metrics: Option<ChainStoreMetrics>,
    closed: AtomicBool,
}

impl SqliteEntityStore {
    /// Open (or create) a SQLite database at `path` and enable WAL mode.
    pub async fn open(path: &str, options: StoreOptions) -> Result<Self, StoreError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| StoreError::Database(format!("sqlite connect: {e}")))?;
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(classify_db_error)?;
        Self::with_pool(pool, options).await
    }

    /// Open an in-memory database. All data is lost when the store drops.
    pub async fn in_memory() -> Result<Self, StoreError> {
        // One pinned connection: every pooled connection to `:memory:` gets
        // its own private database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::Database(format!("sqlite connect: {e}")))?;
        Self::with_pool(pool, StoreOptions::default()).await
    }

    async fn with_pool(pool: SqlitePool, options: StoreOptions) -> Result<Self, StoreError> {
        let namespace = format!("ponder_{:013}", chrono::Utc::now().timestamp_millis());
        let store = Self {
            pool,
            namespace,
            schema: RwLock::new(Arc::new(Schema::default())),
            options,
            metrics: None,
            closed: AtomicBool::new(false),
        };
        store.init_registry().await?;
        info!(namespace = %store.namespace, "SqliteEntityStore opened");
        Ok(store)
    }

    pub fn with_metrics(mut self, metrics: ChainStoreMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_registry(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ponder_metadata (
                namespace_version TEXT NOT NULL PRIMARY KEY,
                schema            TEXT,
                is_published      INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(())
    }

    fn current_schema(&self) -> Arc<Schema> {
        self.schema.read().unwrap().clone()
    }

    fn table_ref(&self, table: &TableDef) -> TableRef {
        TableRef {
            qualifier: None,
            name: format!("{}_{}_versioned", self.namespace, table.name),
        }
    }

    fn record(&self, method: &'static str, table: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_store_method(method, table, started.elapsed());
        }
    }

    async fn begin(&self) -> Result<Transaction<'_, Sqlite>, StoreError> {
        self.pool.begin().await.map_err(classify_db_error)
    }

    /// The published namespace, if a publish has happened on this database.
    pub async fn published_namespace(&self) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar(
            "SELECT namespace_version FROM ponder_metadata
             WHERE is_published = 1 ORDER BY namespace_version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_db_error)
    }

    async fn load_version(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        schema: &Schema,
        table: &TableDef,
        id: &Value,
        at: Option<&str>,
    ) -> Result<Option<VersionRow>, StoreError> {
        let (sql_text, params) =
            sql::select_version(DIALECT, schema, table, &self.table_ref(table), id, at)?;
        let row = bind_all(&sql_text, params)?
            .fetch_optional(&mut **tx)
            .await
            .map_err(classify_db_error)?;
        row.map(|r| decode_version(schema, table, &r)).transpose()
    }

    async fn apply_update(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        schema: &Schema,
        table: &TableDef,
        id: &Value,
        checkpoint: &str,
        current: &VersionRow,
        patch_row: Row,
    ) -> Result<Row, StoreError> {
        if patch_row.contains_key("id") {
            return Err(StoreError::SchemaConflict(
                "the 'id' column cannot be patched".into(),
            ));
        }
        if current.from.as_str() > checkpoint {
            return Err(StoreError::PastWrite {
                table: table.name.clone(),
                id: display_id(id),
                checkpoint: checkpoint.to_string(),
                latest_from: current.from.clone(),
            });
        }

        let tref = self.table_ref(table);
        let merged = merge_patch(&current.row, &patch_row);

        if current.from == checkpoint {
            let mut patched = Vec::with_capacity(patch_row.len());
            for (column, value) in &patch_row {
                let def = table.column(column).ok_or_else(|| {
                    StoreError::SchemaConflict(format!(
                        "unknown column '{}.{column}'",
                        table.name
                    ))
                })?;
                patched.push((column.clone(), encode_value(schema, def, value)?));
            }
            if !patched.is_empty() {
                let (sql_text, params) =
                    sql::squash_current(DIALECT, schema, table, &tref, &patched, id)?;
                bind_all(&sql_text, params)?
                    .execute(&mut **tx)
                    .await
                    .map_err(classify_db_error)?;
            }
        } else {
            let (close_sql, close_params) =
                sql::close_current(DIALECT, schema, table, &tref, id, checkpoint)?;
            bind_all(&close_sql, close_params)?
                .execute(&mut **tx)
                .await
                .map_err(classify_db_error)?;

            let encoded = encode_row(schema, table, &merged)?;
            let (insert_sql, insert_params) =
                sql::insert_versions(DIALECT, schema, table, &tref, &[encoded], checkpoint)?;
            bind_all(&insert_sql, insert_params)?
                .execute(&mut **tx)
                .await
                .map_err(classify_db_error)?;
        }

        Ok(canonicalize_row(schema, table, &merged)?)
    }

    async fn insert_new(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        schema: &Schema,
        table: &TableDef,
        id: &Value,
        row: &Row,
        checkpoint: &str,
    ) -> Result<Row, StoreError> {
        let tref = self.table_ref(table);
        let encoded = encode_row(schema, table, row)?;
        let (sql_text, params) =
            sql::insert_versions(DIALECT, schema, table, &tref, &[encoded], checkpoint)?;
        match bind_all(&sql_text, params)?.execute(&mut **tx).await {
            Ok(_) => Ok(canonicalize_row(schema, table, row)?),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists {
                table: table.name.clone(),
                id: display_id(id),
            }),
            Err(e) => Err(classify_db_error(e)),
        }
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    fn schema(&self) -> Arc<Schema> {
        self.current_schema()
    }

    async fn reload(&self, schema: Schema) -> Result<(), StoreError> {
        schema
            .validate()
            .map_err(|e| StoreError::SchemaConflict(e.to_string()))?;

        let schema_json = serde_json::to_string(&schema)
            .map_err(|e| StoreError::Database(format!("serialize schema: {e}")))?;
        sqlx::query(
            "INSERT INTO ponder_metadata (namespace_version, schema, is_published)
             VALUES (?, ?, 0)
             ON CONFLICT (namespace_version) DO UPDATE SET schema = excluded.schema",
        )
        .bind(&self.namespace)
        .bind(&schema_json)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;

        for table in &schema.tables {
            let tref = self.table_ref(table);
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", tref.sql()))
                .execute(&self.pool)
                .await
                .map_err(classify_db_error)?;
            let ddl = sql::create_versioned_table(DIALECT, &schema, table, &tref)?;
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(classify_db_error)?;
        }

        debug!(
            namespace = %self.namespace,
            tables = schema.tables.len(),
            "namespace reloaded"
        );
        *self.schema.write().unwrap() = Arc::new(schema);
        Ok(())
    }

    async fn publish(&self) -> Result<(), StoreError> {
        let schema = self.current_schema();
        let own_prefix = format!("{}_", self.namespace);
        let mut tx = self.begin().await?;

        sqlx::query("UPDATE ponder_metadata SET is_published = 1 WHERE namespace_version = ?")
            .bind(&self.namespace)
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;
        sqlx::query("DELETE FROM ponder_metadata WHERE namespace_version < ?")
            .bind(&self.namespace)
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;

        // Versioned tables of older runs. LIKE-escaping underscores is
        // messier than filtering here.
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&mut *tx)
                .await
                .map_err(classify_db_error)?;
        let stale: Vec<&String> = tables
            .iter()
            .filter(|name| {
                name.starts_with("ponder_")
                    && name.ends_with("_versioned")
                    && !name.starts_with(&own_prefix)
            })
            .collect();
        for old in &stale {
            sqlx::query(&format!("DROP TABLE {}", sql::quote_ident(old)))
                .execute(&mut *tx)
                .await
                .map_err(classify_db_error)?;
            debug!(table = %old, "dropped retired versioned table");
        }

        for table in &schema.tables {
            let tref = self.table_ref(table);
            let versioned_view = format!("{}_versioned", table.name);
            sqlx::query(&format!(
                "DROP VIEW IF EXISTS {}",
                sql::quote_ident(&versioned_view)
            ))
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;
            sqlx::query(&format!(
                "CREATE VIEW {} AS SELECT * FROM {}",
                sql::quote_ident(&versioned_view),
                tref.sql()
            ))
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;

            sqlx::query(&format!(
                "DROP VIEW IF EXISTS {}",
                sql::quote_ident(&table.name)
            ))
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;
            let user_columns = table
                .stored_columns()
                .map(|c| sql::quote_ident(&c.name))
                .collect::<Vec<_>>()
                .join(", ");
            sqlx::query(&format!(
                "CREATE VIEW {} AS SELECT {user_columns} FROM {} \
                 WHERE \"effectiveToCheckpoint\" = '{CHECKPOINT_LATEST}'",
                sql::quote_ident(&table.name),
                tref.sql()
            ))
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;
        }

        tx.commit().await.map_err(classify_db_error)?;
        info!(namespace = %self.namespace, dropped = stale.len(), "namespace published");
        Ok(())
    }

    async fn revert(&self, safe: Checkpoint) -> Result<(), StoreError> {
        let schema = self.current_schema();
        let encoded = safe.encode();
        let mut tx = self.begin().await?;
        for table in &schema.tables {
            let tref = self.table_ref(table);
            let (delete_sql, delete_params) = sql::revert_delete(DIALECT, &tref, &encoded);
            let dropped = bind_all(&delete_sql, delete_params)?
                .execute(&mut *tx)
                .await
                .map_err(classify_db_error)?
                .rows_affected();
            let (reopen_sql, reopen_params) = sql::revert_reopen(DIALECT, &tref, &encoded);
            let reopened = bind_all(&reopen_sql, reopen_params)?
                .execute(&mut *tx)
                .await
                .map_err(classify_db_error)?
                .rows_affected();
            debug!(table = %table.name, dropped, reopened, "reverted table");
        }
        tx.commit().await.map_err(classify_db_error)?;
        info!(safe = %encoded, "store reverted to safe checkpoint");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close().await;
        }
        Ok(())
    }

    async fn create(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        id: Value,
        mut data: Row,
    ) -> Result<Row, StoreError> {
        let started = Instant::now();
        let schema = self.current_schema();
        let def = table_def(&schema, table)?;
        data.insert("id".into(), id.clone());

        let mut tx = self.begin().await?;
        let created = self
            .insert_new(&mut tx, &schema, def, &id, &data, &checkpoint.encode())
            .await?;
        tx.commit().await.map_err(classify_db_error)?;
        self.record("create", table, started);
        Ok(created)
    }

    async fn create_many(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        rows: Vec<Row>,
    ) -> Result<Vec<Row>, StoreError> {
        let started = Instant::now();
        let schema = self.current_schema();
        let def = table_def(&schema, table)?;
        let tref = self.table_ref(def);
        let encoded_checkpoint = checkpoint.encode();

        let mut results = Vec::with_capacity(rows.len());
        for chunk in chunks(&rows) {
            let encoded = chunk
                .iter()
                .map(|row| encode_row(&schema, def, row))
                .collect::<Result<Vec<_>, _>>()?;
            let (sql_text, params) = sql::insert_versions(
                DIALECT,
                &schema,
                def,
                &tref,
                &encoded,
                &encoded_checkpoint,
            )?;

            let mut tx = self.begin().await?;
            bind_all(&sql_text, params)?
                .execute(&mut *tx)
                .await
                .map_err(classify_db_error)?;
            tx.commit().await.map_err(classify_db_error)?;

            for row in chunk {
                results.push(canonicalize_row(&schema, def, row)?);
            }
        }
        self.record("create_many", table, started);
        Ok(results)
    }

    async fn update(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        id: Value,
        patch: Patch,
    ) -> Result<Row, StoreError> {
        let started = Instant::now();
        let schema = self.current_schema();
        let def = table_def(&schema, table)?;
        let encoded_checkpoint = checkpoint.encode();

        let mut tx = self.begin().await?;
        let current = self
            .load_version(&mut tx, &schema, def, &id, None)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id: display_id(&id),
            })?;
        let patch_row = patch.resolve(&current.row);
        let updated = self
            .apply_update(
                &mut tx,
                &schema,
                def,
                &id,
                &encoded_checkpoint,
                &current,
                patch_row,
            )
            .await?;
        tx.commit().await.map_err(classify_db_error)?;
        self.record("update", table, started);
        Ok(updated)
    }

    async fn update_many(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        filter: Option<crate::filter::Filter>,
        patch: Patch,
    ) -> Result<Vec<Row>, StoreError> {
        let started = Instant::now();
        let schema = self.current_schema();
        let def = table_def(&schema, table)?;
        let tref = self.table_ref(def);
        let encoded_checkpoint = checkpoint.encode();

        let mut tx = self.begin().await?;
        let (sql_text, params) = sql::select_many(
            DIALECT,
            &schema,
            def,
            &tref,
            filter.as_ref(),
            None,
            None,
            None,
            None,
        )?;
        let matches = bind_all(&sql_text, params)?
            .fetch_all(&mut *tx)
            .await
            .map_err(classify_db_error)?;

        let mut results = Vec::with_capacity(matches.len());
        for raw in &matches {
            let current = decode_version(&schema, def, raw)?;
            let id = current.row.get("id").cloned().unwrap_or(Value::Null);
            let patch_row = patch.resolve(&current.row);
            let updated = self
                .apply_update(
                    &mut tx,
                    &schema,
                    def,
                    &id,
                    &encoded_checkpoint,
                    &current,
                    patch_row,
                )
                .await?;
            results.push(updated);
        }
        tx.commit().await.map_err(classify_db_error)?;
        self.record("update_many", table, started);
        Ok(results)
    }

    async fn upsert(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        id: Value,
        create: Row,
        update: Patch,
    ) -> Result<Row, StoreError> {
        let started = Instant::now();
        let schema = self.current_schema();
        let def = table_def(&schema, table)?;
        let encoded_checkpoint = checkpoint.encode();

        let mut tx = self.begin().await?;
        let current = self.load_version(&mut tx, &schema, def, &id, None).await?;
        let result = match current {
            Some(current) => {
                let patch_row = update.resolve(&current.row);
                self.apply_update(
                    &mut tx,
                    &schema,
                    def,
                    &id,
                    &encoded_checkpoint,
                    &current,
                    patch_row,
                )
                .await?
            }
            None => {
                let mut row = create;
                row.insert("id".into(), id.clone());
                self.insert_new(&mut tx, &schema, def, &id, &row, &encoded_checkpoint)
                    .await?
            }
        };
        tx.commit().await.map_err(classify_db_error)?;
        self.record("upsert", table, started);
        Ok(result)
    }

    async fn delete(
        &self,
        table: &str,
        checkpoint: Checkpoint,
        id: Value,
    ) -> Result<bool, StoreError> {
        let started = Instant::now();
        let schema = self.current_schema();
        let def = table_def(&schema, table)?;
        let tref = self.table_ref(def);
        let encoded_checkpoint = checkpoint.encode();

        let mut tx = self.begin().await?;
        let (erase_sql, erase_params) =
            sql::delete_created_at(DIALECT, &schema, def, &tref, &id, &encoded_checkpoint)?;
        let erased = bind_all(&erase_sql, erase_params)?
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?
            .rows_affected();

        let affected = if erased > 0 {
            erased
        } else {
            let (close_sql, close_params) =
                sql::close_current(DIALECT, &schema, def, &tref, &id, &encoded_checkpoint)?;
            bind_all(&close_sql, close_params)?
                .execute(&mut *tx)
                .await
                .map_err(classify_db_error)?
                .rows_affected()
        };
        tx.commit().await.map_err(classify_db_error)?;
        self.record("delete", table, started);
        Ok(affected > 0)
    }

    async fn find_unique(
        &self,
        table: &str,
        id: &Value,
        at: Option<Checkpoint>,
    ) -> Result<Option<Row>, StoreError> {
        let started = Instant::now();
        let schema = self.current_schema();
        let def = table_def(&schema, table)?;
        let encoded_at = at.map(|c| c.encode());

        let mut tx = self.begin().await?;
        let version = self
            .load_version(&mut tx, &schema, def, id, encoded_at.as_deref())
            .await?;
        tx.commit().await.map_err(classify_db_error)?;
        self.record("find_unique", table, started);
        Ok(version.map(|v| v.row))
    }

    async fn find_many(&self, table: &str, query: FindMany) -> Result<Vec<Row>, StoreError> {
        let started = Instant::now();
        let schema = self.current_schema();
        let def = table_def(&schema, table)?;
        validate_take(query.take, self.options.max_page_size)?;
        let encoded_at = query.at.map(|c| c.encode());

        let (sql_text, params) = sql::select_many(
            DIALECT,
            &schema,
            def,
            &self.table_ref(def),
            query.filter.as_ref(),
            query.order_by.as_ref(),
            query.skip,
            query.take,
            encoded_at.as_deref(),
        )?;
        let rows = bind_all(&sql_text, params)?
            .fetch_all(&self.pool)
            .await
            .map_err(classify_db_error)?;
        let decoded = rows
            .iter()
            .map(|r| decode_version(&schema, def, r).map(|v| v.row))
            .collect::<Result<Vec<_>, _>>()?;
        self.record("find_many", table, started);
        Ok(decoded)
    }
}

fn table_def<'s>(schema: &'s Schema, name: &str) -> Result<&'s TableDef, StoreError> {
    schema
        .table(name)
        .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
}

/// Bind a parameter list; bigints stay decimal text on SQLite.
fn bind_all(
    sql_text: &str,
    params: Vec<SqlParam>,
) -> Result<Query<'_, Sqlite, SqliteArguments<'_>>, StoreError> {
    let mut query = sqlx::query(sql_text);
    for param in params {
        query = match param {
            SqlParam::Null(ParamKind::Int) => query.bind(None::<i64>),
            SqlParam::Null(_) => query.bind(None::<String>),
            SqlParam::Int(i) => query.bind(i),
            SqlParam::Text(s) | SqlParam::Numeric(s) => query.bind(s),
        };
    }
    Ok(query)
}

fn decode_version(
    schema: &Schema,
    table: &TableDef,
    row: &sqlx::sqlite::SqliteRow,
) -> Result<VersionRow, StoreError> {
    let mut out = Row::new();
    for column in table.stored_columns() {
        let storage = StorageType::of(schema, column).ok_or_else(|| {
            StoreError::SchemaConflict(format!(
                "column '{}.{}' has no storage form",
                table.name, column.name
            ))
        })?;
        let physical = match sql::param_kind(storage) {
            ParamKind::Int => row
                .try_get::<Option<i64>, _>(column.name.as_str())
                .map_err(|e| StoreError::Database(e.to_string()))?
                .map(Physical::Int),
            ParamKind::Text | ParamKind::Numeric => row
                .try_get::<Option<String>, _>(column.name.as_str())
                .map_err(|e| StoreError::Database(e.to_string()))?
                .map(Physical::Text),
        }
        .unwrap_or(Physical::Null);
        out.insert(
            column.name.clone(),
            decode_value(schema, column, physical)?,
        );
    }
    let from: String = row
        .try_get("effectiveFromCheckpoint")
        .map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(VersionRow { row: out, from })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainstore_core::schema::{ColumnDef, ScalarType};

    fn token_schema() -> Schema {
        Schema::new(
            vec![],
            vec![TableDef::new(
                "Token",
                vec![
                    ColumnDef::scalar("id", ScalarType::Bytes),
                    ColumnDef::scalar("supply", ScalarType::Bigint),
                    ColumnDef::optional_scalar("symbol", ScalarType::String),
                ],
            )],
        )
    }

    fn cp(n: u64) -> Checkpoint {
        Checkpoint::at_block(n, 1, n)
    }

    fn supply(n: i64) -> Row {
        let mut row = Row::new();
        row.insert("supply".into(), Value::bigint(n));
        row
    }

    async fn store() -> SqliteEntityStore {
        let store = SqliteEntityStore::in_memory().await.unwrap();
        store.reload(token_schema()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_then_read_back() {
        let store = store().await;
        let created = store
            .create("Token", cp(1), Value::bytes("0xAB"), supply(10))
            .await
            .unwrap();
        // Bytes ids normalize to lowercase on write.
        assert_eq!(created["id"], Value::bytes("0xab"));

        // ...and compare case-insensitively on read.
        let found = store
            .find_unique("Token", &Value::bytes("0xab"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found["supply"], Value::bigint(10));
        let found_upper = store
            .find_unique("Token", &Value::bytes("0xAB"), None)
            .await
            .unwrap();
        assert!(found_upper.is_some());
    }

    #[tokio::test]
    async fn create_twice_is_rejected() {
        let store = store().await;
        store
            .create("Token", cp(1), Value::bytes("0x1"), supply(1))
            .await
            .unwrap();
        let err = store
            .create("Token", cp(2), Value::bytes("0x1"), supply(2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn update_missing_row_is_not_found() {
        let store = store().await;
        let err = store
            .update(
                "Token",
                cp(1),
                Value::bytes("0x404"),
                Patch::set(supply(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn past_write_is_fatal() {
        let store = store().await;
        store
            .create("Token", cp(5), Value::bytes("0x1"), supply(1))
            .await
            .unwrap();
        let err = store
            .update("Token", cp(3), Value::bytes("0x1"), Patch::set(supply(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PastWrite { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn update_by_function_sees_decoded_values() {
        let store = store().await;
        store
            .create("Token", cp(1), Value::bytes("0x1"), supply(40))
            .await
            .unwrap();
        let updated = store
            .update(
                "Token",
                cp(2),
                Value::bytes("0x1"),
                Patch::with(|current| {
                    let mut patch = Row::new();
                    match &current["supply"] {
                        Value::Bigint(b) => {
                            patch.insert("supply".into(), Value::Bigint(b + 2))
                        }
                        other => panic!("expected bigint, got {other:?}"),
                    };
                    patch
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated["supply"], Value::bigint(42));
    }

    #[tokio::test]
    async fn page_size_is_enforced() {
        let store = store().await;
        let err = store
            .find_many(
                "Token",
                FindMany {
                    take: Some(5000),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PageSizeExceeded { .. }));
    }

    #[tokio::test]
    async fn close_twice_is_a_noop() {
        let store = store().await;
        store.close().await.unwrap();
        store.close().await.unwrap();
    }
}
