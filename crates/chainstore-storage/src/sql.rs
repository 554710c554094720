//! Dialect-aware SQL for the versioned tables.
//!
//! Both backends execute the same logical statements; this module is the
//! single place the SQL text and parameter lists are assembled so the two
//! cannot drift. Placeholder style, the bigint column type, and table
//! qualification are the only per-dialect differences.

use chainstore_core::schema::{ScalarType, Schema, TableDef};
use chainstore_core::value::{encode_value, Physical, StorageType};
use chainstore_core::{StoreError, Value, CHECKPOINT_LATEST};

use crate::filter::{Condition, Direction, Filter, OrderBy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// How a parameter must be bound at the driver boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    Text,
    /// `numeric(78,0)` on Postgres, plain text on SQLite.
    Numeric,
}

/// A parameter ready for binding.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null(ParamKind),
    Int(i64),
    Text(String),
    Numeric(String),
}

/// A fully qualified physical table.
#[derive(Debug, Clone)]
pub struct TableRef {
    /// Postgres schema qualifier; SQLite folds the namespace into the name.
    pub qualifier: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn sql(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{}.{}", quote_ident(q), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Accumulates SQL text and its parameters, numbering placeholders per
/// dialect.
pub struct StatementBuilder {
    dialect: Dialect,
    sql: String,
    params: Vec<SqlParam>,
}

impl StatementBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn bind(&mut self, param: SqlParam) -> &mut Self {
        self.params.push(param);
        match self.dialect {
            Dialect::Postgres => {
                self.sql.push('$');
                self.sql.push_str(&self.params.len().to_string());
            }
            Dialect::Sqlite => self.sql.push('?'),
        }
        self
    }

    pub fn finish(self) -> (String, Vec<SqlParam>) {
        (self.sql, self.params)
    }
}

/// Resolve how a column's parameters bind, references followed to the
/// target id type.
fn column_param_kind(schema: &Schema, table: &TableDef, column: &str) -> Result<ParamKind, StoreError> {
    let def = table
        .column(column)
        .filter(|c| !c.kind.is_virtual())
        .ok_or_else(|| {
            StoreError::SchemaConflict(format!("unknown column '{}.{column}'", table.name))
        })?;
    let storage = StorageType::of(schema, def).ok_or_else(|| {
        StoreError::SchemaConflict(format!("column '{}.{column}' has no storage form", table.name))
    })?;
    Ok(param_kind(storage))
}

pub fn param_kind(storage: StorageType) -> ParamKind {
    match storage {
        StorageType::Scalar(ScalarType::Boolean) | StorageType::Scalar(ScalarType::Int) => {
            ParamKind::Int
        }
        StorageType::Scalar(ScalarType::Bigint) => ParamKind::Numeric,
        _ => ParamKind::Text,
    }
}

/// Pair a physically-encoded value with its bind kind.
pub fn to_param(kind: ParamKind, physical: Physical) -> SqlParam {
    match physical {
        Physical::Null => SqlParam::Null(kind),
        Physical::Int(i) => SqlParam::Int(i),
        Physical::Text(s) => match kind {
            ParamKind::Numeric => SqlParam::Numeric(s),
            _ => SqlParam::Text(s),
        },
    }
}

fn column_sql_type(dialect: Dialect, storage: StorageType) -> &'static str {
    match storage {
        StorageType::Scalar(ScalarType::Boolean) | StorageType::Scalar(ScalarType::Int) => {
            "integer"
        }
        StorageType::Scalar(ScalarType::Bigint) => match dialect {
            Dialect::Postgres => "numeric(78, 0)",
            Dialect::Sqlite => "text",
        },
        _ => "text",
    }
}

/// DDL for one versioned table.
pub fn create_versioned_table(
    dialect: Dialect,
    schema: &Schema,
    table: &TableDef,
    tref: &TableRef,
) -> Result<String, StoreError> {
    let mut columns = Vec::new();
    for column in table.stored_columns() {
        let storage = StorageType::of(schema, column).ok_or_else(|| {
            StoreError::SchemaConflict(format!(
                "column '{}.{}' has no storage form",
                table.name, column.name
            ))
        })?;
        let mut line = format!(
            "{} {}",
            quote_ident(&column.name),
            column_sql_type(dialect, storage)
        );
        if !column.kind.is_optional() {
            line.push_str(" NOT NULL");
        }
        if let StorageType::Enum = storage {
            if let chainstore_core::ColumnKind::Enum { name, .. } = &column.kind {
                let values = schema
                    .enum_def(name)
                    .map(|def| def.values.as_slice())
                    .unwrap_or_default();
                let list = values
                    .iter()
                    .map(|v| quote_literal(v))
                    .collect::<Vec<_>>()
                    .join(", ");
                line.push_str(&format!(
                    " CHECK ({} IN ({list}))",
                    quote_ident(&column.name)
                ));
            }
        }
        columns.push(line);
    }
    columns.push("\"effectiveFromCheckpoint\" varchar(58) NOT NULL".into());
    columns.push("\"effectiveToCheckpoint\" varchar(58) NOT NULL".into());
    columns.push("PRIMARY KEY (\"id\", \"effectiveToCheckpoint\")".into());

    Ok(format!(
        "CREATE TABLE {} ({})",
        tref.sql(),
        columns.join(", ")
    ))
}

/// The column list selected by every read, user columns first, then the
/// validity interval.
pub fn select_list(table: &TableDef) -> String {
    let mut cols: Vec<String> = table
        .stored_columns()
        .map(|c| quote_ident(&c.name))
        .collect();
    cols.push(quote_ident("effectiveFromCheckpoint"));
    cols.push(quote_ident("effectiveToCheckpoint"));
    cols.join(", ")
}

/// Multi-row INSERT of new versions opening at `from`.
pub fn insert_versions(
    dialect: Dialect,
    schema: &Schema,
    table: &TableDef,
    tref: &TableRef,
    rows: &[Vec<(String, Physical)>],
    from: &str,
) -> Result<(String, Vec<SqlParam>), StoreError> {
    let mut names: Vec<String> = table
        .stored_columns()
        .map(|c| quote_ident(&c.name))
        .collect();
    names.push(quote_ident("effectiveFromCheckpoint"));
    names.push(quote_ident("effectiveToCheckpoint"));

    let mut b = StatementBuilder::new(dialect);
    b.push(&format!(
        "INSERT INTO {} ({}) VALUES ",
        tref.sql(),
        names.join(", ")
    ));
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            b.push(", ");
        }
        b.push("(");
        for (column, physical) in row {
            let kind = column_param_kind(schema, table, column)?;
            b.bind(to_param(kind, physical.clone()));
            b.push(", ");
        }
        b.bind(SqlParam::Text(from.to_string()));
        b.push(", ");
        b.bind(SqlParam::Text(CHECKPOINT_LATEST.to_string()));
        b.push(")");
    }
    Ok(b.finish())
}

fn bind_id(
    b: &mut StatementBuilder,
    schema: &Schema,
    table: &TableDef,
    id: &Value,
) -> Result<(), StoreError> {
    let physical = chainstore_core::value::encode_id(schema, table, id)?;
    let kind = column_param_kind(schema, table, "id")?;
    b.push(" WHERE \"id\" = ");
    b.bind(to_param(kind, physical));
    Ok(())
}

fn push_visibility(b: &mut StatementBuilder, at: Option<&str>) {
    match at {
        None => {
            b.push(" AND \"effectiveToCheckpoint\" = ");
            b.bind(SqlParam::Text(CHECKPOINT_LATEST.to_string()));
        }
        Some(checkpoint) => {
            b.push(" AND \"effectiveFromCheckpoint\" <= ");
            b.bind(SqlParam::Text(checkpoint.to_string()));
            b.push(" AND (\"effectiveToCheckpoint\" > ");
            b.bind(SqlParam::Text(checkpoint.to_string()));
            b.push(" OR \"effectiveToCheckpoint\" = ");
            b.bind(SqlParam::Text(CHECKPOINT_LATEST.to_string()));
            b.push(")");
        }
    }
}

/// SELECT the version of `id` visible at `at` (`None` = current).
pub fn select_version(
    dialect: Dialect,
    schema: &Schema,
    table: &TableDef,
    tref: &TableRef,
    id: &Value,
    at: Option<&str>,
) -> Result<(String, Vec<SqlParam>), StoreError> {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("SELECT {} FROM {}", select_list(table), tref.sql()));
    bind_id(&mut b, schema, table, id)?;
    push_visibility(&mut b, at);
    Ok(b.finish())
}

/// UPDATE the current version's columns in place (the squash case).
pub fn squash_current(
    dialect: Dialect,
    schema: &Schema,
    table: &TableDef,
    tref: &TableRef,
    patch: &[(String, Physical)],
    id: &Value,
) -> Result<(String, Vec<SqlParam>), StoreError> {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("UPDATE {} SET ", tref.sql()));
    for (i, (column, physical)) in patch.iter().enumerate() {
        if i > 0 {
            b.push(", ");
        }
        let kind = column_param_kind(schema, table, column)?;
        b.push(&quote_ident(column));
        b.push(" = ");
        b.bind(to_param(kind, physical.clone()));
    }
    bind_id(&mut b, schema, table, id)?;
    b.push(" AND \"effectiveToCheckpoint\" = ");
    b.bind(SqlParam::Text(CHECKPOINT_LATEST.to_string()));
    Ok(b.finish())
}

/// Close the current version at `checkpoint` (the branch case, step one;
/// also the tombstone step of `delete`).
pub fn close_current(
    dialect: Dialect,
    schema: &Schema,
    table: &TableDef,
    tref: &TableRef,
    id: &Value,
    checkpoint: &str,
) -> Result<(String, Vec<SqlParam>), StoreError> {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!(
        "UPDATE {} SET \"effectiveToCheckpoint\" = ",
        tref.sql()
    ));
    b.bind(SqlParam::Text(checkpoint.to_string()));
    bind_id(&mut b, schema, table, id)?;
    b.push(" AND \"effectiveToCheckpoint\" = ");
    b.bind(SqlParam::Text(CHECKPOINT_LATEST.to_string()));
    Ok(b.finish())
}

/// DELETE a version created inside the same checkpoint (leaves no trace).
pub fn delete_created_at(
    dialect: Dialect,
    schema: &Schema,
    table: &TableDef,
    tref: &TableRef,
    id: &Value,
    checkpoint: &str,
) -> Result<(String, Vec<SqlParam>), StoreError> {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!("DELETE FROM {}", tref.sql()));
    bind_id(&mut b, schema, table, id)?;
    b.push(" AND \"effectiveFromCheckpoint\" = ");
    b.bind(SqlParam::Text(checkpoint.to_string()));
    b.push(" AND \"effectiveToCheckpoint\" = ");
    b.bind(SqlParam::Text(CHECKPOINT_LATEST.to_string()));
    Ok(b.finish())
}

/// Revert step one: drop versions written at or after the safe checkpoint.
pub fn revert_delete(dialect: Dialect, tref: &TableRef, safe: &str) -> (String, Vec<SqlParam>) {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!(
        "DELETE FROM {} WHERE \"effectiveFromCheckpoint\" >= ",
        tref.sql()
    ));
    b.bind(SqlParam::Text(safe.to_string()));
    b.finish()
}

/// Revert step two: re-open surviving versions truncated by reverted writes.
pub fn revert_reopen(dialect: Dialect, tref: &TableRef, safe: &str) -> (String, Vec<SqlParam>) {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!(
        "UPDATE {} SET \"effectiveToCheckpoint\" = ",
        tref.sql()
    ));
    b.bind(SqlParam::Text(CHECKPOINT_LATEST.to_string()));
    b.push(" WHERE \"effectiveToCheckpoint\" >= ");
    b.bind(SqlParam::Text(safe.to_string()));
    b.finish()
}

fn push_condition(
    b: &mut StatementBuilder,
    schema: &Schema,
    table: &TableDef,
    column: &str,
    condition: &Condition,
) -> Result<(), StoreError> {
    let def = table
        .column(column)
        .filter(|c| !c.kind.is_virtual())
        .ok_or_else(|| {
            StoreError::SchemaConflict(format!("unknown column '{}.{column}'", table.name))
        })?;
    let kind = column_param_kind(schema, table, column)?;
    let quoted = quote_ident(column);

    let mut bind_value = |b: &mut StatementBuilder, value: &Value| -> Result<(), StoreError> {
        let physical = encode_value(schema, def, value)?;
        b.bind(to_param(kind, physical));
        Ok(())
    };

    match condition {
        Condition::Equals(Value::Null) => {
            b.push(&format!("{quoted} IS NULL"));
        }
        Condition::Not(Value::Null) => {
            b.push(&format!("{quoted} IS NOT NULL"));
        }
        Condition::Equals(value) => {
            b.push(&format!("{quoted} = "));
            bind_value(b, value)?;
        }
        Condition::Not(value) => {
            b.push(&format!("{quoted} <> "));
            bind_value(b, value)?;
        }
        Condition::In(values) => {
            if values.is_empty() {
                b.push("1 = 0");
            } else {
                b.push(&format!("{quoted} IN ("));
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        b.push(", ");
                    }
                    bind_value(b, value)?;
                }
                b.push(")");
            }
        }
        Condition::NotIn(values) => {
            if values.is_empty() {
                b.push("1 = 1");
            } else {
                b.push(&format!("{quoted} NOT IN ("));
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        b.push(", ");
                    }
                    bind_value(b, value)?;
                }
                b.push(")");
            }
        }
        Condition::Gt(value) => {
            b.push(&format!("{quoted} > "));
            bind_value(b, value)?;
        }
        Condition::Gte(value) => {
            b.push(&format!("{quoted} >= "));
            bind_value(b, value)?;
        }
        Condition::Lt(value) => {
            b.push(&format!("{quoted} < "));
            bind_value(b, value)?;
        }
        Condition::Lte(value) => {
            b.push(&format!("{quoted} <= "));
            bind_value(b, value)?;
        }
    }
    Ok(())
}

/// SELECT the versions visible at `at` that match `filter`, ordered and
/// paged.
#[allow(clippy::too_many_arguments)]
pub fn select_many(
    dialect: Dialect,
    schema: &Schema,
    table: &TableDef,
    tref: &TableRef,
    filter: Option<&Filter>,
    order_by: Option<&OrderBy>,
    skip: Option<usize>,
    take: Option<usize>,
    at: Option<&str>,
) -> Result<(String, Vec<SqlParam>), StoreError> {
    let mut b = StatementBuilder::new(dialect);
    b.push(&format!(
        "SELECT {} FROM {} WHERE 1 = 1",
        select_list(table),
        tref.sql()
    ));
    push_visibility(&mut b, at);
    if let Some(filter) = filter {
        for (column, condition) in filter.predicates() {
            b.push(" AND ");
            push_condition(&mut b, schema, table, column, condition)?;
        }
    }

    match order_by {
        Some(order) => {
            if table
                .column(&order.column)
                .filter(|c| !c.kind.is_virtual())
                .is_none()
            {
                return Err(StoreError::SchemaConflict(format!(
                    "unknown column '{}.{}'",
                    table.name, order.column
                )));
            }
            let direction = match order.direction {
                Direction::Asc => "ASC NULLS FIRST",
                Direction::Desc => "DESC NULLS LAST",
            };
            b.push(&format!(
                " ORDER BY {} {direction}",
                quote_ident(&order.column)
            ));
        }
        // A deterministic page needs a deterministic order.
        None => {
            b.push(" ORDER BY \"id\" ASC");
        }
    }

    if let Some(take) = take {
        b.push(" LIMIT ");
        b.bind(SqlParam::Int(take as i64));
    }
    if let Some(skip) = skip {
        b.push(" OFFSET ");
        b.bind(SqlParam::Int(skip as i64));
    }
    Ok(b.finish())
}
