//! Row values and the schema-directed physical encoding.
//!
//! Handler code sees rows as maps from column name to a tagged [`Value`].
//! The store persists three physical shapes only (NULL, integer, text);
//! the mapping between the two is a walk over the declared schema:
//! booleans become 0/1 integers, floats and bigints become text, lists
//! become JSON text, and `bytes` values are lowercased so equality is
//! case-insensitive everywhere.

use std::collections::BTreeMap;

use num_bigint::BigInt;
use serde_json::json;
use thiserror::Error;

use crate::schema::{ColumnDef, ColumnKind, ScalarType, Schema, TableDef};

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bigint(BigInt),
    /// Hex-encoded byte string (`"0x…"`). Compared case-insensitively.
    Bytes(String),
    List(Vec<Value>),
}

impl Value {
    pub fn bigint(n: impl Into<BigInt>) -> Self {
        Self::Bigint(n.into())
    }

    pub fn bytes(hex: impl Into<String>) -> Self {
        Self::Bytes(hex.into())
    }

    /// Human-readable tag for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bigint(_) => "bigint",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Self::Bigint(v)
    }
}

/// A user row keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// The three shapes a value takes in the database.
#[derive(Debug, Clone, PartialEq)]
pub enum Physical {
    Null,
    Int(i64),
    Text(String),
}

/// Failures while walking a row against its schema.
#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    #[error("unknown column '{table}.{column}'")]
    UnknownColumn { table: String, column: String },

    #[error("column '{column}' expects {expected}, got {got}")]
    TypeMismatch {
        column: String,
        expected: String,
        got: &'static str,
    },

    #[error("column '{column}' holds unreadable stored data: {detail}")]
    Corrupt { column: String, detail: String },
}

fn mismatch(column: &str, expected: impl Into<String>, got: &Value) -> ValueError {
    ValueError::TypeMismatch {
        column: column.to_string(),
        expected: expected.into(),
        got: got.kind_name(),
    }
}

/// Resolve the scalar type a column stores, following references to the
/// target table's `id` type. Returns `None` for virtual columns.
fn storage_scalar(schema: &Schema, column: &ColumnDef) -> Option<StorageType> {
    match &column.kind {
        ColumnKind::Scalar { scalar, list, .. } => Some(if *list {
            StorageType::List(*scalar)
        } else {
            StorageType::Scalar(*scalar)
        }),
        ColumnKind::Enum { .. } => Some(StorageType::Enum),
        ColumnKind::Reference { table, .. } => {
            let target = schema.table(table)?;
            Some(StorageType::Scalar(target.id_type()?))
        }
        ColumnKind::One { .. } | ColumnKind::Many { .. } => None,
    }
}

/// The shape a stored (non-virtual) column takes, with references resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StorageType {
    Scalar(ScalarType),
    List(ScalarType),
    Enum,
}

impl StorageType {
    /// Resolve a column's storage type against the schema. Virtual columns
    /// and references to unvalidated tables resolve to `None`.
    pub fn of(schema: &Schema, column: &ColumnDef) -> Option<Self> {
        storage_scalar(schema, column)
    }
}

/// Encode one value for a column. `Null` passes through; whether it is
/// legal there is the NOT NULL constraint's call.
pub fn encode_value(
    schema: &Schema,
    column: &ColumnDef,
    value: &Value,
) -> Result<Physical, ValueError> {
    let storage = storage_scalar(schema, column).ok_or_else(|| ValueError::Corrupt {
        column: column.name.clone(),
        detail: "virtual column has no storage form".into(),
    })?;

    if matches!(value, Value::Null) {
        return Ok(Physical::Null);
    }

    match storage {
        StorageType::Scalar(scalar) => encode_scalar(&column.name, scalar, value),
        StorageType::Enum => match value {
            Value::String(s) => Ok(Physical::Text(s.clone())),
            other => Err(mismatch(&column.name, "enum value", other)),
        },
        StorageType::List(scalar) => match value {
            Value::List(items) => {
                let encoded = items
                    .iter()
                    .map(|item| scalar_to_json(&column.name, scalar, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Physical::Text(
                    serde_json::Value::Array(encoded).to_string(),
                ))
            }
            other => Err(mismatch(&column.name, format!("list of {scalar}"), other)),
        },
    }
}

fn encode_scalar(column: &str, scalar: ScalarType, value: &Value) -> Result<Physical, ValueError> {
    match (scalar, value) {
        (ScalarType::Boolean, Value::Boolean(b)) => Ok(Physical::Int(i64::from(*b))),
        (ScalarType::Int, Value::Int(i)) => Ok(Physical::Int(*i)),
        (ScalarType::Float, Value::Float(f)) => Ok(Physical::Text(f.to_string())),
        (ScalarType::String, Value::String(s)) => Ok(Physical::Text(s.clone())),
        (ScalarType::Bigint, Value::Bigint(b)) => Ok(Physical::Text(b.to_string())),
        (ScalarType::Bytes, Value::Bytes(s)) => Ok(Physical::Text(s.to_lowercase())),
        (expected, other) => Err(mismatch(column, expected.to_string(), other)),
    }
}

fn scalar_to_json(
    column: &str,
    scalar: ScalarType,
    value: &Value,
) -> Result<serde_json::Value, ValueError> {
    match (scalar, value) {
        (ScalarType::Boolean, Value::Boolean(b)) => Ok(json!(b)),
        (ScalarType::Int, Value::Int(i)) => Ok(json!(i)),
        (ScalarType::Float, Value::Float(f)) => {
            serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| ValueError::Corrupt {
                    column: column.to_string(),
                    detail: format!("float {f} has no JSON form"),
                })
        }
        (ScalarType::String, Value::String(s)) => Ok(json!(s)),
        (ScalarType::Bigint, Value::Bigint(b)) => Ok(json!(b.to_string())),
        (ScalarType::Bytes, Value::Bytes(s)) => Ok(json!(s.to_lowercase())),
        (expected, other) => Err(mismatch(column, expected.to_string(), other)),
    }
}

/// Decode one stored value back to its tagged form.
pub fn decode_value(
    schema: &Schema,
    column: &ColumnDef,
    physical: Physical,
) -> Result<Value, ValueError> {
    let storage = storage_scalar(schema, column).ok_or_else(|| ValueError::Corrupt {
        column: column.name.clone(),
        detail: "virtual column has no storage form".into(),
    })?;

    if matches!(physical, Physical::Null) {
        return Ok(Value::Null);
    }

    match storage {
        StorageType::Scalar(scalar) => decode_scalar(&column.name, scalar, physical),
        StorageType::Enum => match physical {
            Physical::Text(s) => Ok(Value::String(s)),
            other => Err(corrupt_shape(&column.name, &other)),
        },
        StorageType::List(scalar) => match physical {
            Physical::Text(s) => {
                let parsed: serde_json::Value =
                    serde_json::from_str(&s).map_err(|e| ValueError::Corrupt {
                        column: column.name.clone(),
                        detail: e.to_string(),
                    })?;
                let items = parsed.as_array().ok_or_else(|| ValueError::Corrupt {
                    column: column.name.clone(),
                    detail: "list column does not hold a JSON array".into(),
                })?;
                let decoded = items
                    .iter()
                    .map(|item| scalar_from_json(&column.name, scalar, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List(decoded))
            }
            other => Err(corrupt_shape(&column.name, &other)),
        },
    }
}

fn decode_scalar(column: &str, scalar: ScalarType, physical: Physical) -> Result<Value, ValueError> {
    match (scalar, physical) {
        (ScalarType::Boolean, Physical::Int(i)) => Ok(Value::Boolean(i != 0)),
        (ScalarType::Int, Physical::Int(i)) => Ok(Value::Int(i)),
        (ScalarType::Float, Physical::Text(s)) => {
            s.parse::<f64>().map(Value::Float).map_err(|e| ValueError::Corrupt {
                column: column.to_string(),
                detail: e.to_string(),
            })
        }
        (ScalarType::String, Physical::Text(s)) => Ok(Value::String(s)),
        (ScalarType::Bigint, Physical::Text(s)) => {
            s.parse::<BigInt>().map(Value::Bigint).map_err(|e| ValueError::Corrupt {
                column: column.to_string(),
                detail: e.to_string(),
            })
        }
        (ScalarType::Bytes, Physical::Text(s)) => Ok(Value::Bytes(s)),
        (_, other) => Err(corrupt_shape(column, &other)),
    }
}

fn scalar_from_json(
    column: &str,
    scalar: ScalarType,
    value: &serde_json::Value,
) -> Result<Value, ValueError> {
    let bad = || ValueError::Corrupt {
        column: column.to_string(),
        detail: format!("list element {value} does not decode as {scalar}"),
    };
    match scalar {
        ScalarType::Boolean => value.as_bool().map(Value::Boolean).ok_or_else(bad),
        ScalarType::Int => value.as_i64().map(Value::Int).ok_or_else(bad),
        ScalarType::Float => value.as_f64().map(Value::Float).ok_or_else(bad),
        ScalarType::String => value
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(bad),
        ScalarType::Bigint => value
            .as_str()
            .and_then(|s| s.parse::<BigInt>().ok())
            .map(Value::Bigint)
            .ok_or_else(bad),
        ScalarType::Bytes => value
            .as_str()
            .map(|s| Value::Bytes(s.to_string()))
            .ok_or_else(bad),
    }
}

fn corrupt_shape(column: &str, physical: &Physical) -> ValueError {
    ValueError::Corrupt {
        column: column.to_string(),
        detail: format!("unexpected stored shape {physical:?}"),
    }
}

/// Encode a full row for insertion, in stored-column order.
///
/// Columns absent from the row encode as NULL; keys that name no stored
/// column are rejected.
pub fn encode_row(
    schema: &Schema,
    table: &TableDef,
    row: &Row,
) -> Result<Vec<(String, Physical)>, ValueError> {
    for key in row.keys() {
        match table.column(key) {
            Some(column) if !column.kind.is_virtual() => {}
            _ => {
                return Err(ValueError::UnknownColumn {
                    table: table.name.clone(),
                    column: key.clone(),
                })
            }
        }
    }

    table
        .stored_columns()
        .map(|column| {
            let physical = match row.get(&column.name) {
                Some(value) => encode_value(schema, column, value)?,
                None => Physical::Null,
            };
            Ok((column.name.clone(), physical))
        })
        .collect()
}

/// Encode an id parameter with the table's `id` column rules (in particular
/// the lowercase normalization of `bytes` ids).
pub fn encode_id(schema: &Schema, table: &TableDef, id: &Value) -> Result<Physical, ValueError> {
    let column = table.id_column().ok_or_else(|| ValueError::UnknownColumn {
        table: table.name.clone(),
        column: "id".into(),
    })?;
    encode_value(schema, column, id)
}

/// Round-trip a row through its physical form, yielding the canonical shape
/// a read would return: every stored column present, absent columns as
/// `Null`, `bytes` lowercased.
pub fn canonicalize_row(
    schema: &Schema,
    table: &TableDef,
    row: &Row,
) -> Result<Row, ValueError> {
    let encoded = encode_row(schema, table, row)?;
    let mut canonical = Row::new();
    for (name, physical) in encoded {
        let column = table.column(&name).ok_or_else(|| ValueError::UnknownColumn {
            table: table.name.clone(),
            column: name.clone(),
        })?;
        canonical.insert(name, decode_value(schema, column, physical)?);
    }
    Ok(canonical)
}

/// Merge a patch over a base row: patched keys win, everything else carries.
pub fn merge_patch(base: &Row, patch: &Row) -> Row {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, EnumDef, ScalarType, Schema, TableDef};

    fn schema() -> Schema {
        Schema::new(
            vec![EnumDef {
                name: "Color".into(),
                values: vec!["red".into(), "green".into()],
            }],
            vec![TableDef::new(
                "Token",
                vec![
                    ColumnDef::scalar("id", ScalarType::Bytes),
                    ColumnDef::scalar("supply", ScalarType::Bigint),
                    ColumnDef::scalar("active", ScalarType::Boolean),
                    ColumnDef::optional_scalar("price", ScalarType::Float),
                    ColumnDef::list("holders", ScalarType::Bigint),
                    ColumnDef {
                        name: "color".into(),
                        kind: ColumnKind::Enum {
                            name: "Color".into(),
                            optional: true,
                        },
                    },
                ],
            )],
        )
    }

    fn col<'a>(schema: &'a Schema, name: &str) -> &'a ColumnDef {
        schema.table("Token").unwrap().column(name).unwrap()
    }

    #[test]
    fn booleans_store_as_integers() {
        let s = schema();
        let enc = encode_value(&s, col(&s, "active"), &Value::Boolean(true)).unwrap();
        assert_eq!(enc, Physical::Int(1));
        let back = decode_value(&s, col(&s, "active"), enc).unwrap();
        assert_eq!(back, Value::Boolean(true));
    }

    #[test]
    fn bigints_round_trip_past_u64() {
        let s = schema();
        let big: BigInt = "340282366920938463463374607431768211456".parse().unwrap();
        let enc = encode_value(&s, col(&s, "supply"), &Value::Bigint(big.clone())).unwrap();
        assert_eq!(
            enc,
            Physical::Text("340282366920938463463374607431768211456".into())
        );
        let back = decode_value(&s, col(&s, "supply"), enc).unwrap();
        assert_eq!(back, Value::Bigint(big));
    }

    #[test]
    fn bytes_lowercase_at_encode() {
        let s = schema();
        let enc = encode_value(&s, col(&s, "id"), &Value::bytes("0xABcD")).unwrap();
        assert_eq!(enc, Physical::Text("0xabcd".into()));
    }

    #[test]
    fn bigint_lists_rehydrate_element_wise() {
        let s = schema();
        let list = Value::List(vec![Value::bigint(1), Value::bigint(2_000_000_000_000i64)]);
        let enc = encode_value(&s, col(&s, "holders"), &list).unwrap();
        assert_eq!(enc, Physical::Text(r#"["1","2000000000000"]"#.into()));
        let back = decode_value(&s, col(&s, "holders"), enc).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn type_mismatch_is_reported() {
        let s = schema();
        let err = encode_value(&s, col(&s, "supply"), &Value::Int(5)).unwrap_err();
        assert!(matches!(err, ValueError::TypeMismatch { .. }));
    }

    #[test]
    fn unknown_row_key_is_rejected() {
        let s = schema();
        let table = s.table("Token").unwrap();
        let mut row = Row::new();
        row.insert("id".into(), Value::bytes("0x1"));
        row.insert("nope".into(), Value::Int(1));
        let err = encode_row(&s, table, &row).unwrap_err();
        assert!(matches!(err, ValueError::UnknownColumn { .. }));
    }

    #[test]
    fn missing_columns_encode_as_null() {
        let s = schema();
        let table = s.table("Token").unwrap();
        let mut row = Row::new();
        row.insert("id".into(), Value::bytes("0x1"));
        let encoded = encode_row(&s, table, &row).unwrap();
        let price = encoded.iter().find(|(name, _)| name == "price").unwrap();
        assert_eq!(price.1, Physical::Null);
    }

    #[test]
    fn merge_patch_overwrites_only_patched_keys() {
        let mut base = Row::new();
        base.insert("supply".into(), Value::bigint(1));
        base.insert("active".into(), Value::Boolean(false));
        let mut patch = Row::new();
        patch.insert("supply".into(), Value::bigint(2));
        let merged = merge_patch(&base, &patch);
        assert_eq!(merged["supply"], Value::bigint(2));
        assert_eq!(merged["active"], Value::Boolean(false));
    }
}
