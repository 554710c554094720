//! User-declared entity schema: tables, columns, and enums.
//!
//! A schema is declared once per indexer run, validated up front, and then
//! carried as a first-class runtime value: every serialization step in the
//! store is a walk over these definitions. The schema also round-trips
//! through JSON because the namespace registry persists it alongside each
//! run's namespace.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Column names the store reserves for version bookkeeping.
pub const RESERVED_COLUMNS: [&str; 2] = ["effectiveFromCheckpoint", "effectiveToCheckpoint"];

/// Scalar column types exposed to handler code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Boolean,
    Int,
    Float,
    String,
    Bigint,
    Bytes,
}

impl ScalarType {
    /// Types allowed for a table's `id` column.
    pub fn valid_for_id(self) -> bool {
        matches!(self, Self::String | Self::Int | Self::Bigint | Self::Bytes)
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Boolean => "boolean",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Bigint => "bigint",
            Self::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// What a declared column is.
///
/// `One` and `Many` are virtual relation columns resolved by the external
/// read API; the store skips them entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnKind {
    Scalar {
        scalar: ScalarType,
        #[serde(default)]
        optional: bool,
        #[serde(default)]
        list: bool,
    },
    Enum {
        name: String,
        #[serde(default)]
        optional: bool,
    },
    /// Foreign key to another table's `id` column.
    Reference {
        table: String,
        #[serde(default)]
        optional: bool,
    },
    One {
        reference_column: String,
    },
    Many {
        table: String,
        column: String,
    },
}

impl ColumnKind {
    /// Returns `true` for virtual relation columns the store ignores.
    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::One { .. } | Self::Many { .. })
    }

    pub fn is_optional(&self) -> bool {
        match self {
            Self::Scalar { optional, .. }
            | Self::Enum { optional, .. }
            | Self::Reference { optional, .. } => *optional,
            Self::One { .. } | Self::Many { .. } => true,
        }
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnDef {
    pub fn scalar(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Scalar {
                scalar,
                optional: false,
                list: false,
            },
        }
    }

    pub fn optional_scalar(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Scalar {
                scalar,
                optional: true,
                list: false,
            },
        }
    }

    pub fn list(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Scalar {
                scalar,
                optional: false,
                list: true,
            },
        }
    }
}

/// A user table. Column declaration order is preserved into the DDL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The declared `id` column, if present.
    pub fn id_column(&self) -> Option<&ColumnDef> {
        self.column("id")
    }

    /// The scalar type of the `id` column.
    ///
    /// Only meaningful on a validated schema, where the column is guaranteed
    /// to exist and be a plain scalar.
    pub fn id_type(&self) -> Option<ScalarType> {
        match self.id_column()?.kind {
            ColumnKind::Scalar { scalar, .. } => Some(scalar),
            _ => None,
        }
    }

    /// Columns the store actually materializes (virtual relations skipped).
    pub fn stored_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| !c.kind.is_virtual())
    }
}

/// A named enum declared at schema scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDef {
    pub name: String,
    pub values: Vec<String>,
}

/// The full user schema for one indexer run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub enums: Vec<EnumDef>,
    pub tables: Vec<TableDef>,
}

/// Schema validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("duplicate table '{0}'")]
    DuplicateTable(String),

    #[error("duplicate column '{table}.{column}'")]
    DuplicateColumn { table: String, column: String },

    #[error("duplicate enum '{0}'")]
    DuplicateEnum(String),

    #[error("enum '{0}' declares an empty value")]
    EmptyEnumValue(String),

    #[error("enum '{name}' declares duplicate value '{value}'")]
    DuplicateEnumValue { name: String, value: String },

    #[error("column '{table}.{column}' references unknown enum '{name}'")]
    UnknownEnum {
        table: String,
        column: String,
        name: String,
    },

    #[error("column '{table}.{column}' references unknown table '{target}'")]
    UnknownReferenceTable {
        table: String,
        column: String,
        target: String,
    },

    #[error("table '{0}' has no 'id' column")]
    MissingId(String),

    #[error("table '{table}' has an invalid 'id' column: {reason}")]
    InvalidId { table: String, reason: String },

    #[error("column '{table}.{column}' collides with a reserved name")]
    ReservedColumn { table: String, column: String },
}

impl Schema {
    pub fn new(enums: Vec<EnumDef>, tables: Vec<TableDef>) -> Self {
        Self { enums, tables }
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn enum_def(&self, name: &str) -> Option<&EnumDef> {
        self.enums.iter().find(|e| e.name == name)
    }

    /// Validate the schema before any table is materialized.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (i, def) in self.enums.iter().enumerate() {
            if self.enums[..i].iter().any(|e| e.name == def.name) {
                return Err(SchemaError::DuplicateEnum(def.name.clone()));
            }
            for (j, value) in def.values.iter().enumerate() {
                if value.is_empty() {
                    return Err(SchemaError::EmptyEnumValue(def.name.clone()));
                }
                if def.values[..j].contains(value) {
                    return Err(SchemaError::DuplicateEnumValue {
                        name: def.name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }

        for (i, table) in self.tables.iter().enumerate() {
            if self.tables[..i].iter().any(|t| t.name == table.name) {
                return Err(SchemaError::DuplicateTable(table.name.clone()));
            }
            self.validate_table(table)?;
        }
        Ok(())
    }

    fn validate_table(&self, table: &TableDef) -> Result<(), SchemaError> {
        for (i, column) in table.columns.iter().enumerate() {
            if table.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(SchemaError::DuplicateColumn {
                    table: table.name.clone(),
                    column: column.name.clone(),
                });
            }
            if RESERVED_COLUMNS.contains(&column.name.as_str()) {
                return Err(SchemaError::ReservedColumn {
                    table: table.name.clone(),
                    column: column.name.clone(),
                });
            }
            match &column.kind {
                ColumnKind::Enum { name, .. } => {
                    if self.enum_def(name).is_none() {
                        return Err(SchemaError::UnknownEnum {
                            table: table.name.clone(),
                            column: column.name.clone(),
                            name: name.clone(),
                        });
                    }
                }
                ColumnKind::Reference { table: target, .. }
                | ColumnKind::Many { table: target, .. } => {
                    if self.table(target).is_none() {
                        return Err(SchemaError::UnknownReferenceTable {
                            table: table.name.clone(),
                            column: column.name.clone(),
                            target: target.clone(),
                        });
                    }
                }
                ColumnKind::Scalar { .. } | ColumnKind::One { .. } => {}
            }
        }

        let id = table
            .id_column()
            .ok_or_else(|| SchemaError::MissingId(table.name.clone()))?;
        match &id.kind {
            ColumnKind::Scalar {
                scalar,
                optional,
                list,
            } => {
                if *optional {
                    return Err(SchemaError::InvalidId {
                        table: table.name.clone(),
                        reason: "id may not be optional".into(),
                    });
                }
                if *list {
                    return Err(SchemaError::InvalidId {
                        table: table.name.clone(),
                        reason: "id may not be a list".into(),
                    });
                }
                if !scalar.valid_for_id() {
                    return Err(SchemaError::InvalidId {
                        table: table.name.clone(),
                        reason: format!("id may not have type {scalar}"),
                    });
                }
            }
            _ => {
                return Err(SchemaError::InvalidId {
                    table: table.name.clone(),
                    reason: "id must be a scalar column".into(),
                });
            }
        }
        Ok(())
    }
}
