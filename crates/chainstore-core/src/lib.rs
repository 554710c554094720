//! chainstore-core — foundation types for the versioned entity store.
//!
//! # Architecture
//!
//! ```text
//! Checkpoint   lex-sortable position in chain history (the store's clock)
//! Schema       user-declared tables / columns / enums, validated up front
//! Value / Row  tagged column values + schema-directed physical encoding
//! StoreError   the error taxonomy every store backend speaks
//! ```

pub mod checkpoint;
pub mod error;
pub mod schema;
pub mod value;

pub use checkpoint::{Checkpoint, CheckpointError, CHECKPOINT_LATEST, ENCODED_CHECKPOINT_LEN};
pub use error::StoreError;
pub use schema::{ColumnDef, ColumnKind, EnumDef, ScalarType, Schema, SchemaError, TableDef};
pub use value::{Physical, Row, StorageType, Value, ValueError};
