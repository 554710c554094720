//! Error taxonomy for the entity store.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::value::ValueError;

/// Errors surfaced by entity-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `update`/`delete` targeted a row with no current version.
    #[error("no current version of '{table}' id {id}")]
    NotFound { table: String, id: String },

    /// `create` targeted an id that already has a current version.
    #[error("'{table}' id {id} already has a current version")]
    AlreadyExists { table: String, id: String },

    /// A write arrived with a checkpoint older than the row's current
    /// version. The caller's checkpoint sequence is non-monotonic; the
    /// indexing run cannot continue.
    #[error(
        "write to '{table}' id {id} at checkpoint {checkpoint} precedes the \
         current version (effective from {latest_from})"
    )]
    PastWrite {
        table: String,
        id: String,
        checkpoint: String,
        latest_from: String,
    },

    /// Constraint or shape violation: enum check failed, NOT NULL violated,
    /// or an unknown column appeared. Surfaced to handler code verbatim.
    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("page size {take} exceeds the configured maximum {max}")]
    PageSizeExceeded { take: usize, max: usize },

    /// The namespace registry reports no namespaces but versioned tables
    /// exist. Fatal.
    #[error("namespace registry is empty but versioned tables exist")]
    NamespaceCorruption,

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("database error: {0}")]
    Database(String),
}

impl From<ValueError> for StoreError {
    fn from(err: ValueError) -> Self {
        Self::SchemaConflict(err.to_string())
    }
}

impl StoreError {
    /// Returns `true` when the indexing run must stop rather than skip the
    /// failing operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PastWrite { .. } | Self::NamespaceCorruption)
    }
}
