//! Error types for the hoist state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state database: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open state table: {0}")]
    Table(String),

    #[error("state storage error: {0}")]
    Storage(String),

    /// A value could not be encoded for storage.
    #[error("cannot encode {table} entry {key:?}: {source}")]
    Encode {
        table: String,
        key: String,
        source: serde_json::Error,
    },

    /// A stored value no longer decodes as its domain type, usually
    /// because the database was written by an incompatible version.
    #[error("corrupt {table} entry {key:?}: {source}")]
    Corrupt {
        table: String,
        key: String,
        source: serde_json::Error,
    },

    /// Promotion was requested for an entity the ledger has never hashed.
    #[error("no hash record for {namespace}/{key}")]
    MissingHashRecord { namespace: String, key: String },
}
