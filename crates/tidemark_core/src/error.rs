//! Error types for Tidemark core.

use crate::schema::TableName;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the data model and by store implementations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The store cannot be reached or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Table is not known to the store.
    #[error("table not found: {table}")]
    TableNotFound {
        /// The missing table.
        table: TableName,
    },

    /// Table already exists in the store.
    #[error("table already exists: {table}")]
    TableExists {
        /// The duplicated table.
        table: TableName,
    },

    /// A row does not have the column shape its table declares.
    #[error("row shape mismatch for {table}: expected {expected} columns, got {actual}")]
    ColumnMismatch {
        /// Table the row belongs to.
        table: TableName,
        /// Declared column count.
        expected: usize,
        /// Column count found in the row.
        actual: usize,
    },

    /// A unique column would hold the same value twice.
    #[error("unique constraint violated on {table}.{column}")]
    UniqueConstraint {
        /// Table holding the constraint.
        table: TableName,
        /// Constrained column.
        column: String,
    },

    /// A row changed in the store after a transaction staged a write to it.
    #[error("write conflict on {table} row {key}: changed since it was staged")]
    WriteConflict {
        /// Table of the row.
        table: TableName,
        /// Primary key of the row.
        key: String,
    },

    /// A filtered selection is missing a parameter value.
    #[error("missing value for filter parameter {parameter} on {table}")]
    MissingFilterParameter {
        /// Filtered table.
        table: TableName,
        /// Parameter name.
        parameter: String,
    },

    /// A command was executed without a required parameter.
    #[error("command {command} is missing parameter {parameter}")]
    MissingParameter {
        /// Command name.
        command: String,
        /// Parameter name.
        parameter: String,
    },

    /// The command kind cannot be executed through this entry point.
    #[error("unsupported command {command}: {reason}")]
    UnsupportedCommand {
        /// Command name.
        command: String,
        /// Why it was refused.
        reason: String,
    },

    /// Table relations form a cycle.
    #[error("relations form a cycle between tables: {tables}")]
    CyclicRelations {
        /// Tables left unordered, comma separated.
        tables: String,
    },

    /// Schema declaration is inconsistent.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the problem.
        message: String,
    },

    /// A watermark write would move a timestamp backwards.
    #[error("watermark regression for scope {scope}: {current} -> {proposed}")]
    WatermarkRegression {
        /// Scope name.
        scope: String,
        /// Stored timestamp.
        current: i64,
        /// Rejected timestamp.
        proposed: i64,
    },

    /// Transaction was already finished.
    #[error("transaction already completed")]
    TransactionCompleted,

    /// Any other store failure.
    #[error("store error: {0}")]
    Other(String),
}

impl CoreError {
    /// Creates an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Returns true if the error is a uniqueness violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, CoreError::UniqueConstraint { .. })
    }

    /// Returns true if the store itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CoreError::Unavailable(_))
    }

    /// Returns true if the same call may succeed when tried again.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Unavailable(_) | CoreError::WriteConflict { .. })
    }
}
