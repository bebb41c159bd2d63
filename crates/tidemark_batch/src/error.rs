//! Error types for batch files.

use std::io;
use thiserror::Error;
use tidemark_core::TableName;

/// Result type for batch operations.
pub type BatchResult<T> = Result<T, BatchError>;

/// Errors raised while writing or reading batches.
#[derive(Debug, Error)]
pub enum BatchError {
    /// I/O error on the batch directory or a part file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// A part is unreadable or inconsistent with its metadata.
    #[error("corrupt batch part {part}: {reason}")]
    Corrupt {
        /// Part file name or description.
        part: String,
        /// What is wrong.
        reason: String,
    },

    /// Two parts claim the same index.
    #[error("batch part index {index} used more than once")]
    IndexCollision {
        /// Duplicated index.
        index: u32,
    },

    /// Part columns do not match the local table.
    #[error("schema mismatch for {table}: {reason}")]
    SchemaMismatch {
        /// Table.
        table: TableName,
        /// What differs.
        reason: String,
    },
}

impl BatchError {
    /// Creates a corruption error.
    pub fn corrupt(part: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            part: part.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the batch content cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, BatchError::Corrupt { .. } | BatchError::IndexCollision { .. })
    }
}
