//! Error types for the sync engine.

use std::fmt;
use thiserror::Error;
use tidemark_batch::BatchError;
use tidemark_core::{CoreError, TableName};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for whole sessions.
pub type SessionResult<T> = Result<T, SessionError>;

/// Boxed error carried by selection and resolver failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The watermark store could not be read or written.
    #[error("scope metadata for {scope} unavailable: {source}")]
    ScopeUnavailable {
        /// Scope name.
        scope: String,
        /// Store failure.
        #[source]
        source: CoreError,
    },

    /// The scope is not provisioned on the peer.
    #[error("scope {scope} not found")]
    ScopeNotFound {
        /// Scope name.
        scope: String,
    },

    /// Reading changes or writing the batch failed.
    #[error("change selection failed on {}: {source}", on_table(.table))]
    SelectionFailed {
        /// Table being selected, if any.
        table: Option<TableName>,
        /// Underlying failure.
        #[source]
        source: BoxError,
    },

    /// A batch part is unreadable or inconsistent.
    #[error("corrupt batch part {part}: {reason}")]
    BatchCorrupt {
        /// Part description.
        part: String,
        /// What is wrong.
        reason: String,
    },

    /// An interceptor or a conflict resolution asked for a rollback.
    #[error("rollback requested on {}: {reason}", on_table(.table))]
    RollbackRequested {
        /// Table being processed, if any.
        table: Option<TableName>,
        /// Reason given.
        reason: String,
    },

    /// A table of the scope does not exist or does not match.
    #[error("missing schema for {table}: {reason}")]
    MissingSchema {
        /// Table.
        table: TableName,
        /// What is missing.
        reason: String,
    },

    /// A row could not be written and the error policy is `Throw`.
    #[error("apply failed on {table}: {source}")]
    ApplyFailed {
        /// Table.
        table: TableName,
        /// Store failure.
        #[source]
        source: CoreError,
    },

    /// The session was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Another session for the same client and scope is running.
    #[error("a session for scope {scope} is already in progress")]
    SessionInProgress {
        /// Scope name.
        scope: String,
    },

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote peer failed its part of the session.
    #[error("remote failure: {0}")]
    Remote(Box<SessionError>),

    /// Batch I/O failure outside of selection.
    #[error("batch error: {0}")]
    Batch(BatchError),

    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] CoreError),
}

fn on_table(table: &Option<TableName>) -> String {
    match table {
        Some(table) => table.to_string(),
        None => "batch".to_string(),
    }
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a selection failure.
    pub fn selection_failed(table: Option<&TableName>, source: impl Into<BoxError>) -> Self {
        Self::SelectionFailed {
            table: table.cloned(),
            source: source.into(),
        }
    }

    /// Creates a rollback request.
    pub fn rollback(table: Option<&TableName>, reason: impl Into<String>) -> Self {
        Self::RollbackRequested {
            table: table.cloned(),
            reason: reason.into(),
        }
    }

    /// Creates a missing schema error.
    pub fn missing_schema(table: &TableName, reason: impl Into<String>) -> Self {
        Self::MissingSchema {
            table: table.clone(),
            reason: reason.into(),
        }
    }

    /// Wraps a watermark store failure.
    pub fn scope_unavailable(scope: &str, source: CoreError) -> Self {
        Self::ScopeUnavailable {
            scope: scope.to_string(),
            source,
        }
    }

    /// Maps a batch error read back during apply.
    pub fn from_batch(err: BatchError) -> Self {
        match err {
            BatchError::Corrupt { part, reason } => Self::BatchCorrupt { part, reason },
            BatchError::IndexCollision { index } => Self::BatchCorrupt {
                part: format!("index {index}"),
                reason: "index used by more than one part".into(),
            },
            BatchError::SchemaMismatch { table, reason } => Self::MissingSchema { table, reason },
            other => Self::Batch(other),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::ScopeUnavailable { source, .. } => source.is_unavailable(),
            SyncError::Remote(inner) => inner.source.is_retryable(),
            SyncError::Store(source) => source.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the session ended on a rollback request, here or remotely.
    pub fn is_rollback(&self) -> bool {
        match self {
            SyncError::RollbackRequested { .. } => true,
            SyncError::Remote(inner) => inner.source.is_rollback(),
            _ => false,
        }
    }

    /// Returns true if the session was cancelled.
    pub fn is_cancelled(&self) -> bool {
        match self {
            SyncError::Cancelled => true,
            SyncError::Remote(inner) => inner.source.is_cancelled(),
            _ => false,
        }
    }

    /// Table named by the error, if any.
    pub fn table(&self) -> Option<&TableName> {
        match self {
            SyncError::SelectionFailed { table, .. } | SyncError::RollbackRequested { table, .. } => {
                table.as_ref()
            }
            SyncError::MissingSchema { table, .. } | SyncError::ApplyFailed { table, .. } => {
                Some(table)
            }
            _ => None,
        }
    }
}

/// Session stage at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Loading or provisioning scope metadata.
    ScopeLoading,
    /// Capturing the local timestamp.
    TimestampCapture,
    /// Selecting local changes.
    ChangesSelecting,
    /// Exchanging batches with the remote peer.
    ChangesUploading,
    /// Applying a received batch.
    ChangesApplying,
    /// Persisting watermarks.
    ScopeSaving,
    /// Counting pending changes.
    ChangesEstimating,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::ScopeLoading => "scope loading",
            SyncStage::TimestampCapture => "timestamp capture",
            SyncStage::ChangesSelecting => "changes selecting",
            SyncStage::ChangesUploading => "changes uploading",
            SyncStage::ChangesApplying => "changes applying",
            SyncStage::ScopeSaving => "scope saving",
            SyncStage::ChangesEstimating => "changes estimating",
        };
        f.write_str(name)
    }
}

/// A failed session: the stage, the table involved and the cause.
#[derive(Error, Debug)]
#[error("sync failed during {stage}{}: {source}", table_suffix(.table))]
pub struct SessionError {
    /// Stage that failed.
    pub stage: SyncStage,
    /// Table being processed, if any.
    pub table: Option<TableName>,
    /// Cause.
    #[source]
    pub source: SyncError,
}

fn table_suffix(table: &Option<TableName>) -> String {
    match table {
        Some(table) => format!(" ({table})"),
        None => String::new(),
    }
}

impl SessionError {
    /// Wraps an error raised during a stage.
    pub fn new(stage: SyncStage, source: SyncError) -> Self {
        Self {
            stage,
            table: source.table().cloned(),
            source,
        }
    }

    /// Returns true if the session ended on a rollback request.
    pub fn is_rollback(&self) -> bool {
        self.source.is_rollback()
    }

    /// Returns true if the session was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }

    /// Returns true if the failed stage can be retried.
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

/// Attaches a stage to a [`SyncResult`].
pub(crate) trait StageExt<T> {
    fn at(self, stage: SyncStage) -> SessionResult<T>;
}

impl<T> StageExt<T> for SyncResult<T> {
    fn at(self, stage: SyncStage) -> SessionResult<T> {
        self.map_err(|e| SessionError::new(stage, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::scope_unavailable("default", CoreError::Unavailable("down".into()))
            .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn rollback_is_seen_through_remote() {
        let remote = SessionError::new(
            SyncStage::ChangesApplying,
            SyncError::rollback(Some(&TableName::new("Customer")), "conflict"),
        );
        assert_eq!(remote.table, Some(TableName::new("Customer")));
        let err = SyncError::Remote(Box::new(remote));
        assert!(err.is_rollback());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn batch_errors_are_classified() {
        assert!(matches!(
            SyncError::from_batch(BatchError::corrupt("Orders_0001_DELETED.batch", "truncated")),
            SyncError::BatchCorrupt { .. }
        ));
        assert!(matches!(
            SyncError::from_batch(BatchError::IndexCollision { index: 2 }),
            SyncError::BatchCorrupt { .. }
        ));
        assert!(matches!(
            SyncError::from_batch(BatchError::SchemaMismatch {
                table: TableName::new("Customer"),
                reason: "columns".into()
            }),
            SyncError::MissingSchema { .. }
        ));
    }

    #[test]
    fn error_display() {
        let err = SessionError::new(
            SyncStage::ChangesSelecting,
            SyncError::selection_failed(Some(&TableName::new("Orders")), CoreError::Unavailable("offline".into())),
        );
        let text = err.to_string();
        assert!(text.starts_with("sync failed during changes selecting (Orders)"));
        assert!(text.contains("offline"));

        assert_eq!(
            SyncError::rollback(None, "user abort").to_string(),
            "rollback requested on batch: user abort"
        );
    }
}
