//! Session event hooks.
//!
//! Handlers are registered per [`EventKind`] and called synchronously,
//! in registration order, at fixed points of selection and apply. A
//! handler observes the payload and answers with a [`Flow`]; any
//! [`Flow::Rollback`] aborts the current operation once every handler
//! for the event has run.

use crate::conflict::{SyncConflict, SyncSide};
use crate::error::{SyncError, SyncResult, SyncStage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tidemark_batch::{BatchInfo, PartClosed};
use tidemark_core::{
    DatabaseChangesApplied, DatabaseChangesSelected, DbCommand, RowState, SyncRow,
    TableChangesApplied, TableChangesSelected, TableName,
};
use tracing::debug;

/// Interceptable points of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A session starts.
    SessionBegin,
    /// A session ends, successfully or not.
    SessionEnd,
    /// A table scan is about to start.
    TableChangesSelecting,
    /// A row was read from a table scan.
    RowSelected,
    /// A batch part reached its size bound and was closed.
    BatchPartWritten,
    /// A table scan completed.
    TableChangesSelected,
    /// Every table scan completed and the batch is finalized.
    DatabaseChangesSelected,
    /// A batch is about to be applied.
    DatabaseChangesApplying,
    /// Parts of one table and state are about to be applied.
    TableChangesApplying,
    /// A conflict was detected, before resolution.
    ConflictOccurred,
    /// Parts of one table and state were applied.
    TableChangesApplied,
    /// A batch was applied, before the final commit.
    DatabaseChangesApplied,
    /// Progress report. The returned flow is ignored.
    Progress,
}

/// Progress of a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressArgs {
    /// Reporting side.
    pub side: SyncSide,
    /// Stage in progress.
    pub stage: SyncStage,
    /// Units done.
    pub completed: usize,
    /// Units expected.
    pub total: usize,
    /// Short description.
    pub message: String,
}

impl ProgressArgs {
    /// Completion ratio between 0 and 1.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

/// Payload handed to handlers.
#[derive(Debug, Clone, Copy)]
pub enum SyncEvent<'a> {
    /// See [`EventKind::SessionBegin`].
    SessionBegin {
        /// Scope name.
        scope: &'a str,
        /// Side running the session.
        side: SyncSide,
    },
    /// See [`EventKind::SessionEnd`].
    SessionEnd {
        /// Scope name.
        scope: &'a str,
        /// Side running the session.
        side: SyncSide,
        /// True if the session succeeded.
        succeeded: bool,
    },
    /// See [`EventKind::TableChangesSelecting`].
    TableChangesSelecting {
        /// Table.
        table: &'a TableName,
        /// Selection command about to run.
        command: &'a DbCommand,
    },
    /// See [`EventKind::RowSelected`].
    RowSelected {
        /// Table.
        table: &'a TableName,
        /// Selected row.
        row: &'a SyncRow,
    },
    /// See [`EventKind::BatchPartWritten`].
    BatchPartWritten {
        /// Closed part.
        part: &'a PartClosed,
    },
    /// See [`EventKind::TableChangesSelected`].
    TableChangesSelected {
        /// Counters of the table.
        changes: &'a TableChangesSelected,
    },
    /// See [`EventKind::DatabaseChangesSelected`].
    DatabaseChangesSelected {
        /// Finalized batch.
        batch: &'a BatchInfo,
        /// Counters of every table.
        changes: &'a DatabaseChangesSelected,
    },
    /// See [`EventKind::DatabaseChangesApplying`].
    DatabaseChangesApplying {
        /// Batch about to be applied.
        batch: &'a BatchInfo,
    },
    /// See [`EventKind::TableChangesApplying`].
    TableChangesApplying {
        /// Table.
        table: &'a TableName,
        /// Row state of the parts.
        state: RowState,
    },
    /// See [`EventKind::ConflictOccurred`].
    ConflictOccurred {
        /// Detected conflict.
        conflict: &'a SyncConflict,
    },
    /// See [`EventKind::TableChangesApplied`].
    TableChangesApplied {
        /// Counters of the table and state.
        changes: &'a TableChangesApplied,
    },
    /// See [`EventKind::DatabaseChangesApplied`].
    DatabaseChangesApplied {
        /// Counters of the whole apply.
        changes: &'a DatabaseChangesApplied,
    },
    /// See [`EventKind::Progress`].
    Progress(&'a ProgressArgs),
}

impl SyncEvent<'_> {
    /// Kind of the event.
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::SessionBegin { .. } => EventKind::SessionBegin,
            SyncEvent::SessionEnd { .. } => EventKind::SessionEnd,
            SyncEvent::TableChangesSelecting { .. } => EventKind::TableChangesSelecting,
            SyncEvent::RowSelected { .. } => EventKind::RowSelected,
            SyncEvent::BatchPartWritten { .. } => EventKind::BatchPartWritten,
            SyncEvent::TableChangesSelected { .. } => EventKind::TableChangesSelected,
            SyncEvent::DatabaseChangesSelected { .. } => EventKind::DatabaseChangesSelected,
            SyncEvent::DatabaseChangesApplying { .. } => EventKind::DatabaseChangesApplying,
            SyncEvent::TableChangesApplying { .. } => EventKind::TableChangesApplying,
            SyncEvent::ConflictOccurred { .. } => EventKind::ConflictOccurred,
            SyncEvent::TableChangesApplied { .. } => EventKind::TableChangesApplied,
            SyncEvent::DatabaseChangesApplied { .. } => EventKind::DatabaseChangesApplied,
            SyncEvent::Progress(_) => EventKind::Progress,
        }
    }
}

/// Handler answer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Flow {
    /// Keep going.
    #[default]
    Continue,
    /// Abort and roll back the current operation.
    Rollback(String),
}

type Handler = Arc<dyn Fn(&SyncEvent<'_>) -> Flow + Send + Sync>;

/// Registry of event handlers.
///
/// Cloning shares the registry.
#[derive(Clone, Default)]
pub struct Interceptors {
    handlers: Arc<RwLock<HashMap<EventKind, Vec<Handler>>>>,
}

impl Interceptors {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for an event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&SyncEvent<'_>) -> Flow + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Removes every handler of an event kind.
    pub fn clear(&self, kind: EventKind) {
        self.handlers.write().remove(&kind);
    }

    /// Returns true if a handler is registered for the kind.
    pub fn has(&self, kind: EventKind) -> bool {
        self.handlers
            .read()
            .get(&kind)
            .is_some_and(|handlers| !handlers.is_empty())
    }

    /// Runs every handler of the event's kind.
    ///
    /// Returns the first rollback request, if any.
    pub fn notify(&self, event: &SyncEvent<'_>) -> Flow {
        let handlers: Vec<Handler> = match self.handlers.read().get(&event.kind()) {
            Some(handlers) => handlers.clone(),
            None => return Flow::Continue,
        };
        let mut flow = Flow::Continue;
        for handler in handlers {
            if let Flow::Rollback(reason) = handler(event) {
                if flow == Flow::Continue {
                    flow = Flow::Rollback(reason);
                }
            }
        }
        if event.kind() == EventKind::Progress {
            return Flow::Continue;
        }
        flow
    }

    /// Notifies and turns a rollback request into an error.
    pub(crate) fn check(&self, event: &SyncEvent<'_>, table: Option<&TableName>) -> SyncResult<()> {
        match self.notify(event) {
            Flow::Continue => Ok(()),
            Flow::Rollback(reason) => {
                debug!(event = ?event.kind(), %reason, "interceptor requested rollback");
                Err(SyncError::rollback(table, reason))
            }
        }
    }
}

impl std::fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        let mut kinds: Vec<String> = handlers
            .iter()
            .map(|(kind, list)| format!("{kind:?}x{}", list.len()))
            .collect();
        kinds.sort();
        f.debug_struct("Interceptors").field("handlers", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handlers_run_in_order() {
        let interceptors = Interceptors::new();
        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..3 {
            let calls = Arc::clone(&calls);
            interceptors.on(EventKind::SessionBegin, move |_| {
                calls.lock().push(i);
                Flow::Continue
            });
        }
        let flow = interceptors.notify(&SyncEvent::SessionBegin {
            scope: "default",
            side: SyncSide::Client,
        });
        assert_eq!(flow, Flow::Continue);
        assert_eq!(*calls.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn first_rollback_wins_and_every_handler_runs() {
        let interceptors = Interceptors::new();
        let count = Arc::new(AtomicUsize::new(0));
        for reason in ["first", "second"] {
            let count = Arc::clone(&count);
            interceptors.on(EventKind::TableChangesApplying, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Flow::Rollback(reason.to_string())
            });
        }
        let table = TableName::new("Customer");
        let err = interceptors
            .check(
                &SyncEvent::TableChangesApplying {
                    table: &table,
                    state: RowState::Modified,
                },
                Some(&table),
            )
            .unwrap_err();
        assert!(err.is_rollback());
        assert!(err.to_string().contains("first"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn progress_flow_is_ignored() {
        let interceptors = Interceptors::new();
        interceptors.on(EventKind::Progress, |_| Flow::Rollback("ignored".into()));
        let args = ProgressArgs {
            side: SyncSide::Server,
            stage: SyncStage::ChangesSelecting,
            completed: 1,
            total: 4,
            message: "Customer".into(),
        };
        assert_eq!(interceptors.notify(&SyncEvent::Progress(&args)), Flow::Continue);
        assert!((args.ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn clear_and_has() {
        let interceptors = Interceptors::new();
        assert!(!interceptors.has(EventKind::RowSelected));
        interceptors.on(EventKind::RowSelected, |_| Flow::Continue);
        assert!(interceptors.has(EventKind::RowSelected));
        let shared = interceptors.clone();
        shared.clear(EventKind::RowSelected);
        assert!(!interceptors.has(EventKind::RowSelected));
    }
}
