//! Store collaborator traits.
//!
//! The sync engine never talks to a database directly. It asks a
//! [`ChangeStore`] for parameterized [`DbCommand`]s, executes them, and
//! persists watermarks through a [`ScopeStore`]. Any engine able to
//! track per-row change timestamps, last writers and tombstones can
//! implement these traits.

use crate::error::{CoreError, CoreResult};
use crate::row::SyncRow;
use crate::schema::{FilterClause, SyncFilter, SyncTable, TableName};
use crate::scope::{ScopeInfoClient, SyncScope};
use crate::value::SyncValue;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use uuid::Uuid;

/// Well-known command parameter names.
pub mod params {
    /// Lower timestamp bound; `NULL` for an initial selection.
    pub const SYNC_MIN_TIMESTAMP: &str = "sync_min_timestamp";
    /// Peer id: excluded writer for selections, recorded writer for writes.
    pub const SYNC_SCOPE_ID: &str = "sync_scope_id";
    /// Bypasses the conflict check on writes.
    pub const SYNC_FORCE_WRITE: &str = "sync_force_write";
}

/// Kinds of command a store must be able to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbCommandType {
    /// Rows changed after a timestamp.
    SelectChanges,
    /// Every live row, for a first synchronization.
    SelectInitializedChanges,
    /// Rows changed after a timestamp, filtered.
    SelectChangesWithFilters,
    /// Every live row, filtered.
    SelectInitializedChangesWithFilters,
    /// One row by primary key, including tombstones.
    SelectRow,
    /// Conditional upsert of one row.
    UpdateRow,
    /// Conditional delete of one row.
    DeleteRow,
}

impl DbCommandType {
    /// Selection variant for an initial or incremental, filtered or plain scan.
    pub fn for_selection(is_new: bool, has_filter: bool) -> Self {
        match (is_new, has_filter) {
            (false, false) => DbCommandType::SelectChanges,
            (true, false) => DbCommandType::SelectInitializedChanges,
            (false, true) => DbCommandType::SelectChangesWithFilters,
            (true, true) => DbCommandType::SelectInitializedChangesWithFilters,
        }
    }

    /// Returns true for the four selection variants.
    pub fn is_selection(&self) -> bool {
        matches!(
            self,
            DbCommandType::SelectChanges
                | DbCommandType::SelectInitializedChanges
                | DbCommandType::SelectChangesWithFilters
                | DbCommandType::SelectInitializedChangesWithFilters
        )
    }

    /// Returns true for the initial-scan variants.
    pub fn is_initialized(&self) -> bool {
        matches!(
            self,
            DbCommandType::SelectInitializedChanges
                | DbCommandType::SelectInitializedChangesWithFilters
        )
    }
}

impl fmt::Display for DbCommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DbCommandType::SelectChanges => "SelectChanges",
            DbCommandType::SelectInitializedChanges => "SelectInitializedChanges",
            DbCommandType::SelectChangesWithFilters => "SelectChangesWithFilters",
            DbCommandType::SelectInitializedChangesWithFilters => {
                "SelectInitializedChangesWithFilters"
            }
            DbCommandType::SelectRow => "SelectRow",
            DbCommandType::UpdateRow => "UpdateRow",
            DbCommandType::DeleteRow => "DeleteRow",
        };
        f.write_str(name)
    }
}

/// A ready-to-execute parameterized command.
#[derive(Debug, Clone, PartialEq)]
pub struct DbCommand {
    /// Command kind.
    pub command_type: DbCommandType,
    /// Target table.
    pub table: TableName,
    /// Filter clauses, for filtered selections.
    pub clauses: Vec<FilterClause>,
    /// Bound parameters.
    pub parameters: Vec<(String, SyncValue)>,
}

impl DbCommand {
    /// Creates a command with no parameters.
    pub fn new(command_type: DbCommandType, table: TableName) -> Self {
        Self {
            command_type,
            table,
            clauses: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Copies the clauses of a filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Option<&SyncFilter>) -> Self {
        if let Some(filter) = filter {
            self.clauses = filter.clauses.clone();
        }
        self
    }

    /// Binds a parameter.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<SyncValue>) -> Self {
        self.set_parameter(name, value);
        self
    }

    /// Binds or rebinds a parameter.
    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<SyncValue>) {
        let name = name.into();
        let value = value.into();
        match self.parameters.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = value,
            None => self.parameters.push((name, value)),
        }
    }

    /// Bound value of a parameter.
    pub fn parameter(&self, name: &str) -> Option<&SyncValue> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Bound value of a parameter, failing when absent.
    pub fn required(&self, name: &str) -> CoreResult<&SyncValue> {
        self.parameter(name).ok_or_else(|| CoreError::MissingParameter {
            command: self.command_type.to_string(),
            parameter: name.to_string(),
        })
    }

    /// `sync_min_timestamp`, or `None` when unbound or null.
    pub fn min_timestamp(&self) -> Option<i64> {
        self.parameter(params::SYNC_MIN_TIMESTAMP)
            .and_then(SyncValue::as_integer)
    }

    /// `sync_scope_id`, or `None` when unbound or null.
    pub fn scope_id(&self) -> Option<Uuid> {
        self.parameter(params::SYNC_SCOPE_ID)
            .and_then(SyncValue::as_guid)
    }

    /// `sync_force_write`, false when unbound.
    pub fn force_write(&self) -> bool {
        self.parameter(params::SYNC_FORCE_WRITE)
            .and_then(SyncValue::as_bool)
            .unwrap_or(false)
    }
}

/// A lazy, single-pass stream of selected rows.
pub type RowStream<'a> = BoxStream<'a, CoreResult<SyncRow>>;

/// The current target image of a row, with its tracking metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Row image; state is `Deleted` for a tombstone.
    pub row: SyncRow,
    /// Commit timestamp of the last write.
    pub timestamp: i64,
    /// Peer whose sync wrote the row last; `None` for local edits.
    pub update_scope_id: Option<Uuid>,
}

/// Persistence for scope definitions and watermarks.
#[async_trait]
pub trait ScopeStore: Send + Sync {
    /// Current value of the store's logical clock.
    ///
    /// Every later commit is stamped with a strictly greater value.
    async fn local_timestamp(&self) -> CoreResult<i64>;

    /// Stable identifier of this store as a sync peer.
    async fn local_peer_id(&self) -> CoreResult<Uuid>;

    /// Loads a scope definition.
    async fn load_scope(&self, name: &str) -> CoreResult<Option<SyncScope>>;

    /// Saves a scope definition.
    async fn save_scope(&self, scope: &SyncScope) -> CoreResult<()>;

    /// Loads every peer record of a scope.
    async fn load_scope_info_clients(&self, scope_name: &str) -> CoreResult<Vec<ScopeInfoClient>>;

    /// Upserts a peer record as one atomic write.
    async fn save_scope_info_client(&self, info: &ScopeInfoClient) -> CoreResult<()>;
}

/// Change tracking and row access.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Short provider name for diagnostics.
    fn provider_name(&self) -> &str;

    /// Returns true if several selections may stream at the same time.
    fn supports_multiple_active_result_sets(&self) -> bool;

    /// Builds the command of a kind for a table.
    fn get_command(
        &self,
        table: &SyncTable,
        command_type: DbCommandType,
        filter: Option<&SyncFilter>,
    ) -> CoreResult<DbCommand> {
        Ok(DbCommand::new(command_type, table.name.clone()).with_filter(filter))
    }

    /// Returns true if the table and its tracking metadata exist.
    async fn table_exists(&self, table: &TableName) -> CoreResult<bool>;

    /// Streams the rows of a selection command.
    fn execute_reader<'a>(&'a self, command: DbCommand) -> RowStream<'a>;

    /// Counts the rows a selection command would stream.
    async fn execute_count(&self, command: DbCommand) -> CoreResult<u64>;

    /// Opens a write transaction.
    async fn begin_transaction(&self) -> CoreResult<Box<dyn StoreTransaction>>;
}

/// A write transaction on a [`ChangeStore`].
#[async_trait]
pub trait StoreTransaction: Send {
    /// Executes `UpdateRow` or `DeleteRow` for one row.
    ///
    /// Returns the number of affected rows. Zero means the conflict
    /// check refused the write.
    async fn execute_row(&mut self, command: &DbCommand, row: &SyncRow) -> CoreResult<u64>;

    /// Executes a write command for several rows.
    async fn execute_rows(&mut self, command: &DbCommand, rows: &[SyncRow]) -> CoreResult<Vec<u64>> {
        let mut affected = Vec::with_capacity(rows.len());
        for row in rows {
            affected.push(self.execute_row(command, row).await?);
        }
        Ok(affected)
    }

    /// Executes `SelectRow`: the current image of the row with the same key.
    async fn fetch_row(&mut self, command: &DbCommand, row: &SyncRow) -> CoreResult<Option<StoredRow>>;

    /// Commits every write.
    async fn commit(self: Box<Self>) -> CoreResult<()>;

    /// Discards every write.
    async fn rollback(self: Box<Self>) -> CoreResult<()>;
}

/// A complete store: scope metadata plus change tracking.
pub trait SyncStore: ScopeStore + ChangeStore {}

impl<T: ScopeStore + ChangeStore + ?Sized> SyncStore for T {}
