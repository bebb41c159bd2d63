//! Change-tracked in-memory store.
//!
//! [`MemoryStore`] is the reference implementation of [`ScopeStore`] and
//! [`ChangeStore`]. Every row carries the tracking columns the sync
//! engine relies on: the commit timestamp of its last write, the peer
//! whose sync wrote it last, and a tombstone flag. Deleted rows keep
//! their last image so filtered selections can still route the delete.
//!
//! Local edits made through [`MemoryStore::upsert`] and
//! [`MemoryStore::delete`] are stamped like any other commit and carry
//! no writer, so they are picked up by the next selection.

mod table;
mod transaction;

use crate::error::{CoreError, CoreResult};
use crate::row::{PrimaryKey, SyncRow};
use crate::schema::{SyncTable, TableName};
use crate::scope::{ScopeInfoClient, SyncScope};
use crate::store::{ChangeStore, DbCommand, RowStream, ScopeStore, StoreTransaction, StoredRow};
use crate::value::SyncValue;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use table::{MemoryTable, TrackedRow};
use tracing::debug;
use transaction::MemoryTransaction;
use uuid::Uuid;

#[derive(Default)]
pub(crate) struct StoreData {
    tables: HashMap<TableName, MemoryTable>,
    scopes: HashMap<String, SyncScope>,
    scope_clients: Vec<ScopeInfoClient>,
}

impl StoreData {
    pub fn table(&self, name: &TableName) -> CoreResult<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| CoreError::TableNotFound { table: name.clone() })
    }

    pub fn table_mut(&mut self, name: &TableName) -> CoreResult<&mut MemoryTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| CoreError::TableNotFound { table: name.clone() })
    }
}

pub(crate) struct StoreInner {
    name: String,
    peer_id: Uuid,
    multiple_active_result_sets: AtomicBool,
    /// Last commit timestamp handed out. Only advanced under the data write lock.
    clock: AtomicI64,
    pub data: RwLock<StoreData>,
}

impl StoreInner {
    /// Next commit timestamp. Callers hold the data write lock.
    pub fn next_timestamp(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// In-memory store with row-level change tracking.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Creates an empty store with a fresh peer id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_peer_id(name, Uuid::new_v4())
    }

    /// Creates an empty store with a known peer id.
    pub fn with_peer_id(name: impl Into<String>, peer_id: Uuid) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name: name.into(),
                peer_id,
                multiple_active_result_sets: AtomicBool::new(true),
                clock: AtomicI64::new(0),
                data: RwLock::new(StoreData::default()),
            }),
        }
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enables or disables concurrent selections.
    pub fn set_multiple_active_result_sets(&self, enabled: bool) {
        self.inner
            .multiple_active_result_sets
            .store(enabled, Ordering::SeqCst);
    }

    /// Creates a table with its tracking metadata.
    pub fn create_table(&self, table: SyncTable) -> CoreResult<()> {
        let mut data = self.inner.data.write();
        if data.tables.contains_key(&table.name) {
            return Err(CoreError::TableExists { table: table.name });
        }
        let name = table.name.clone();
        data.tables.insert(name.clone(), MemoryTable::new(table)?);
        debug!(store = %self.inner.name, table = %name, "table created");
        Ok(())
    }

    /// Inserts or updates a row as a local edit.
    pub fn upsert(&self, table: impl Into<TableName>, values: Vec<SyncValue>) -> CoreResult<i64> {
        self.local_write(table.into(), SyncRow::modified(values))
    }

    /// Deletes a row by primary key as a local edit.
    ///
    /// The tombstone keeps the last image of the row. Deleting an
    /// unknown key is a no-op and returns `None`.
    pub fn delete(&self, table: impl Into<TableName>, key: Vec<SyncValue>) -> CoreResult<Option<i64>> {
        let name = table.into();
        let mut data = self.inner.data.write();
        let table = data.table_mut(&name)?;
        let key = PrimaryKey::new(key);
        let Some(row) = table.rows.get_mut(&key).filter(|r| !r.tombstone) else {
            return Ok(None);
        };
        let timestamp = self.inner.next_timestamp();
        row.tombstone = true;
        row.timestamp = timestamp;
        row.update_scope_id = None;
        Ok(Some(timestamp))
    }

    fn local_write(&self, name: TableName, row: SyncRow) -> CoreResult<i64> {
        let mut data = self.inner.data.write();
        let table = data.table_mut(&name)?;
        table.check_row(&row)?;
        let key = table.key_of(&row.values);
        if let Some(column) = table.unique_violation(&key, &row.values, None) {
            return Err(CoreError::UniqueConstraint { table: name, column });
        }
        let timestamp = self.inner.next_timestamp();
        table.rows.insert(
            key,
            TrackedRow {
                values: row.values,
                tombstone: false,
                timestamp,
                update_scope_id: None,
            },
        );
        Ok(timestamp)
    }

    /// Live row values by primary key.
    pub fn get(&self, table: impl Into<TableName>, key: Vec<SyncValue>) -> Option<Vec<SyncValue>> {
        let data = self.inner.data.read();
        let table = data.table(&table.into()).ok()?;
        table
            .rows
            .get(&PrimaryKey::new(key))
            .filter(|r| !r.tombstone)
            .map(|r| r.values.clone())
    }

    /// Row image and tracking metadata by primary key, tombstones included.
    pub fn tracking(&self, table: impl Into<TableName>, key: Vec<SyncValue>) -> Option<StoredRow> {
        let data = self.inner.data.read();
        let table = data.table(&table.into()).ok()?;
        table
            .rows
            .get(&PrimaryKey::new(key))
            .map(TrackedRow::to_stored)
    }

    /// Live rows in primary key order.
    pub fn rows(&self, table: impl Into<TableName>) -> Vec<Vec<SyncValue>> {
        let data = self.inner.data.read();
        data.table(&table.into())
            .map(|t| {
                t.rows
                    .values()
                    .filter(|r| !r.tombstone)
                    .map(|r| r.values.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of live rows.
    pub fn row_count(&self, table: impl Into<TableName>) -> usize {
        let data = self.inner.data.read();
        data.table(&table.into())
            .map(|t| t.rows.values().filter(|r| !r.tombstone).count())
            .unwrap_or(0)
    }

    fn next_selected(
        &self,
        command: &DbCommand,
        after: Option<&PrimaryKey>,
    ) -> CoreResult<Option<(PrimaryKey, SyncRow)>> {
        let data = self.inner.data.read();
        data.table(&command.table)?.next_selected(command, after)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.inner.name)
            .field("peer_id", &self.inner.peer_id)
            .field("clock", &self.inner.clock.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl ScopeStore for MemoryStore {
    async fn local_timestamp(&self) -> CoreResult<i64> {
        Ok(self.inner.clock.load(Ordering::SeqCst))
    }

    async fn local_peer_id(&self) -> CoreResult<Uuid> {
        Ok(self.inner.peer_id)
    }

    async fn load_scope(&self, name: &str) -> CoreResult<Option<SyncScope>> {
        Ok(self.inner.data.read().scopes.get(name).cloned())
    }

    async fn save_scope(&self, scope: &SyncScope) -> CoreResult<()> {
        scope.setup.validate()?;
        self.inner
            .data
            .write()
            .scopes
            .insert(scope.name.clone(), scope.clone());
        Ok(())
    }

    async fn load_scope_info_clients(&self, scope_name: &str) -> CoreResult<Vec<ScopeInfoClient>> {
        Ok(self
            .inner
            .data
            .read()
            .scope_clients
            .iter()
            .filter(|c| c.scope_name == scope_name)
            .cloned()
            .collect())
    }

    async fn save_scope_info_client(&self, info: &ScopeInfoClient) -> CoreResult<()> {
        let mut data = self.inner.data.write();
        match data.scope_clients.iter_mut().find(|c| c.same_key(info)) {
            Some(existing) => *existing = info.clone(),
            None => data.scope_clients.push(info.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeStore for MemoryStore {
    fn provider_name(&self) -> &str {
        "memory"
    }

    fn supports_multiple_active_result_sets(&self) -> bool {
        self.inner.multiple_active_result_sets.load(Ordering::SeqCst)
    }

    async fn table_exists(&self, table: &TableName) -> CoreResult<bool> {
        Ok(self.inner.data.read().tables.contains_key(table))
    }

    fn execute_reader<'a>(&'a self, command: DbCommand) -> RowStream<'a> {
        if !command.command_type.is_selection() {
            let err = CoreError::UnsupportedCommand {
                command: command.command_type.to_string(),
                reason: "not a selection".into(),
            };
            return stream::once(async move { Err(err) }).boxed();
        }
        // Lazy cursor: each step takes the read lock and resumes after the last key.
        stream::try_unfold(None::<PrimaryKey>, move |cursor| {
            let next = self.next_selected(&command, cursor.as_ref());
            async move { next.map(|found| found.map(|(key, row)| (row, Some(key)))) }
        })
        .boxed()
    }

    async fn execute_count(&self, command: DbCommand) -> CoreResult<u64> {
        if !command.command_type.is_selection() {
            return Err(CoreError::UnsupportedCommand {
                command: command.command_type.to_string(),
                reason: "not a selection".into(),
            });
        }
        let data = self.inner.data.read();
        let table = data.table(&command.table)?;
        let mut count = 0u64;
        for row in table.rows.values() {
            if table.is_selected(row, &command)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn begin_transaction(&self) -> CoreResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction::new(Arc::clone(&self.inner))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, SyncColumn, SyncTable};
    use crate::scope::SyncParameters;
    use crate::store::{params, DbCommandType};
    use futures::TryStreamExt;

    fn store() -> MemoryStore {
        let store = MemoryStore::new("test");
        store
            .create_table(
                SyncTable::new(
                    "Customer",
                    vec![
                        SyncColumn::new("Id", ColumnType::Integer),
                        SyncColumn::new("Email", ColumnType::Text),
                    ],
                    &["Id"],
                )
                .with_unique("Email"),
            )
            .unwrap();
        store
    }

    fn customer(id: i64, email: &str) -> Vec<SyncValue> {
        vec![id.into(), email.into()]
    }

    fn select_changes(min: Option<i64>, peer: Option<Uuid>) -> DbCommand {
        let command = DbCommand::new(
            DbCommandType::for_selection(min.is_none(), false),
            TableName::new("Customer"),
        );
        let command = match min {
            Some(min) => command.with_parameter(params::SYNC_MIN_TIMESTAMP, min),
            None => command,
        };
        match peer {
            Some(peer) => command.with_parameter(params::SYNC_SCOPE_ID, peer),
            None => command,
        }
    }

    #[tokio::test]
    async fn local_edits_advance_the_clock() {
        let store = store();
        assert_eq!(store.local_timestamp().await.unwrap(), 0);
        assert_eq!(store.upsert("Customer", customer(1, "a@x")).unwrap(), 1);
        assert_eq!(store.upsert("Customer", customer(2, "b@x")).unwrap(), 2);
        assert_eq!(store.delete("Customer", vec![1i64.into()]).unwrap(), Some(3));
        assert_eq!(store.delete("Customer", vec![9i64.into()]).unwrap(), None);
        assert_eq!(store.local_timestamp().await.unwrap(), 3);
        assert_eq!(store.row_count("Customer"), 1);

        let tombstone = store.tracking("Customer", vec![1i64.into()]).unwrap();
        assert_eq!(tombstone.row.state, crate::RowState::Deleted);
        assert_eq!(tombstone.row.values, customer(1, "a@x"));
    }

    #[tokio::test]
    async fn unique_constraint_on_local_edit() {
        let store = store();
        store.upsert("Customer", customer(1, "a@x")).unwrap();
        let err = store.upsert("Customer", customer(2, "a@x")).unwrap_err();
        assert!(err.is_unique_violation());
        // Same key may keep its own value.
        store.upsert("Customer", customer(1, "a@x")).unwrap();
    }

    #[tokio::test]
    async fn reader_streams_changes_after_watermark() {
        let store = store();
        store.upsert("Customer", customer(1, "a@x")).unwrap();
        let watermark = store.local_timestamp().await.unwrap();
        store.upsert("Customer", customer(2, "b@x")).unwrap();
        store.delete("Customer", vec![1i64.into()]).unwrap();

        let rows: Vec<SyncRow> = store
            .execute_reader(select_changes(Some(watermark), None))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].state, crate::RowState::Deleted);
        assert_eq!(rows[1].values, customer(2, "b@x"));

        let count = store
            .execute_count(select_changes(Some(watermark), None))
            .await
            .unwrap();
        assert_eq!(count, 2);

        let initial: Vec<SyncRow> = store
            .execute_reader(select_changes(None, None))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(initial.len(), 1);
    }

    #[tokio::test]
    async fn transaction_conflict_check_and_commit() {
        let store = store();
        let peer = Uuid::new_v4();
        store.upsert("Customer", customer(1, "a@x")).unwrap();
        let watermark = store.local_timestamp().await.unwrap();
        store.upsert("Customer", customer(1, "changed@x")).unwrap();

        let update = DbCommand::new(DbCommandType::UpdateRow, TableName::new("Customer"))
            .with_parameter(params::SYNC_MIN_TIMESTAMP, watermark)
            .with_parameter(params::SYNC_SCOPE_ID, peer);

        let mut tx = store.begin_transaction().await.unwrap();
        // Row 1 changed locally after the watermark.
        let incoming = SyncRow::modified(customer(1, "remote@x"));
        assert_eq!(tx.execute_row(&update, &incoming).await.unwrap(), 0);
        let current = tx.fetch_row(&update, &incoming).await.unwrap().unwrap();
        assert_eq!(current.row.values, customer(1, "changed@x"));

        let fresh = SyncRow::modified(customer(2, "b@x"));
        assert_eq!(tx.execute_row(&update, &fresh).await.unwrap(), 1);
        // Pending write is visible inside the transaction only.
        assert!(tx.fetch_row(&update, &fresh).await.unwrap().is_some());
        assert!(store.get("Customer", vec![2i64.into()]).is_none());

        tx.commit().await.unwrap();
        let tracked = store.tracking("Customer", vec![2i64.into()]).unwrap();
        assert_eq!(tracked.update_scope_id, Some(peer));
        assert_eq!(tracked.timestamp, store.local_timestamp().await.unwrap());

        // Rows written by the peer are not selected back for it.
        let rows: Vec<SyncRow> = store
            .execute_reader(select_changes(Some(watermark), Some(peer)))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, customer(1, "changed@x"));
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = store();
        let update = DbCommand::new(DbCommandType::UpdateRow, TableName::new("Customer"));
        let mut tx = store.begin_transaction().await.unwrap();
        tx.execute_row(&update, &SyncRow::modified(customer(5, "e@x")))
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.row_count("Customer"), 0);
        assert_eq!(store.local_timestamp().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn local_edit_after_staging_refuses_commit() {
        let store = store();
        let peer = Uuid::new_v4();
        store.upsert("Customer", customer(1, "a@x")).unwrap();
        let watermark = store.local_timestamp().await.unwrap();
        let update = DbCommand::new(DbCommandType::UpdateRow, TableName::new("Customer"))
            .with_parameter(params::SYNC_MIN_TIMESTAMP, watermark)
            .with_parameter(params::SYNC_SCOPE_ID, peer);

        let mut tx = store.begin_transaction().await.unwrap();
        let incoming = SyncRow::modified(customer(1, "remote@x"));
        assert_eq!(tx.execute_row(&update, &incoming).await.unwrap(), 1);
        let edited_at = store.upsert("Customer", customer(1, "local@x")).unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, CoreError::WriteConflict { .. }));
        assert!(err.is_transient());
        let tracked = store.tracking("Customer", vec![1i64.into()]).unwrap();
        assert_eq!(tracked.row.values, customer(1, "local@x"));
        assert_eq!(tracked.update_scope_id, None);
        assert_eq!(tracked.timestamp, edited_at);
        assert_eq!(store.local_timestamp().await.unwrap(), edited_at);
    }

    #[tokio::test]
    async fn new_row_committed_after_staging_refuses_commit() {
        let store = store();
        let update = DbCommand::new(DbCommandType::UpdateRow, TableName::new("Customer"));
        let mut tx = store.begin_transaction().await.unwrap();
        tx.execute_row(&update, &SyncRow::modified(customer(2, "dup@x")))
            .await
            .unwrap();
        // A different key, so only the unique check can catch it.
        store.upsert("Customer", customer(3, "dup@x")).unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(err.is_unique_violation());
        assert!(store.get("Customer", vec![2i64.into()]).is_none());
        assert_eq!(store.rows("Customer"), vec![customer(3, "dup@x")]);
    }

    #[tokio::test]
    async fn unrelated_local_edit_does_not_block_commit() {
        let store = store();
        let update = DbCommand::new(DbCommandType::UpdateRow, TableName::new("Customer"));
        let mut tx = store.begin_transaction().await.unwrap();
        tx.execute_row(&update, &SyncRow::modified(customer(2, "b@x")))
            .await
            .unwrap();
        store.upsert("Customer", customer(3, "c@x")).unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.row_count("Customer"), 2);
    }

    #[tokio::test]
    async fn unique_violation_inside_transaction() {
        let store = store();
        store.upsert("Customer", customer(1, "a@x")).unwrap();
        let update = DbCommand::new(DbCommandType::UpdateRow, TableName::new("Customer"));
        let mut tx = store.begin_transaction().await.unwrap();
        let err = tx
            .execute_row(&update, &SyncRow::modified(customer(2, "a@x")))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn scope_info_client_upsert() {
        let store = store();
        let id = Uuid::new_v4();
        let mut info = ScopeInfoClient::new(id, "default", SyncParameters::new());
        store.save_scope_info_client(&info).await.unwrap();
        info.advance(4, 9, chrono::Utc::now(), 1).unwrap();
        store.save_scope_info_client(&info).await.unwrap();

        let loaded = store.load_scope_info_clients("default").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].last_sync_timestamp, 4);
        assert!(store.load_scope_info_clients("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsupported_reader_command() {
        let store = store();
        let command = DbCommand::new(DbCommandType::UpdateRow, TableName::new("Customer"));
        let result: CoreResult<Vec<SyncRow>> = store.execute_reader(command).try_collect().await;
        assert!(matches!(result, Err(CoreError::UnsupportedCommand { .. })));
    }
}
