//! Overlay transaction for the memory store.

use super::table::{write_allowed, TrackedRow};
use super::{StoreData, StoreInner};
use crate::error::{CoreError, CoreResult};
use crate::row::{PrimaryKey, SyncRow};
use crate::schema::TableName;
use crate::store::{DbCommand, DbCommandType, StoreTransaction, StoredRow};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

/// Buffers writes until commit.
///
/// Reads see pending writes first, then committed rows. Commit stamps
/// every pending row with one new commit timestamp.
///
/// Commit fails with [`CoreError::WriteConflict`] if a staged row was
/// committed by someone else after it was staged, and with
/// [`CoreError::UniqueConstraint`] if a row committed since then holds
/// one of the staged unique values. Nothing is written in either case.
pub(crate) struct MemoryTransaction {
    inner: Arc<StoreInner>,
    pending: HashMap<TableName, BTreeMap<PrimaryKey, TrackedRow>>,
    /// Commit timestamp of each staged key when it was first staged.
    staged_from: HashMap<TableName, BTreeMap<PrimaryKey, Option<i64>>>,
}

impl MemoryTransaction {
    pub fn new(inner: Arc<StoreInner>) -> Self {
        Self {
            inner,
            pending: HashMap::new(),
            staged_from: HashMap::new(),
        }
    }

    fn check_staged(&self, data: &StoreData) -> CoreResult<()> {
        for (name, rows) in &self.pending {
            let table = data.table(name)?;
            let seen = self.staged_from.get(name);
            for (key, row) in rows {
                let was = seen.and_then(|s| s.get(key)).copied().flatten();
                let now = table.rows.get(key).map(|r| r.timestamp);
                if was != now {
                    return Err(CoreError::WriteConflict {
                        table: name.clone(),
                        key: key.to_string(),
                    });
                }
                if row.tombstone {
                    continue;
                }
                if let Some(column) = table.unique_violation(key, &row.values, Some(rows)) {
                    return Err(CoreError::UniqueConstraint {
                        table: name.clone(),
                        column,
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn execute_row(&mut self, command: &DbCommand, row: &SyncRow) -> CoreResult<u64> {
        let tombstone = match command.command_type {
            DbCommandType::UpdateRow => false,
            DbCommandType::DeleteRow => true,
            other => {
                return Err(CoreError::UnsupportedCommand {
                    command: other.to_string(),
                    reason: "not a row write".into(),
                })
            }
        };

        let (key, written, committed) = {
            let data = self.inner.data.read();
            let table = data.table(&command.table)?;
            table.check_row(row)?;
            let key = table.key_of(&row.values);
            let overlay = self.pending.get(&command.table);

            // A row already written by this transaction belongs to it.
            let allowed = match overlay.and_then(|o| o.get(&key)) {
                Some(_) => true,
                None => write_allowed(table.rows.get(&key), command),
            };
            if !allowed {
                return Ok(0);
            }
            if !tombstone {
                if let Some(column) = table.unique_violation(&key, &row.values, overlay) {
                    return Err(CoreError::UniqueConstraint {
                        table: command.table.clone(),
                        column,
                    });
                }
            }
            let written = TrackedRow {
                values: row.values.clone(),
                tombstone,
                timestamp: 0,
                update_scope_id: command.scope_id(),
            };
            let committed = table.rows.get(&key).map(|r| r.timestamp);
            (key, written, committed)
        };

        trace!(table = %command.table, key = %key, tombstone, "row staged");
        self.staged_from
            .entry(command.table.clone())
            .or_default()
            .entry(key.clone())
            .or_insert(committed);
        self.pending
            .entry(command.table.clone())
            .or_default()
            .insert(key, written);
        Ok(1)
    }

    async fn fetch_row(&mut self, command: &DbCommand, row: &SyncRow) -> CoreResult<Option<StoredRow>> {
        let data = self.inner.data.read();
        let table = data.table(&command.table)?;
        let key = table.key_of(&row.values);
        let pending = self
            .pending
            .get(&command.table)
            .and_then(|o| o.get(&key));
        Ok(pending.or_else(|| table.rows.get(&key)).map(TrackedRow::to_stored))
    }

    async fn commit(self: Box<Self>) -> CoreResult<()> {
        let this = *self;
        if this.pending.is_empty() {
            return Ok(());
        }
        let mut data = this.inner.data.write();
        if let Err(e) = this.check_staged(&data) {
            trace!(error = %e, "transaction refused at commit");
            return Err(e);
        }
        let timestamp = this.inner.next_timestamp();
        let mut written = 0usize;
        for (name, rows) in this.pending {
            let table = data.table_mut(&name)?;
            for (key, mut row) in rows {
                row.timestamp = timestamp;
                table.rows.insert(key, row);
                written += 1;
            }
        }
        trace!(timestamp, rows = written, "transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> CoreResult<()> {
        trace!(tables = self.pending.len(), "transaction rolled back");
        Ok(())
    }
}
