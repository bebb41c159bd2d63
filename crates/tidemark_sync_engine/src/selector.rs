//! Change selection.
//!
//! Scans every table of a scope for rows changed after a lower bound
//! and streams them into a batch. Tables are scanned concurrently when
//! the store allows several active result sets; each scan owns its
//! counters and closed parts, which are merged once every scan is done.

use crate::config::SyncOptions;
use crate::conflict::SyncSide;
use crate::error::{SyncError, SyncResult, SyncStage};
use crate::interceptor::{Interceptors, ProgressArgs, SyncEvent};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tidemark_batch::{BatchInfo, BatchWriter, ClosedPart};
use tidemark_core::{
    params, ChangeStore, DatabaseChangesSelected, DbCommand, DbCommandType, RowStream,
    SyncParameters, SyncScope, SyncStore, SyncTable, TableChangesSelected, TableName,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What to select and for whom.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    /// Scope being synchronized.
    pub scope: &'a SyncScope,
    /// Filter parameter values of the client.
    pub parameters: &'a SyncParameters,
    /// Side doing the selection. A client selects its upload, a server
    /// its download.
    pub side: SyncSide,
    /// Select every live row instead of changes.
    pub is_new: bool,
    /// Exclusive lower timestamp bound; ignored when `is_new`.
    pub from_timestamp: Option<i64>,
    /// Rows last written by this peer's sync are not selected.
    pub excluded_peer: Option<Uuid>,
}

impl SelectionContext<'_> {
    fn selects(&self, table: &SyncTable) -> bool {
        match self.side {
            SyncSide::Client => table.direction.allows_upload(),
            SyncSide::Server => table.direction.allows_download(),
        }
    }
}

/// Pending change count of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChangesEstimated {
    /// Table.
    pub table: TableName,
    /// Rows a selection would return.
    pub changes: u64,
}

/// Pending change counts of a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesEstimate {
    /// Per-table counts, in dependency order.
    pub tables: Vec<TableChangesEstimated>,
}

impl ChangesEstimate {
    /// Count of one table.
    pub fn table(&self, table: &TableName) -> Option<u64> {
        self.tables
            .iter()
            .find(|t| &t.table == table)
            .map(|t| t.changes)
    }

    /// Count across every table.
    pub fn total(&self) -> u64 {
        self.tables.iter().map(|t| t.changes).sum()
    }
}

struct TableSelection {
    position: usize,
    changes: TableChangesSelected,
    parts: Vec<ClosedPart>,
}

/// Selects changes from a store into batches.
pub struct ChangeSelector<'a> {
    store: &'a dyn SyncStore,
    options: &'a SyncOptions,
    interceptors: &'a Interceptors,
    cancel: &'a CancellationToken,
}

impl<'a> ChangeSelector<'a> {
    /// Creates a selector.
    pub fn new(
        store: &'a dyn SyncStore,
        options: &'a SyncOptions,
        interceptors: &'a Interceptors,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            options,
            interceptors,
            cancel,
        }
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Tables to scan, in dependency order, skipping tables whose
    /// direction excludes this side.
    pub fn tables_to_select<'s>(&self, ctx: &SelectionContext<'s>) -> SyncResult<Vec<&'s SyncTable>> {
        let ordered = ctx
            .scope
            .setup
            .ordered_tables()
            .map_err(|e| SyncError::selection_failed(None, e))?;
        Ok(ordered.into_iter().filter(|t| ctx.selects(t)).collect())
    }

    /// Builds the selection command of a table with every parameter bound.
    pub fn build_command(&self, table: &SyncTable, ctx: &SelectionContext<'_>) -> SyncResult<DbCommand> {
        let filter = ctx.scope.setup.filter_for(&table.name);
        let command_type = DbCommandType::for_selection(ctx.is_new, filter.is_some());
        let mut command = self
            .store
            .get_command(table, command_type, filter)
            .map_err(|e| SyncError::selection_failed(Some(&table.name), e))?;

        let from = if ctx.is_new { None } else { ctx.from_timestamp };
        command.set_parameter(params::SYNC_MIN_TIMESTAMP, from);
        command.set_parameter(params::SYNC_SCOPE_ID, ctx.excluded_peer);

        if let Some(filter) = filter {
            for parameter in &filter.parameters {
                let value = ctx
                    .parameters
                    .get(&parameter.name)
                    .cloned()
                    .or_else(|| parameter.default_value.clone())
                    .ok_or_else(|| {
                        SyncError::selection_failed(
                            Some(&table.name),
                            tidemark_core::CoreError::MissingFilterParameter {
                                table: table.name.clone(),
                                parameter: parameter.name.clone(),
                            },
                        )
                    })?;
                command.set_parameter(parameter.name.clone(), value);
            }
        }
        Ok(command)
    }

    /// Streams the selected rows of one table.
    pub fn select_table_changes(
        &self,
        table: &SyncTable,
        ctx: &SelectionContext<'_>,
    ) -> SyncResult<RowStream<'a>> {
        let command = self.build_command(table, ctx)?;
        Ok(self.store.execute_reader(command))
    }

    async fn ensure_tables_exist(&self, tables: &[&SyncTable]) -> SyncResult<()> {
        for table in tables {
            let exists = self
                .store
                .table_exists(&table.name)
                .await
                .map_err(|e| SyncError::selection_failed(Some(&table.name), e))?;
            if !exists {
                return Err(SyncError::missing_schema(
                    &table.name,
                    format!("table not provisioned in {}", self.store.provider_name()),
                ));
            }
        }
        Ok(())
    }

    /// Selects the changes of every table into a finalized batch.
    ///
    /// On error or cancellation the partially written batch is removed.
    pub async fn select_changes(
        &self,
        ctx: &SelectionContext<'_>,
    ) -> SyncResult<(BatchInfo, DatabaseChangesSelected)> {
        self.check_cancelled()?;
        let tables = self.tables_to_select(ctx)?;
        self.ensure_tables_exist(&tables).await?;

        let writer = BatchWriter::create(&self.options.batch_directory, self.options.batch_size)
            .await
            .map_err(|e| SyncError::selection_failed(None, e))?;
        let concurrency = self
            .options
            .table_scan_concurrency(self.store.supports_multiple_active_result_sets());
        debug!(
            scope = %ctx.scope.name,
            side = %ctx.side,
            tables = tables.len(),
            concurrency,
            initial = ctx.is_new,
            "selecting changes"
        );

        let done = AtomicUsize::new(0);
        let total = tables.len();
        // Built up front: a mapping closure held across the await makes
        // the future lose `Send`.
        let pending: Vec<_> = tables
            .iter()
            .enumerate()
            .map(|(position, table)| self.select_table(&writer, position, table, ctx, (&done, total)))
            .collect();
        let scans: SyncResult<Vec<TableSelection>> = stream::iter(pending)
            .buffer_unordered(concurrency)
            .try_collect()
            .await;

        let mut scans = match scans.and_then(|scans| self.check_cancelled().map(|()| scans)) {
            Ok(scans) => scans,
            Err(e) => {
                if let Err(cleanup) = writer.discard().await {
                    warn!(error = %cleanup, "could not remove partial batch");
                }
                return Err(e);
            }
        };
        scans.sort_by_key(|s| s.position);

        let changes = DatabaseChangesSelected {
            tables: scans.iter().map(|s| s.changes.clone()).collect(),
        };
        let parts = scans.into_iter().flat_map(|s| s.parts).collect();
        let directory = writer.directory().map(Path::to_path_buf);
        let batch = match writer.finalize(parts).await {
            Ok(batch) => batch,
            Err(e) => {
                if let Some(dir) = directory {
                    if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                        warn!(error = %cleanup, "could not remove partial batch");
                    }
                }
                return Err(SyncError::selection_failed(None, e));
            }
        };

        if let Err(e) = self.interceptors.check(
            &SyncEvent::DatabaseChangesSelected {
                batch: &batch,
                changes: &changes,
            },
            None,
        ) {
            if let Err(cleanup) = batch.delete().await {
                warn!(error = %cleanup, "could not remove rolled back batch");
            }
            return Err(e);
        }

        info!(
            scope = %ctx.scope.name,
            side = %ctx.side,
            rows = changes.total_changes_selected(),
            parts = batch.parts.len(),
            "changes selected"
        );
        Ok((batch, changes))
    }

    async fn select_table(
        &self,
        writer: &BatchWriter,
        position: usize,
        table: &SyncTable,
        ctx: &SelectionContext<'_>,
        (done, total): (&AtomicUsize, usize),
    ) -> SyncResult<TableSelection> {
        self.check_cancelled()?;
        let name = &table.name;
        let failed = |e: tidemark_batch::BatchError| SyncError::selection_failed(Some(name), e);

        let command = self.build_command(table, ctx)?;
        self.interceptors.check(
            &SyncEvent::TableChangesSelecting {
                table: name,
                command: &command,
            },
            Some(name),
        )?;

        let mut table_writer = writer.table_writer(table, position).await.map_err(failed)?;
        let mut changes = TableChangesSelected::new(name.clone());
        let mut rows = self.store.execute_reader(command);
        while let Some(row) = rows
            .try_next()
            .await
            .map_err(|e| SyncError::selection_failed(Some(name), e))?
        {
            self.check_cancelled()?;
            self.interceptors
                .check(&SyncEvent::RowSelected { table: name, row: &row }, Some(name))?;
            changes.record(row.state);
            if let Some(part) = table_writer.write_row(&row).await.map_err(failed)? {
                self.interceptors
                    .check(&SyncEvent::BatchPartWritten { part: &part }, Some(name))?;
            }
        }
        let parts = table_writer.finish().await.map_err(failed)?;

        debug!(table = %name, upserts = changes.upserts, deletes = changes.deletes, "table selected");
        self.interceptors
            .check(&SyncEvent::TableChangesSelected { changes: &changes }, Some(name))?;

        let completed = done.fetch_add(1, Ordering::SeqCst) + 1;
        self.interceptors.notify(&SyncEvent::Progress(&ProgressArgs {
            side: ctx.side,
            stage: SyncStage::ChangesSelecting,
            completed,
            total,
            message: name.to_string(),
        }));

        Ok(TableSelection {
            position,
            changes,
            parts,
        })
    }

    /// Counts pending changes per table without writing a batch.
    pub async fn estimate_changes(&self, ctx: &SelectionContext<'_>) -> SyncResult<ChangesEstimate> {
        let tables = self.tables_to_select(ctx)?;
        self.ensure_tables_exist(&tables).await?;
        let mut estimate = ChangesEstimate::default();
        for table in tables {
            self.check_cancelled()?;
            let command = self.build_command(table, ctx)?;
            let changes = self
                .store
                .execute_count(command)
                .await
                .map_err(|e| SyncError::selection_failed(Some(&table.name), e))?;
            estimate.tables.push(TableChangesEstimated {
                table: table.name.clone(),
                changes,
            });
        }
        Ok(estimate)
    }
}
