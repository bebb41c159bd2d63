//! Batch apply.
//!
//! Replays a batch on the local store in part order: deletes children
//! first, then upserts parents first. Each row goes through the store's
//! conditional write; a refused write becomes a [`SyncConflict`] handed
//! to the configured resolver.

use crate::config::{ErrorResolutionPolicy, SyncOptions, TransactionMode};
use crate::conflict::{
    action_for, validate_merged_row, ConflictAction, ConflictResolution, ConflictResolver,
    ConflictType, SyncConflict, SyncSide,
};
use crate::error::{SyncError, SyncResult, SyncStage};
use crate::interceptor::{Interceptors, ProgressArgs, SyncEvent};
use tidemark_batch::{BatchInfo, BatchPartInfo, BatchPartReader};
use tidemark_core::{
    params, ChangeStore, CoreError, DatabaseChangesApplied, DbCommand, DbCommandType, RowState,
    StoreTransaction, SyncRow, SyncScope, SyncStore, SyncTable, SyncValue,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a batch is applied.
#[derive(Clone, Copy)]
pub struct ApplyContext<'a> {
    /// Scope being synchronized.
    pub scope: &'a SyncScope,
    /// Side applying the batch.
    pub side: SyncSide,
    /// Peer the batch came from; recorded as the writer of applied rows.
    pub sender: Option<Uuid>,
    /// Local rows changed after this timestamp by anyone but the sender
    /// are conflicts. `None` makes every existing row a conflict unless
    /// the sender wrote it.
    pub sync_min_timestamp: Option<i64>,
    /// Conflict resolver.
    pub resolver: &'a dyn ConflictResolver,
}

struct PartCommands {
    write: DbCommand,
    select: DbCommand,
}

/// Applies batches to a store.
pub struct ChangeApplier<'a> {
    store: &'a dyn SyncStore,
    options: &'a SyncOptions,
    interceptors: &'a Interceptors,
    cancel: &'a CancellationToken,
}

impl<'a> ChangeApplier<'a> {
    /// Creates an applier.
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

    /// Checks that every table of the batch exists locally.
    async fn check_schema(&self, batch: &BatchInfo, scope: &SyncScope) -> SyncResult<()> {
        for part in &batch.parts {
            if scope.setup.table(&part.table).is_none() {
                return Err(SyncError::missing_schema(&part.table, "table is not part of the scope"));
            }
            let exists = self.store.table_exists(&part.table).await?;
            if !exists {
                return Err(SyncError::missing_schema(
                    &part.table,
                    format!("table not provisioned in {}", self.store.provider_name()),
                ));
            }
        }
        Ok(())
    }

    /// Applies a whole batch and returns per-table counters.
    ///
    /// With [`TransactionMode::AllOrNothing`] nothing is written unless
    /// every part applies; with [`TransactionMode::PerBatchPart`] parts
    /// applied before a failure stay committed.
    pub async fn apply_changes(
        &self,
        batch: &BatchInfo,
        ctx: &ApplyContext<'_>,
    ) -> SyncResult<DatabaseChangesApplied> {
        self.check_cancelled()?;
        batch.validate().map_err(SyncError::from_batch)?;
        self.check_schema(batch, ctx.scope).await?;
        self.interceptors
            .check(&SyncEvent::DatabaseChangesApplying { batch }, None)?;

        let mut applied = DatabaseChangesApplied::default();
        if batch.parts.is_empty() {
            self.interceptors
                .check(&SyncEvent::DatabaseChangesApplied { changes: &applied }, None)?;
            return Ok(applied);
        }

        match self.options.transaction_mode {
            TransactionMode::AllOrNothing => {
                let mut tx = self.store.begin_transaction().await?;
                let outcome = self.apply_parts(tx.as_mut(), batch, 0..batch.parts.len(), ctx, &mut applied).await;
                let outcome = outcome.and_then(|()| {
                    self.interceptors
                        .check(&SyncEvent::DatabaseChangesApplied { changes: &applied }, None)
                });
                match outcome {
                    Ok(()) => tx.commit().await?,
                    Err(e) => {
                        rollback(tx).await;
                        return Err(e);
                    }
                }
            }
            TransactionMode::PerBatchPart => {
                for index in 0..batch.parts.len() {
                    let mut tx = self.store.begin_transaction().await?;
                    match self
                        .apply_parts(tx.as_mut(), batch, index..index + 1, ctx, &mut applied)
                        .await
                    {
                        Ok(()) => tx.commit().await?,
                        Err(e) => {
                            rollback(tx).await;
                            return Err(e);
                        }
                    }
                }
                self.interceptors
                    .check(&SyncEvent::DatabaseChangesApplied { changes: &applied }, None)?;
            }
        }

        info!(
            scope = %ctx.scope.name,
            side = %ctx.side,
            applied = applied.total_applied_changes(),
            failed = applied.total_applied_changes_failed(),
            resolved = applied.total_resolved_conflicts(),
            "changes applied"
        );
        Ok(applied)
    }

    async fn apply_parts(
        &self,
        tx: &mut dyn StoreTransaction,
        batch: &BatchInfo,
        range: std::ops::Range<usize>,
        ctx: &ApplyContext<'_>,
        applied: &mut DatabaseChangesApplied,
    ) -> SyncResult<()> {
        let parts = &batch.parts;
        for index in range {
            let part = &parts[index];
            let starts_run = index == 0 || !same_run(&parts[index - 1], part);
            let ends_run = index + 1 == parts.len() || !same_run(part, &parts[index + 1]);

            if starts_run {
                self.interceptors.check(
                    &SyncEvent::TableChangesApplying {
                        table: &part.table,
                        state: part.state,
                    },
                    Some(&part.table),
                )?;
            }

            self.apply_part(tx, batch, part, ctx, applied).await?;

            if ends_run {
                let counters = applied.entry(&part.table, part.state).clone();
                debug!(
                    table = %part.table,
                    state = %part.state,
                    applied = counters.applied,
                    failed = counters.failed,
                    resolved = counters.resolved_conflicts,
                    "table changes applied"
                );
                self.interceptors.check(
                    &SyncEvent::TableChangesApplied { changes: &counters },
                    Some(&part.table),
                )?;
            }

            self.interceptors.notify(&SyncEvent::Progress(&ProgressArgs {
                side: ctx.side,
                stage: SyncStage::ChangesApplying,
                completed: index + 1,
                total: parts.len(),
                message: part.describe(),
            }));
        }
        Ok(())
    }

    fn commands_for(&self, table: &SyncTable, state: RowState, ctx: &ApplyContext<'_>) -> SyncResult<PartCommands> {
        let command_type = match state {
            RowState::Modified => DbCommandType::UpdateRow,
            RowState::Deleted => DbCommandType::DeleteRow,
        };
        let write = self
            .store
            .get_command(table, command_type, None)?
            .with_parameter(params::SYNC_MIN_TIMESTAMP, ctx.sync_min_timestamp)
            .with_parameter(params::SYNC_SCOPE_ID, ctx.sender)
            .with_parameter(params::SYNC_FORCE_WRITE, false);
        let select = self.store.get_command(table, DbCommandType::SelectRow, None)?;
        Ok(PartCommands { write, select })
    }

    async fn apply_part(
        &self,
        tx: &mut dyn StoreTransaction,
        batch: &BatchInfo,
        part: &BatchPartInfo,
        ctx: &ApplyContext<'_>,
        applied: &mut DatabaseChangesApplied,
    ) -> SyncResult<()> {
        let table = ctx
            .scope
            .setup
            .table(&part.table)
            .ok_or_else(|| SyncError::missing_schema(&part.table, "table is not part of the scope"))?;
        let mut reader = BatchPartReader::open(batch, part)
            .await
            .map_err(SyncError::from_batch)?;
        reader.check_schema(table).map_err(SyncError::from_batch)?;
        let commands = self.commands_for(table, part.state, ctx)?;
        debug!(part = %part.describe(), rows = part.rows_count, "applying part");

        if self.options.use_bulk_operations {
            let chunk_size = self.options.bulk_batch_max_rows.max(1);
            let mut chunk = Vec::with_capacity(chunk_size);
            loop {
                let row = reader.next_row().map_err(SyncError::from_batch)?;
                let end = row.is_none();
                if let Some(row) = row {
                    chunk.push(row);
                }
                if chunk.len() == chunk_size || (end && !chunk.is_empty()) {
                    self.check_cancelled()?;
                    let rows = std::mem::take(&mut chunk);
                    self.apply_chunk(tx, table, &commands, rows, ctx, applied).await?;
                }
                if end {
                    break;
                }
            }
        } else {
            while let Some(row) = reader.next_row().map_err(SyncError::from_batch)? {
                self.check_cancelled()?;
                self.apply_row(tx, table, &commands, row, ctx, applied).await?;
            }
        }
        Ok(())
    }

    async fn apply_chunk(
        &self,
        tx: &mut dyn StoreTransaction,
        table: &SyncTable,
        commands: &PartCommands,
        rows: Vec<SyncRow>,
        ctx: &ApplyContext<'_>,
        applied: &mut DatabaseChangesApplied,
    ) -> SyncResult<()> {
        match tx.execute_rows(&commands.write, &rows).await {
            Ok(affected) => {
                for (row, count) in rows.into_iter().zip(affected) {
                    if count > 0 {
                        applied.entry(&table.name, row.state).applied += 1;
                    } else {
                        self.resolve_conflict(tx, table, commands, row, None, ctx, applied)
                            .await?;
                    }
                }
            }
            Err(e) => {
                // Rows staged before the failure are rewritten by the row path.
                debug!(table = %table.name, error = %e, "bulk write failed, applying row by row");
                for row in rows {
                    self.apply_row(tx, table, commands, row, ctx, applied).await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_row(
        &self,
        tx: &mut dyn StoreTransaction,
        table: &SyncTable,
        commands: &PartCommands,
        row: SyncRow,
        ctx: &ApplyContext<'_>,
        applied: &mut DatabaseChangesApplied,
    ) -> SyncResult<()> {
        match tx.execute_row(&commands.write, &row).await {
            Ok(count) if count > 0 => {
                applied.entry(&table.name, row.state).applied += 1;
                Ok(())
            }
            Ok(_) => {
                self.resolve_conflict(tx, table, commands, row, None, ctx, applied)
                    .await
            }
            Err(e) if e.is_unique_violation() => {
                self.resolve_conflict(
                    tx,
                    table,
                    commands,
                    row,
                    Some(ConflictType::UniqueKeyConstraint),
                    ctx,
                    applied,
                )
                .await
            }
            Err(e) => self.row_failed(table, row.state, e, applied),
        }
    }

    fn row_failed(
        &self,
        table: &SyncTable,
        state: RowState,
        error: CoreError,
        applied: &mut DatabaseChangesApplied,
    ) -> SyncResult<()> {
        match self.options.error_resolution_policy {
            ErrorResolutionPolicy::Throw => Err(SyncError::ApplyFailed {
                table: table.name.clone(),
                source: error,
            }),
            ErrorResolutionPolicy::ContinueOnError => {
                warn!(table = %table.name, %state, %error, "row apply failed, continuing");
                applied.entry(&table.name, state).failed += 1;
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_conflict(
        &self,
        tx: &mut dyn StoreTransaction,
        table: &SyncTable,
        commands: &PartCommands,
        row: SyncRow,
        forced_kind: Option<ConflictType>,
        ctx: &ApplyContext<'_>,
        applied: &mut DatabaseChangesApplied,
    ) -> SyncResult<()> {
        let local = tx
            .fetch_row(&commands.select, &row)
            .await
            .map_err(|e| SyncError::ApplyFailed {
                table: table.name.clone(),
                source: e,
            })?;
        let kind = forced_kind
            .unwrap_or_else(|| ConflictType::classify(row.state, local.as_ref().map(|l| l.row.state)));
        let state = row.state;

        if kind.is_auto_resolved() {
            // Both sides agree the row is gone: record the delete as the sender's.
            return match self.force_write(tx, commands, &row, ctx.sender).await {
                Ok(_) => {
                    applied.entry(&table.name, state).applied += 1;
                    Ok(())
                }
                Err(e) => self.row_failed(table, state, e, applied),
            };
        }

        let mut conflict = SyncConflict::new(kind, table.name.clone(), row, local.map(|l| l.row));
        self.interceptors.check(
            &SyncEvent::ConflictOccurred {
                conflict: &conflict,
            },
            Some(&table.name),
        )?;

        let resolution = match ctx.resolver.resolve(&conflict) {
            Ok(ConflictResolution::MergeRow(merged)) => {
                match validate_merged_row(table, &conflict.remote_row, &merged) {
                    Ok(()) => ConflictResolution::MergeRow(merged),
                    Err(reason) => {
                        warn!(table = %table.name, %reason, "invalid merged row");
                        ConflictResolution::Rollback
                    }
                }
            }
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(table = %table.name, error = %e, "conflict resolver failed");
                ConflictResolution::Rollback
            }
        };
        conflict.resolve(resolution.clone());
        debug!(table = %table.name, ?kind, ?resolution, side = %ctx.side, "conflict resolved");

        let action = match action_for(ctx.side, resolution, &conflict.remote_row, ctx.sender) {
            Some(action) => action,
            None => {
                return Err(SyncError::rollback(
                    Some(&table.name),
                    format!("{kind:?} conflict resolved as rollback"),
                ))
            }
        };

        match action {
            ConflictAction::KeepLocal => {
                applied.entry(&table.name, state).resolved_conflicts += 1;
                Ok(())
            }
            ConflictAction::ForceWrite { row, writer } => {
                match self.force_write(tx, commands, &row, writer).await {
                    Ok(count) if count > 0 => {
                        let counters = applied.entry(&table.name, state);
                        counters.applied += 1;
                        counters.resolved_conflicts += 1;
                        Ok(())
                    }
                    Ok(_) => self.row_failed(
                        table,
                        state,
                        CoreError::Other(format!("forced write of {} affected no row", table.name)),
                        applied,
                    ),
                    Err(e) => self.row_failed(table, state, e, applied),
                }
            }
        }
    }

    async fn force_write(
        &self,
        tx: &mut dyn StoreTransaction,
        commands: &PartCommands,
        row: &SyncRow,
        writer: Option<Uuid>,
    ) -> Result<u64, CoreError> {
        let command_type = match row.state {
            RowState::Modified => DbCommandType::UpdateRow,
            RowState::Deleted => DbCommandType::DeleteRow,
        };
        let mut command = commands.write.clone();
        command.command_type = command_type;
        command.set_parameter(params::SYNC_SCOPE_ID, writer.map_or(SyncValue::Null, SyncValue::Guid));
        command.set_parameter(params::SYNC_FORCE_WRITE, true);
        tx.execute_row(&command, row).await
    }
}

fn same_run(a: &BatchPartInfo, b: &BatchPartInfo) -> bool {
    a.table == b.table && a.state == b.state
}

async fn rollback(tx: Box<dyn StoreTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "transaction rollback failed");
    }
}
