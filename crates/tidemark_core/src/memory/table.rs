//! Change-tracked in-memory table.

use crate::error::{CoreError, CoreResult};
use crate::row::{PrimaryKey, RowState, SyncRow};
use crate::schema::SyncTable;
use crate::store::{DbCommand, StoredRow};
use crate::value::SyncValue;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A row image plus its tracking columns.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TrackedRow {
    pub values: Vec<SyncValue>,
    pub tombstone: bool,
    /// Commit timestamp; zero while pending inside a transaction.
    pub timestamp: i64,
    pub update_scope_id: Option<Uuid>,
}

impl TrackedRow {
    pub fn state(&self) -> RowState {
        if self.tombstone {
            RowState::Deleted
        } else {
            RowState::Modified
        }
    }

    pub fn to_sync_row(&self) -> SyncRow {
        SyncRow::new(self.state(), self.values.clone())
    }

    pub fn to_stored(&self) -> StoredRow {
        StoredRow {
            row: self.to_sync_row(),
            timestamp: self.timestamp,
            update_scope_id: self.update_scope_id,
        }
    }
}

/// Rows keyed by primary key, tombstones included.
#[derive(Debug, Clone)]
pub(crate) struct MemoryTable {
    pub schema: SyncTable,
    pk: Vec<usize>,
    unique: Vec<(String, usize)>,
    pub rows: BTreeMap<PrimaryKey, TrackedRow>,
}

impl MemoryTable {
    pub fn new(schema: SyncTable) -> CoreResult<Self> {
        schema.validate()?;
        let pk = schema.primary_key_indices()?;
        let unique = schema
            .unique_columns
            .iter()
            .filter_map(|c| schema.column_index(c).map(|i| (c.clone(), i)))
            .collect();
        Ok(Self {
            schema,
            pk,
            unique,
            rows: BTreeMap::new(),
        })
    }

    pub fn key_of(&self, values: &[SyncValue]) -> PrimaryKey {
        PrimaryKey::new(
            self.pk
                .iter()
                .map(|&i| values.get(i).cloned().unwrap_or(SyncValue::Null))
                .collect(),
        )
    }

    /// Checks a row's shape before it is written.
    pub fn check_row(&self, row: &SyncRow) -> CoreResult<()> {
        match row.state {
            RowState::Modified => row.validate(&self.schema),
            RowState::Deleted if row.values.len() != self.schema.columns.len() => {
                Err(CoreError::ColumnMismatch {
                    table: self.schema.name.clone(),
                    expected: self.schema.columns.len(),
                    actual: row.values.len(),
                })
            }
            RowState::Deleted => Ok(()),
        }
    }

    /// Evaluates a selection command against one tracked row.
    pub fn is_selected(&self, row: &TrackedRow, command: &DbCommand) -> CoreResult<bool> {
        if command.command_type.is_initialized() {
            if row.tombstone {
                return Ok(false);
            }
        } else {
            if let Some(min) = command.min_timestamp() {
                if row.timestamp <= min {
                    return Ok(false);
                }
            }
            if let Some(peer) = command.scope_id() {
                if row.update_scope_id == Some(peer) {
                    return Ok(false);
                }
            }
        }
        for clause in &command.clauses {
            let Some(index) = self.schema.column_index(&clause.column) else {
                return Err(CoreError::invalid_schema(format!(
                    "filter column {} not declared on {}",
                    clause.column, self.schema.name
                )));
            };
            let expected = command.parameter(&clause.parameter).ok_or_else(|| {
                CoreError::MissingFilterParameter {
                    table: self.schema.name.clone(),
                    parameter: clause.parameter.clone(),
                }
            })?;
            let actual = row.values.get(index).unwrap_or(&SyncValue::Null);
            if actual.cmp_total(expected) != Ordering::Equal {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// First selected row strictly after `after` in key order.
    pub fn next_selected(
        &self,
        command: &DbCommand,
        after: Option<&PrimaryKey>,
    ) -> CoreResult<Option<(PrimaryKey, SyncRow)>> {
        use std::ops::Bound;

        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        for (key, row) in self.rows.range((lower, Bound::Unbounded)) {
            if self.is_selected(row, command)? {
                return Ok(Some((key.clone(), row.to_sync_row())));
            }
        }
        Ok(None)
    }

    /// Finds a live row other than `key` already holding a unique value.
    ///
    /// `overlay` holds writes pending in a transaction; they shadow the
    /// committed rows with the same key.
    pub fn unique_violation(
        &self,
        key: &PrimaryKey,
        values: &[SyncValue],
        overlay: Option<&BTreeMap<PrimaryKey, TrackedRow>>,
    ) -> Option<String> {
        for (column, index) in &self.unique {
            let Some(value) = values.get(*index).filter(|v| !v.is_null()) else {
                continue;
            };
            let clashes = |other_key: &PrimaryKey, other: &TrackedRow| {
                other_key != key
                    && !other.tombstone
                    && other
                        .values
                        .get(*index)
                        .is_some_and(|v| v.cmp_total(value) == Ordering::Equal)
            };
            let committed = self.rows.iter().any(|(k, row)| {
                !overlay.is_some_and(|o| o.contains_key(k)) && clashes(k, row)
            });
            let pending = overlay.is_some_and(|o| o.iter().any(|(k, row)| clashes(k, row)));
            if committed || pending {
                return Some(column.clone());
            }
        }
        None
    }
}

/// Whether a sync write may overwrite the current image of a row.
///
/// A write passes when there is nothing to overwrite, when it is forced,
/// when the row has not changed since the sender's watermark, or when
/// the sender itself wrote the row last.
pub(crate) fn write_allowed(existing: Option<&TrackedRow>, command: &DbCommand) -> bool {
    let Some(existing) = existing else {
        return true;
    };
    if command.force_write() {
        return true;
    }
    if let Some(min) = command.min_timestamp() {
        if existing.timestamp <= min {
            return true;
        }
    }
    matches!(
        (command.scope_id(), existing.update_scope_id),
        (Some(sender), Some(writer)) if sender == writer
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, SyncColumn, SyncFilter, TableName};
    use crate::store::{params, DbCommandType};

    fn orders() -> MemoryTable {
        MemoryTable::new(
            SyncTable::new(
                "Orders",
                vec![
                    SyncColumn::new("Id", ColumnType::Integer),
                    SyncColumn::new("CustomerID", ColumnType::Integer),
                    SyncColumn::new("Ref", ColumnType::Text),
                ],
                &["Id"],
            )
            .with_unique("Ref"),
        )
        .unwrap()
    }

    fn tracked(values: Vec<SyncValue>, timestamp: i64, writer: Option<Uuid>) -> TrackedRow {
        TrackedRow {
            values,
            tombstone: false,
            timestamp,
            update_scope_id: writer,
        }
    }

    fn order(id: i64, customer: i64, reference: &str) -> Vec<SyncValue> {
        vec![id.into(), customer.into(), reference.into()]
    }

    #[test]
    fn incremental_selection_respects_watermark_and_writer() {
        let table = orders();
        let peer = Uuid::new_v4();
        let command = DbCommand::new(DbCommandType::SelectChanges, TableName::new("Orders"))
            .with_parameter(params::SYNC_MIN_TIMESTAMP, 10i64)
            .with_parameter(params::SYNC_SCOPE_ID, peer);

        assert!(!table.is_selected(&tracked(order(1, 1, "a"), 10, None), &command).unwrap());
        assert!(table.is_selected(&tracked(order(1, 1, "a"), 11, None), &command).unwrap());
        assert!(!table.is_selected(&tracked(order(1, 1, "a"), 11, Some(peer)), &command).unwrap());
    }

    #[test]
    fn initialized_selection_skips_tombstones() {
        let table = orders();
        let command =
            DbCommand::new(DbCommandType::SelectInitializedChanges, TableName::new("Orders"));
        let mut row = tracked(order(1, 1, "a"), 1, None);
        assert!(table.is_selected(&row, &command).unwrap());
        row.tombstone = true;
        assert!(!table.is_selected(&row, &command).unwrap());
    }

    #[test]
    fn filtered_selection() {
        let table = orders();
        let filter = SyncFilter::new("Orders").with_equals("CustomerID", "CustomerID", ColumnType::Integer);
        let command = DbCommand::new(
            DbCommandType::SelectInitializedChangesWithFilters,
            TableName::new("Orders"),
        )
        .with_filter(Some(&filter));
        assert!(matches!(
            table.is_selected(&tracked(order(1, 5, "a"), 1, None), &command),
            Err(CoreError::MissingFilterParameter { .. })
        ));

        let command = command.with_parameter("CustomerID", 5i64);
        assert!(table.is_selected(&tracked(order(1, 5, "a"), 1, None), &command).unwrap());
        assert!(!table.is_selected(&tracked(order(2, 6, "b"), 1, None), &command).unwrap());
    }

    #[test]
    fn write_condition() {
        let sender = Uuid::new_v4();
        let command = DbCommand::new(DbCommandType::UpdateRow, TableName::new("Orders"))
            .with_parameter(params::SYNC_MIN_TIMESTAMP, 10i64)
            .with_parameter(params::SYNC_SCOPE_ID, sender);

        assert!(write_allowed(None, &command));
        assert!(write_allowed(Some(&tracked(order(1, 1, "a"), 9, None)), &command));
        assert!(!write_allowed(Some(&tracked(order(1, 1, "a"), 11, None)), &command));
        assert!(write_allowed(Some(&tracked(order(1, 1, "a"), 11, Some(sender))), &command));

        let forced = command.with_parameter(params::SYNC_FORCE_WRITE, true);
        assert!(write_allowed(Some(&tracked(order(1, 1, "a"), 11, None)), &forced));
    }

    #[test]
    fn unique_violation_considers_overlay() {
        let mut table = orders();
        let a = order(1, 1, "A-1");
        table.rows.insert(table.key_of(&a), tracked(a, 1, None));

        let b = order(2, 1, "A-1");
        let key_b = table.key_of(&b);
        assert_eq!(table.unique_violation(&key_b, &b, None), Some("Ref".into()));

        // Pending rename of row 1 frees the value.
        let mut overlay = BTreeMap::new();
        let renamed = order(1, 1, "A-2");
        overlay.insert(table.key_of(&renamed), tracked(renamed, 0, None));
        assert_eq!(table.unique_violation(&key_b, &b, Some(&overlay)), None);
    }
}
