//! Rows exchanged between peers.

use crate::error::{CoreError, CoreResult};
use crate::schema::SyncTable;
use crate::value::SyncValue;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Whether a row carries a live image or a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RowState {
    /// Inserted or updated since the watermark.
    Modified,
    /// Deleted since the watermark.
    Deleted,
}

impl RowState {
    /// Tag used in batch part file names.
    pub fn file_tag(&self) -> &'static str {
        match self {
            RowState::Modified => "UPSERTS",
            RowState::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for RowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowState::Modified => f.write_str("modified"),
            RowState::Deleted => f.write_str("deleted"),
        }
    }
}

/// A changed row. Column layout is given by the owning [`SyncTable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRow {
    /// Row state.
    pub state: RowState,
    /// Values in column order.
    pub values: Vec<SyncValue>,
}

impl SyncRow {
    /// Creates a row.
    pub fn new(state: RowState, values: Vec<SyncValue>) -> Self {
        Self { state, values }
    }

    /// Creates a modified row.
    pub fn modified(values: Vec<SyncValue>) -> Self {
        Self::new(RowState::Modified, values)
    }

    /// Creates a deleted row.
    pub fn deleted(values: Vec<SyncValue>) -> Self {
        Self::new(RowState::Deleted, values)
    }

    /// Value at a column position.
    pub fn get(&self, index: usize) -> Option<&SyncValue> {
        self.values.get(index)
    }

    /// Value of a named column.
    pub fn value<'a>(&'a self, table: &SyncTable, column: &str) -> Option<&'a SyncValue> {
        table.column_index(column).and_then(|i| self.values.get(i))
    }

    /// Extracts the primary key given key column positions.
    pub fn key(&self, pk_indices: &[usize]) -> PrimaryKey {
        PrimaryKey(
            pk_indices
                .iter()
                .map(|&i| self.values.get(i).cloned().unwrap_or(SyncValue::Null))
                .collect(),
        )
    }

    /// Checks the row against the table's column count and types.
    pub fn validate(&self, table: &SyncTable) -> CoreResult<()> {
        if self.values.len() != table.columns.len() {
            return Err(CoreError::ColumnMismatch {
                table: table.name.clone(),
                expected: table.columns.len(),
                actual: self.values.len(),
            });
        }
        for (column, value) in table.columns.iter().zip(&self.values) {
            if value.is_null() && !column.nullable && self.state == RowState::Modified {
                return Err(CoreError::invalid_schema(format!(
                    "column {}.{} is not nullable",
                    table.name, column.name
                )));
            }
            if !column.column_type.accepts(value) {
                return Err(CoreError::invalid_schema(format!(
                    "column {}.{} does not accept {} values",
                    table.name,
                    column.name,
                    value.type_name()
                )));
            }
        }
        Ok(())
    }
}

/// Primary key tuple with a total order.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKey(pub Vec<SyncValue>);

impl PrimaryKey {
    /// Creates a key from values.
    pub fn new(values: Vec<SyncValue>) -> Self {
        Self(values)
    }
}

impl Eq for PrimaryKey {}

impl PartialOrd for PrimaryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrimaryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(&other.0) {
            match a.cmp_total(b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(")")
    }
}
