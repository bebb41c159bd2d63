//! On-disk record format of a batch part.
//!
//! A part is a sequence of CBOR records:
//!
//! ```text
//! Header { format_version, table, state, columns }
//! Row(SyncRow) *
//! Trailer { rows_count }
//! ```
//!
//! The trailer is written last, so a part cut short by a crash never
//! validates.

use crate::error::{BatchError, BatchResult};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tidemark_core::{ColumnType, RowState, SyncRow, SyncTable, TableName};

/// Current part format version.
pub const FORMAT_VERSION: u16 = 1;

/// Column descriptor stored in a part header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnHeader {
    /// Column name.
    pub name: String,
    /// Column type.
    pub column_type: ColumnType,
}

/// First record of every part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartHeader {
    /// Format version.
    pub format_version: u16,
    /// Table the rows belong to.
    pub table: TableName,
    /// State shared by every row of the part.
    pub state: RowState,
    /// Column list in row order.
    pub columns: Vec<ColumnHeader>,
}

impl PartHeader {
    /// Header for a table and row state.
    pub fn for_table(table: &SyncTable, state: RowState) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            table: table.name.clone(),
            state,
            columns: table
                .columns
                .iter()
                .map(|c| ColumnHeader {
                    name: c.name.clone(),
                    column_type: c.column_type,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum BatchRecord {
    Header(PartHeader),
    Row(SyncRow),
    Trailer { rows_count: u64 },
}

pub(crate) fn encode_record(record: &BatchRecord) -> BatchResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(record, &mut buf).map_err(|e| BatchError::Encode(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn decode_record<T: AsRef<[u8]>>(
    cursor: &mut Cursor<T>,
    part: &str,
) -> BatchResult<BatchRecord> {
    ciborium::from_reader(cursor).map_err(|e| BatchError::corrupt(part, e.to_string()))
}
