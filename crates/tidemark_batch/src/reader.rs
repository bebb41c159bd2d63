//! Batch part reader.

use crate::error::{BatchError, BatchResult};
use crate::format::{decode_record, BatchRecord, PartHeader, FORMAT_VERSION};
use crate::info::{BatchInfo, BatchPartInfo};
use bytes::Bytes;
use std::io::Cursor;
use tidemark_core::{SyncRow, SyncTable};

/// Reads the rows of one part, validating framing as it goes.
///
/// Parts are size-bounded, so the encoded part is loaded whole and rows
/// are decoded one at a time. The trailer row count, the absence of
/// trailing bytes and the state of every row are checked; any mismatch
/// is reported as corruption.
#[derive(Debug)]
pub struct BatchPartReader {
    name: String,
    header: PartHeader,
    cursor: Cursor<Bytes>,
    expected_rows: u64,
    rows_read: u64,
    finished: bool,
}

impl BatchPartReader {
    /// Opens a part of a batch.
    pub async fn open(batch: &BatchInfo, part: &BatchPartInfo) -> BatchResult<Self> {
        let bytes = batch.load_part(part).await?;
        Self::from_bytes(bytes, part)
    }

    /// Reads a part from its encoded bytes.
    pub fn from_bytes(bytes: Bytes, part: &BatchPartInfo) -> BatchResult<Self> {
        let name = part.describe();
        let mut cursor = Cursor::new(bytes);
        let header = match decode_record(&mut cursor, &name)? {
            BatchRecord::Header(header) => header,
            _ => return Err(BatchError::corrupt(name, "part does not start with a header")),
        };
        if header.format_version != FORMAT_VERSION {
            return Err(BatchError::corrupt(
                name,
                format!("unsupported format version {}", header.format_version),
            ));
        }
        if header.table != part.table || header.state != part.state {
            return Err(BatchError::corrupt(
                name,
                format!(
                    "header describes {} {} rows, metadata {} {} rows",
                    header.table, header.state, part.table, part.state
                ),
            ));
        }
        Ok(Self {
            name,
            header,
            cursor,
            expected_rows: part.rows_count,
            rows_read: 0,
            finished: false,
        })
    }

    /// Part header.
    pub fn header(&self) -> &PartHeader {
        &self.header
    }

    /// Checks the part's column list against a local table.
    pub fn check_schema(&self, table: &SyncTable) -> BatchResult<()> {
        let local: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        let remote: Vec<&str> = self.header.columns.iter().map(|c| c.name.as_str()).collect();
        if local != remote {
            return Err(BatchError::SchemaMismatch {
                table: table.name.clone(),
                reason: format!("local columns {local:?}, batch columns {remote:?}"),
            });
        }
        Ok(())
    }

    /// Next row, or `None` after a valid trailer.
    pub fn next_row(&mut self) -> BatchResult<Option<SyncRow>> {
        if self.finished {
            return Ok(None);
        }
        match decode_record(&mut self.cursor, &self.name)? {
            BatchRecord::Row(row) => {
                if row.state != self.header.state {
                    return Err(BatchError::corrupt(
                        self.name.as_str(),
                        format!("{} row inside a {} part", row.state, self.header.state),
                    ));
                }
                if row.values.len() != self.header.columns.len() {
                    return Err(BatchError::corrupt(
                        self.name.as_str(),
                        format!(
                            "row has {} values for {} columns",
                            row.values.len(),
                            self.header.columns.len()
                        ),
                    ));
                }
                self.rows_read += 1;
                Ok(Some(row))
            }
            BatchRecord::Trailer { rows_count } => {
                if rows_count != self.rows_read || rows_count != self.expected_rows {
                    return Err(BatchError::corrupt(
                        self.name.as_str(),
                        format!(
                            "trailer declares {rows_count} rows, read {}, metadata {}",
                            self.rows_read, self.expected_rows
                        ),
                    ));
                }
                if self.cursor.position() != self.cursor.get_ref().len() as u64 {
                    return Err(BatchError::corrupt(self.name.as_str(), "bytes after trailer"));
                }
                self.finished = true;
                Ok(None)
            }
            BatchRecord::Header(_) => Err(BatchError::corrupt(self.name.as_str(), "second header")),
        }
    }
}

impl Iterator for BatchPartReader {
    type Item = BatchResult<SyncRow>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
