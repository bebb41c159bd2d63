//! Batch writer.
//!
//! A [`BatchWriter`] owns one batch directory. Each selected table gets a
//! [`TableBatchWriter`] holding two open parts, one for modified rows and
//! one for deleted rows. A part closes once its encoded size reaches the
//! batch size, or when the table is finished. Parts are written under a
//! temporary name and only renamed to their final name by
//! [`BatchWriter::finalize`], which also drops empty parts, orders the
//! rest for apply and numbers them.

use crate::error::{BatchError, BatchResult};
use crate::format::{encode_record, BatchRecord, PartHeader};
use crate::info::{remove_dir_if_exists, BatchInfo, BatchPartInfo, PartPayload};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tidemark_core::{RowState, SyncRow, SyncTable, TableName};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, trace};
use uuid::Uuid;

/// Metadata of a part that just closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartClosed {
    /// Table.
    pub table: TableName,
    /// Row state.
    pub state: RowState,
    /// Rows in the part.
    pub rows_count: u64,
    /// Encoded size.
    pub bytes: u64,
}

enum PartContent {
    TempFile(PathBuf),
    Memory(Bytes),
}

/// A closed part awaiting finalization.
pub struct ClosedPart {
    table: TableName,
    state: RowState,
    position: usize,
    sequence: u32,
    rows_count: u64,
    bytes: u64,
    content: PartContent,
}

impl ClosedPart {
    /// Rows in the part.
    pub fn rows_count(&self) -> u64 {
        self.rows_count
    }

    /// Row state of the part.
    pub fn state(&self) -> RowState {
        self.state
    }

    fn summary(&self) -> PartClosed {
        PartClosed {
            table: self.table.clone(),
            state: self.state,
            rows_count: self.rows_count,
            bytes: self.bytes,
        }
    }
}

enum SinkTarget {
    File { path: PathBuf, out: BufWriter<File> },
    Memory(Vec<u8>),
}

struct PartSink {
    state: RowState,
    sequence: u32,
    rows_count: u64,
    bytes: u64,
    target: SinkTarget,
}

impl PartSink {
    async fn open(
        directory: Option<&Path>,
        header: &PartHeader,
        sequence: u32,
    ) -> BatchResult<Self> {
        let target = match directory {
            Some(dir) => {
                let path = dir.join(format!(
                    "{}_{}_{sequence:04}.tmp",
                    header.table,
                    header.state.file_tag()
                ));
                let file = File::create(&path).await?;
                SinkTarget::File {
                    path,
                    out: BufWriter::new(file),
                }
            }
            None => SinkTarget::Memory(Vec::new()),
        };
        let mut sink = Self {
            state: header.state,
            sequence,
            rows_count: 0,
            bytes: 0,
            target,
        };
        sink.append(&encode_record(&BatchRecord::Header(header.clone()))?)
            .await?;
        Ok(sink)
    }

    async fn append(&mut self, encoded: &[u8]) -> BatchResult<()> {
        match &mut self.target {
            SinkTarget::File { out, .. } => out.write_all(encoded).await?,
            SinkTarget::Memory(buf) => buf.extend_from_slice(encoded),
        }
        self.bytes += encoded.len() as u64;
        Ok(())
    }

    async fn close(mut self, table: &TableName, position: usize) -> BatchResult<ClosedPart> {
        let trailer = encode_record(&BatchRecord::Trailer {
            rows_count: self.rows_count,
        })?;
        self.append(&trailer).await?;
        let content = match self.target {
            SinkTarget::File { path, mut out } => {
                out.flush().await?;
                out.into_inner().sync_all().await?;
                PartContent::TempFile(path)
            }
            SinkTarget::Memory(buf) => PartContent::Memory(Bytes::from(buf)),
        };
        trace!(table = %table, state = %self.state, rows = self.rows_count, bytes = self.bytes, "part closed");
        Ok(ClosedPart {
            table: table.clone(),
            state: self.state,
            position,
            sequence: self.sequence,
            rows_count: self.rows_count,
            bytes: self.bytes,
            content,
        })
    }
}

/// Writer for one batch.
#[derive(Debug)]
pub struct BatchWriter {
    id: Uuid,
    directory: Option<PathBuf>,
    batch_size: usize,
}

impl BatchWriter {
    /// Creates a batch under `root/<id>`.
    ///
    /// A `batch_size` of zero disables batching: parts stay in memory and
    /// each table writes at most one part per row state.
    pub async fn create(root: &Path, batch_size: usize) -> BatchResult<Self> {
        let id = Uuid::new_v4();
        let directory = if batch_size == 0 {
            None
        } else {
            let dir = root.join(id.to_string());
            tokio::fs::create_dir_all(&dir).await?;
            Some(dir)
        };
        debug!(batch = %id, directory = ?directory, batch_size, "batch created");
        Ok(Self {
            id,
            directory,
            batch_size,
        })
    }

    /// Batch identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Batch directory, `None` in memory mode.
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Opens the writer of a table.
    ///
    /// `position` is the table's place in dependency order.
    pub async fn table_writer(&self, table: &SyncTable, position: usize) -> BatchResult<TableBatchWriter> {
        let modified_header = PartHeader::for_table(table, RowState::Modified);
        let deleted_header = PartHeader::for_table(table, RowState::Deleted);
        let directory = self.directory.clone();
        let modified = PartSink::open(directory.as_deref(), &modified_header, 0).await?;
        let deleted = PartSink::open(directory.as_deref(), &deleted_header, 0).await?;
        Ok(TableBatchWriter {
            table: table.name.clone(),
            position,
            batch_size: self.batch_size,
            directory,
            modified_header,
            deleted_header,
            modified,
            deleted,
            closed: Vec::new(),
        })
    }

    /// Drops empty parts, orders and numbers the rest, and renames them
    /// to their final names.
    ///
    /// Deleted parts come first in reverse dependency order, then
    /// modified parts in dependency order, so children are deleted
    /// before their parents and parents are written before their
    /// children. A batch without rows keeps no directory.
    pub async fn finalize(self, parts: Vec<ClosedPart>) -> BatchResult<BatchInfo> {
        let mut kept = Vec::with_capacity(parts.len());
        for part in parts {
            if part.rows_count == 0 {
                if let PartContent::TempFile(path) = &part.content {
                    tokio::fs::remove_file(path).await?;
                }
            } else {
                kept.push(part);
            }
        }

        kept.sort_by_key(|p| match p.state {
            RowState::Deleted => (0u8, usize::MAX - p.position, p.sequence),
            RowState::Modified => (1u8, p.position, p.sequence),
        });

        let rows_count: u64 = kept.iter().map(|p| p.rows_count).sum();
        if rows_count == 0 {
            if let Some(dir) = &self.directory {
                remove_dir_if_exists(dir).await?;
            }
            debug!(batch = %self.id, "empty batch discarded");
            return Ok(BatchInfo {
                id: self.id,
                directory: None,
                parts: Vec::new(),
                rows_count: 0,
            });
        }

        let last = kept.len() - 1;
        let mut infos = Vec::with_capacity(kept.len());
        for (index, part) in kept.into_iter().enumerate() {
            let index = u32::try_from(index)
                .map_err(|_| BatchError::Encode("too many batch parts".into()))?;
            let payload = match part.content {
                PartContent::TempFile(tmp) => {
                    let name = BatchPartInfo::file_name(&part.table, index, part.state);
                    let dir = tmp.parent().map(Path::to_path_buf).unwrap_or_default();
                    tokio::fs::rename(&tmp, dir.join(&name)).await?;
                    PartPayload::File(name)
                }
                PartContent::Memory(bytes) => PartPayload::Memory(bytes),
            };
            infos.push(BatchPartInfo {
                table: part.table,
                state: part.state,
                index,
                rows_count: part.rows_count,
                bytes: part.bytes,
                is_last_batch: index as usize == last,
                payload,
            });
        }

        debug!(batch = %self.id, parts = infos.len(), rows = rows_count, "batch finalized");
        Ok(BatchInfo {
            id: self.id,
            directory: self.directory,
            parts: infos,
            rows_count,
        })
    }

    /// Removes everything written so far.
    pub async fn discard(self) -> BatchResult<()> {
        if let Some(dir) = &self.directory {
            remove_dir_if_exists(dir).await?;
        }
        debug!(batch = %self.id, "batch discarded");
        Ok(())
    }
}

/// Writes the rows of one table.
pub struct TableBatchWriter {
    table: TableName,
    position: usize,
    batch_size: usize,
    directory: Option<PathBuf>,
    modified_header: PartHeader,
    deleted_header: PartHeader,
    modified: PartSink,
    deleted: PartSink,
    closed: Vec<ClosedPart>,
}

impl TableBatchWriter {
    /// Appends a row to the part of its state.
    ///
    /// Returns the metadata of the part when the row made it exceed the
    /// batch size; a fresh part is opened in its place.
    pub async fn write_row(&mut self, row: &SyncRow) -> BatchResult<Option<PartClosed>> {
        let encoded = encode_record(&BatchRecord::Row(row.clone()))?;
        let sink = match row.state {
            RowState::Modified => &mut self.modified,
            RowState::Deleted => &mut self.deleted,
        };
        sink.append(&encoded).await?;
        sink.rows_count += 1;

        if self.batch_size == 0 || sink.bytes <= self.batch_size as u64 {
            return Ok(None);
        }

        let (header, sink) = match row.state {
            RowState::Modified => (&self.modified_header, &mut self.modified),
            RowState::Deleted => (&self.deleted_header, &mut self.deleted),
        };
        let fresh = PartSink::open(self.directory.as_deref(), header, sink.sequence + 1).await?;
        let full = std::mem::replace(sink, fresh);
        let closed = full.close(&self.table, self.position).await?;
        let summary = closed.summary();
        self.closed.push(closed);
        Ok(Some(summary))
    }

    /// Closes both open parts and returns every part of the table,
    /// empty ones included.
    pub async fn finish(mut self) -> BatchResult<Vec<ClosedPart>> {
        let modified = self.modified.close(&self.table, self.position).await?;
        let deleted = self.deleted.close(&self.table, self.position).await?;
        self.closed.push(modified);
        self.closed.push(deleted);
        Ok(self.closed)
    }

    /// Table being written.
    pub fn table(&self) -> &TableName {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::{ColumnType, SyncColumn, SyncValue};

    fn table(name: &str) -> SyncTable {
        SyncTable::new(
            name,
            vec![
                SyncColumn::new("Id", ColumnType::Integer),
                SyncColumn::new("Payload", ColumnType::Text),
            ],
            &["Id"],
        )
    }

    fn row(id: i64, state: RowState) -> SyncRow {
        SyncRow::new(state, vec![id.into(), SyncValue::Text("x".repeat(64))])
    }

    async fn write_table(
        writer: &BatchWriter,
        table: &SyncTable,
        position: usize,
        rows: &[SyncRow],
    ) -> (Vec<ClosedPart>, usize) {
        let mut tw = writer.table_writer(table, position).await.unwrap();
        let mut closed_events = 0;
        for r in rows {
            if tw.write_row(r).await.unwrap().is_some() {
                closed_events += 1;
            }
        }
        (tw.finish().await.unwrap(), closed_events)
    }

    #[tokio::test]
    async fn splits_parts_by_size() {
        let root = tempfile::tempdir().unwrap();
        let writer = BatchWriter::create(root.path(), 256).await.unwrap();
        let rows: Vec<SyncRow> = (0..10).map(|i| row(i, RowState::Modified)).collect();
        let (parts, closed_events) = write_table(&writer, &table("Customer"), 0, &rows).await;
        assert!(closed_events >= 2);

        let batch = writer.finalize(parts).await.unwrap();
        batch.validate().unwrap();
        assert_eq!(batch.rows_count, 10);
        assert!(batch.parts.len() >= 3);
        assert!(batch.parts.iter().all(|p| p.state == RowState::Modified));
        for part in &batch.parts {
            assert!(batch.part_path(part).unwrap().exists());
        }
        // No temporary file survives finalization.
        let dir = batch.directory.clone().unwrap();
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(entry.file_name().to_string_lossy().ends_with(".batch"));
        }
    }

    #[tokio::test]
    async fn part_closes_only_past_the_threshold() {
        let customer = table("Customer");
        let header = encode_record(&BatchRecord::Header(PartHeader::for_table(&customer, RowState::Modified)))
            .unwrap()
            .len();
        let one_row = encode_record(&BatchRecord::Row(row(1, RowState::Modified)))
            .unwrap()
            .len();
        let root = tempfile::tempdir().unwrap();
        let writer = BatchWriter::create(root.path(), header + one_row).await.unwrap();
        let mut tw = writer.table_writer(&customer, 0).await.unwrap();

        // Exactly at the threshold: the part stays open.
        assert!(tw.write_row(&row(1, RowState::Modified)).await.unwrap().is_none());
        let closed = tw.write_row(&row(2, RowState::Modified)).await.unwrap().unwrap();
        assert_eq!(closed.rows_count, 2);
    }

    #[tokio::test]
    async fn orders_deletes_before_upserts_by_dependency() {
        let root = tempfile::tempdir().unwrap();
        let writer = BatchWriter::create(root.path(), 1 << 20).await.unwrap();
        let parent = table("Customer");
        let child = table("Orders");
        let (mut parts, _) = write_table(
            &writer,
            &parent,
            0,
            &[row(1, RowState::Modified), row(2, RowState::Deleted)],
        )
        .await;
        let (child_parts, _) = write_table(
            &writer,
            &child,
            1,
            &[row(10, RowState::Modified), row(11, RowState::Deleted)],
        )
        .await;
        parts.extend(child_parts);

        let batch = writer.finalize(parts).await.unwrap();
        let order: Vec<(String, RowState)> = batch
            .parts
            .iter()
            .map(|p| (p.table.to_string(), p.state))
            .collect();
        assert_eq!(
            order,
            vec![
                ("Orders".into(), RowState::Deleted),
                ("Customer".into(), RowState::Deleted),
                ("Customer".into(), RowState::Modified),
                ("Orders".into(), RowState::Modified),
            ]
        );
        assert!(batch.parts[3].is_last_batch);
        assert_eq!(
            batch.parts[0].payload,
            PartPayload::File("Orders_0000_DELETED.batch".into())
        );
    }

    #[tokio::test]
    async fn empty_batch_leaves_no_directory() {
        let root = tempfile::tempdir().unwrap();
        let writer = BatchWriter::create(root.path(), 1024).await.unwrap();
        let dir = writer.directory().unwrap().to_path_buf();
        let (parts, _) = write_table(&writer, &table("Customer"), 0, &[]).await;
        assert_eq!(parts.len(), 2);

        let batch = writer.finalize(parts).await.unwrap();
        assert!(batch.is_empty());
        assert!(batch.parts.is_empty());
        assert!(batch.directory.is_none());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn empty_state_part_is_dropped() {
        let root = tempfile::tempdir().unwrap();
        let writer = BatchWriter::create(root.path(), 1024).await.unwrap();
        let (parts, _) = write_table(&writer, &table("Customer"), 0, &[row(1, RowState::Modified)]).await;
        let batch = writer.finalize(parts).await.unwrap();
        assert_eq!(batch.parts.len(), 1);
        let dir = batch.directory.clone().unwrap();
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn memory_mode_writes_single_part_per_state() {
        let root = tempfile::tempdir().unwrap();
        let writer = BatchWriter::create(root.path(), 0).await.unwrap();
        assert!(writer.directory().is_none());
        let rows: Vec<SyncRow> = (0..50).map(|i| row(i, RowState::Modified)).collect();
        let (parts, closed_events) = write_table(&writer, &table("Customer"), 0, &rows).await;
        assert_eq!(closed_events, 0);
        let batch = writer.finalize(parts).await.unwrap();
        assert_eq!(batch.parts.len(), 1);
        assert!(batch.is_in_memory());
        assert_eq!(batch.rows_count, 50);
    }

    #[tokio::test]
    async fn discard_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let writer = BatchWriter::create(root.path(), 64).await.unwrap();
        let dir = writer.directory().unwrap().to_path_buf();
        let mut tw = writer.table_writer(&table("Customer"), 0).await.unwrap();
        tw.write_row(&row(1, RowState::Modified)).await.unwrap();
        drop(tw);
        writer.discard().await.unwrap();
        assert!(!dir.exists());
    }

    async fn write_and_read_back(batch_size: usize, payloads: &[String]) -> (BatchInfo, Vec<SyncRow>) {
        let root = tempfile::tempdir().unwrap();
        let writer = BatchWriter::create(root.path(), batch_size).await.unwrap();
        let rows: Vec<SyncRow> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| SyncRow::modified(vec![(i as i64).into(), p.as_str().into()]))
            .collect();
        let (parts, _) = write_table(&writer, &table("Customer"), 0, &rows).await;
        let batch = writer.finalize(parts).await.unwrap().into_memory().await.unwrap();
        let mut read = Vec::new();
        for part in &batch.parts {
            let mut reader = crate::BatchPartReader::open(&batch, part).await.unwrap();
            while let Some(row) = reader.next_row().unwrap() {
                read.push(row);
            }
        }
        assert_eq!(read, rows);
        (batch, read)
    }

    proptest::proptest! {
        #[test]
        fn rows_survive_any_part_size(
            batch_size in 0usize..2048,
            payloads in proptest::collection::vec(".{0,80}", 0..40),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (batch, read) = runtime.block_on(write_and_read_back(batch_size, &payloads));
            batch.validate().unwrap();
            proptest::prop_assert_eq!(batch.rows_count as usize, read.len());
            proptest::prop_assert!(batch.parts.len() <= payloads.len());
            if batch_size == 0 {
                proptest::prop_assert!(batch.parts.len() <= 1);
            }
        }
    }
}
