//! Batch and batch part metadata.

use crate::error::{BatchError, BatchResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tidemark_core::{RowState, TableName};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Where a part's bytes live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartPayload {
    /// File name inside the batch directory.
    File(String),
    /// Encoded part kept in memory.
    Memory(Bytes),
}

/// One size-bounded slice of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPartInfo {
    /// Table of every row in the part.
    pub table: TableName,
    /// State of every row in the part.
    pub state: RowState,
    /// Position in apply order.
    pub index: u32,
    /// Rows in the part.
    pub rows_count: u64,
    /// Encoded size in bytes.
    pub bytes: u64,
    /// Set on the part with the highest index.
    pub is_last_batch: bool,
    /// Content location.
    pub payload: PartPayload,
}

impl BatchPartInfo {
    /// Final file name of a part.
    pub fn file_name(table: &TableName, index: u32, state: RowState) -> String {
        format!("{table}_{index:04}_{}.batch", state.file_tag())
    }

    /// Human readable identification for diagnostics.
    pub fn describe(&self) -> String {
        match &self.payload {
            PartPayload::File(name) => name.clone(),
            PartPayload::Memory(_) => format!("{}#{} ({})", self.table, self.index, self.state),
        }
    }
}

/// A complete set of parts produced by one selection pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
    /// Batch identifier; names the batch directory.
    pub id: Uuid,
    /// Batch directory, `None` for in-memory batches.
    pub directory: Option<PathBuf>,
    /// Parts in index order.
    pub parts: Vec<BatchPartInfo>,
    /// Rows across every part.
    pub rows_count: u64,
}

impl BatchInfo {
    /// An in-memory batch with no parts.
    pub fn empty() -> Self {
        Self {
            id: Uuid::new_v4(),
            directory: None,
            parts: Vec::new(),
            rows_count: 0,
        }
    }

    /// Returns true if the batch holds no row.
    pub fn is_empty(&self) -> bool {
        self.rows_count == 0
    }

    /// Returns true if every part lives in memory.
    pub fn is_in_memory(&self) -> bool {
        self.parts
            .iter()
            .all(|p| matches!(p.payload, PartPayload::Memory(_)))
    }

    /// Checks part indexing and counts.
    ///
    /// Indices must be unique, contiguous from zero and stored in
    /// ascending order; only the last part carries `is_last_batch`;
    /// no part is empty.
    pub fn validate(&self) -> BatchResult<()> {
        let mut seen = HashSet::new();
        for part in &self.parts {
            if !seen.insert(part.index) {
                return Err(BatchError::IndexCollision { index: part.index });
            }
        }
        let mut total = 0u64;
        for (position, part) in self.parts.iter().enumerate() {
            if part.index as usize != position {
                return Err(BatchError::corrupt(
                    part.describe(),
                    format!("index {} found at position {position}", part.index),
                ));
            }
            if part.rows_count == 0 {
                return Err(BatchError::corrupt(part.describe(), "part holds no row"));
            }
            if part.is_last_batch != (position + 1 == self.parts.len()) {
                return Err(BatchError::corrupt(part.describe(), "misplaced last-batch flag"));
            }
            part.table
                .validate()
                .map_err(|e| BatchError::corrupt(part.describe(), e.to_string()))?;
            if let PartPayload::File(name) = &part.payload {
                if self.directory.is_none() {
                    return Err(BatchError::corrupt(part.describe(), "file part without directory"));
                }
                if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
                    return Err(BatchError::corrupt(part.describe(), "part file name is not a plain name"));
                }
            }
            total += part.rows_count;
        }
        if total != self.rows_count {
            return Err(BatchError::corrupt(
                format!("batch {}", self.id),
                format!("parts hold {total} rows, batch declares {}", self.rows_count),
            ));
        }
        Ok(())
    }

    /// Path of a file part.
    pub fn part_path(&self, part: &BatchPartInfo) -> Option<PathBuf> {
        match (&self.directory, &part.payload) {
            (Some(dir), PartPayload::File(name)) => Some(dir.join(name)),
            _ => None,
        }
    }

    /// Loads the encoded content of a part.
    pub async fn load_part(&self, part: &BatchPartInfo) -> BatchResult<Bytes> {
        match &part.payload {
            PartPayload::Memory(bytes) => Ok(bytes.clone()),
            PartPayload::File(name) => {
                let path = self
                    .part_path(part)
                    .ok_or_else(|| BatchError::corrupt(name.as_str(), "file part without directory"))?;
                match tokio::fs::read(&path).await {
                    Ok(bytes) => Ok(Bytes::from(bytes)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Err(BatchError::corrupt(name.as_str(), "part file missing"))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Moves every part in memory and removes the batch directory.
    pub async fn into_memory(self) -> BatchResult<BatchInfo> {
        self.validate()?;
        let mut parts = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let bytes = self.load_part(part).await?;
            parts.push(BatchPartInfo {
                payload: PartPayload::Memory(bytes),
                ..part.clone()
            });
        }
        self.delete().await?;
        Ok(BatchInfo {
            id: self.id,
            directory: None,
            parts,
            rows_count: self.rows_count,
        })
    }

    /// Writes every in-memory part under `root/<id>` and returns the file-backed batch.
    ///
    /// An empty batch stays in memory: no directory is created.
    pub async fn persist_to(self, root: &Path) -> BatchResult<BatchInfo> {
        self.validate()?;
        if self.parts.is_empty() {
            return Ok(BatchInfo {
                directory: None,
                ..self
            });
        }
        let directory = root.join(self.id.to_string());
        tokio::fs::create_dir_all(&directory).await?;
        let mut parts = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let bytes = self.load_part(part).await?;
            let name = BatchPartInfo::file_name(&part.table, part.index, part.state);
            let tmp = directory.join(format!("{name}.tmp"));
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, directory.join(&name)).await?;
            parts.push(BatchPartInfo {
                payload: PartPayload::File(name),
                ..part.clone()
            });
        }
        Ok(BatchInfo {
            id: self.id,
            directory: Some(directory),
            parts,
            rows_count: self.rows_count,
        })
    }

    /// Removes the batch directory, if any.
    pub async fn delete(&self) -> BatchResult<()> {
        if let Some(dir) = &self.directory {
            remove_dir_if_exists(dir).await?;
            debug!(batch = %self.id, "batch directory removed");
        }
        Ok(())
    }
}

pub(crate) async fn remove_dir_if_exists(dir: &Path) -> BatchResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
