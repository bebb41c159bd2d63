//! # Tidemark Batch
//!
//! Size-bounded batch parts carrying selected rows between peers.
//!
//! This crate provides:
//! - [`BatchWriter`] / [`TableBatchWriter`]: split a table's row stream
//!   into parts by encoded size, modified and deleted rows apart
//! - [`BatchPartReader`]: decode a part and validate its framing
//! - [`BatchInfo`] / [`BatchPartInfo`]: batch metadata, validation and
//!   conversion between file-backed and in-memory form
//!
//! ## Invariants
//!
//! - A finalized batch has no empty part and indexes its parts `0..n`
//! - Only the last part is flagged `is_last_batch`
//! - An empty batch keeps no directory on disk
//! - A part file only gets its final name once it is complete

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod format;
mod info;
mod reader;
mod writer;

pub use error::{BatchError, BatchResult};
pub use format::{ColumnHeader, PartHeader, FORMAT_VERSION};
pub use info::{BatchInfo, BatchPartInfo, PartPayload};
pub use reader::BatchPartReader;
pub use writer::{BatchWriter, ClosedPart, PartClosed, TableBatchWriter};
