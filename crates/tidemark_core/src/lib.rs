//! # Tidemark Core
//!
//! Data model and store abstraction shared by every Tidemark crate.
//!
//! This crate provides:
//! - Tagged column values and schema-described rows
//! - Table, relation and filter declarations with dependency ordering
//! - Scopes and per-peer watermark records
//! - Selection and apply counters
//! - The store collaborator traits the sync engine drives
//! - A change-tracked in-memory reference store
//!
//! ## Change tracking contract
//!
//! A store taking part in synchronization tracks, for every row:
//! - the logical timestamp of the commit that last wrote it
//! - the peer id whose sync wrote it last (`None` for local edits)
//! - whether the row is a tombstone
//!
//! Logical timestamps come from a per-store monotonic clock, so
//! selecting "rows changed after T" never depends on wall-clock time.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changes;
mod error;
mod memory;
mod row;
mod schema;
mod scope;
mod store;
mod value;

pub use changes::{
    DatabaseChangesApplied, DatabaseChangesSelected, TableChangesApplied, TableChangesSelected,
};
pub use error::{CoreError, CoreResult};
pub use memory::MemoryStore;
pub use row::{PrimaryKey, RowState, SyncRow};
pub use schema::{
    ColumnType, FilterClause, FilterParameter, SyncColumn, SyncDirection, SyncFilter, SyncRelation,
    SyncSet, SyncTable, TableName,
};
pub use scope::{ScopeInfoClient, SyncParameter, SyncParameters, SyncScope};
pub use store::{
    params, ChangeStore, DbCommand, DbCommandType, RowStream, ScopeStore, StoreTransaction,
    StoredRow, SyncStore,
};
pub use value::SyncValue;
