//! # Tidemark Sync Engine
//!
//! Bidirectional, watermark-based synchronization between a client
//! store and a server store.
//!
//! This crate provides:
//! - Change selection into size-bounded batches, tables scanned in parallel
//! - Batch apply with conflict detection and pluggable resolution
//! - Client and server orchestrators with per-peer watermarks
//! - A session agent with a checked state machine and statistics
//! - A transport abstraction and an in-process loopback transport
//! - Typed interceptors able to observe or roll back a session
//!
//! ## Architecture
//!
//! A session is **upload-then-download**:
//! 1. The client captures its timestamp, then selects rows changed since
//!    its last sync
//! 2. The server applies them, captures its timestamp and selects rows
//!    the client has not seen
//! 3. The client applies the server's rows
//! 4. The client advances both watermarks
//!
//! ## Key Invariants
//!
//! - The timestamp is captured before any row is read
//! - Watermarks are written only after every apply has committed
//! - A failed or cancelled session leaves watermarks untouched
//! - Rows a peer wrote through sync are never sent back to it
//! - Batch parts are applied in index order, deletes before upserts

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod agent;
mod applier;
mod config;
mod conflict;
mod error;
mod interceptor;
mod orchestrator;
mod scope;
mod selector;
mod state;
mod transport;

pub use agent::{SyncAgent, SyncSummary};
pub use applier::{ApplyContext, ChangeApplier};
pub use config::{
    ErrorResolutionPolicy, RetryConfig, SyncOptions, TransactionMode, DEFAULT_BATCH_SIZE,
    MAX_CONCURRENT_TABLE_SCANS,
};
pub use conflict::{
    ConflictResolution, ConflictResolutionPolicy, ConflictResolver, ConflictType, SyncConflict,
    SyncSide,
};
pub use error::{BoxError, SessionError, SessionResult, SyncError, SyncResult, SyncStage};
pub use interceptor::{EventKind, Flow, Interceptors, ProgressArgs, SyncEvent};
pub use orchestrator::{
    ClientSyncChanges, LocalOrchestrator, RemoteOrchestrator, ServerScopeInfo, ServerSyncChanges,
};
pub use scope::ScopeInfoStore;
pub use selector::{ChangeSelector, ChangesEstimate, SelectionContext, TableChangesEstimated};
pub use state::{SessionState, SyncStats};
pub use transport::{
    ChangesRequest, ChangesResponse, EnsureScopeRequest, EnsureScopeResponse, EstimateRequest,
    LoopbackTransport, SyncTransport,
};
