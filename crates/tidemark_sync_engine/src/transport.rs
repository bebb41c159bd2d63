//! Transport layer between a client agent and a server.

use crate::conflict::ConflictResolutionPolicy;
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::RemoteOrchestrator;
use crate::selector::ChangesEstimate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tidemark_batch::BatchInfo;
use tidemark_core::{
    DatabaseChangesApplied, DatabaseChangesSelected, ScopeInfoClient, SyncScope,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Asks the server for a provisioned scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsureScopeRequest {
    /// Scope name.
    pub scope_name: String,
}

/// Scope definition and server identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsureScopeResponse {
    /// Scope provisioned on the server.
    pub scope: SyncScope,
    /// Server peer id.
    pub server_id: Uuid,
    /// Server conflict policy.
    pub conflict_policy: ConflictResolutionPolicy,
}

/// Client upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesRequest {
    /// Client record with its watermarks and bindings.
    pub client: ScopeInfoClient,
    /// Client timestamp captured before selection.
    pub client_timestamp: i64,
    /// Uploaded rows.
    pub batch: BatchInfo,
    /// Client selection counters.
    pub changes_selected: DatabaseChangesSelected,
}

/// Server answer to an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    /// Server timestamp captured before its selection.
    pub server_timestamp: i64,
    /// Rows for the client.
    pub batch: BatchInfo,
    /// Server selection counters.
    pub changes_selected: DatabaseChangesSelected,
    /// Outcome of applying the upload on the server.
    pub changes_applied: DatabaseChangesApplied,
}

/// Asks how many rows the next download would carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateRequest {
    /// Client record with its watermarks and bindings.
    pub client: ScopeInfoClient,
}

/// A sync transport carries session messages to the server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, in-process loopback, fault-injecting mocks).
/// Batches cross it in their in-memory form.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Fetches the server's scope definition.
    async fn ensure_scope(&self, request: EnsureScopeRequest) -> SyncResult<EnsureScopeResponse>;

    /// Uploads the client's batch and downloads the server's.
    async fn apply_then_get_changes(
        &self,
        request: ChangesRequest,
        cancel: &CancellationToken,
    ) -> SyncResult<ChangesResponse>;

    /// Counts pending server changes for a client.
    async fn get_estimated_changes_count(&self, request: EstimateRequest) -> SyncResult<ChangesEstimate>;
}

/// In-process transport calling a [`RemoteOrchestrator`] directly.
///
/// Batches are moved through memory both ways, so each side keeps its
/// own batch directory.
#[derive(Debug)]
pub struct LoopbackTransport {
    server: Arc<RemoteOrchestrator>,
    connected: AtomicBool,
}

impl LoopbackTransport {
    /// Creates a connected transport.
    pub fn new(server: Arc<RemoteOrchestrator>) -> Self {
        Self {
            server,
            connected: AtomicBool::new(true),
        }
    }

    /// Server behind the transport.
    pub fn server(&self) -> &Arc<RemoteOrchestrator> {
        &self.server
    }

    /// Sets the connected state. A disconnected transport fails every
    /// call with a retryable error.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Checks if the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn check_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::transport_retryable("server unreachable"))
        }
    }
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn ensure_scope(&self, request: EnsureScopeRequest) -> SyncResult<EnsureScopeResponse> {
        self.check_connected()?;
        let info = self
            .server
            .ensure_scope(&request.scope_name)
            .await
            .map_err(|e| SyncError::Remote(Box::new(e)))?;
        Ok(EnsureScopeResponse {
            scope: info.scope,
            server_id: info.server_id,
            conflict_policy: info.conflict_policy,
        })
    }

    async fn apply_then_get_changes(
        &self,
        request: ChangesRequest,
        cancel: &CancellationToken,
    ) -> SyncResult<ChangesResponse> {
        self.check_connected()?;
        let upload = request
            .batch
            .into_memory()
            .await
            .map_err(SyncError::from_batch)?;
        let changes = self
            .server
            .apply_then_get_changes(&request.client, upload, cancel)
            .await
            .map_err(|e| SyncError::Remote(Box::new(e)))?;
        let download = changes
            .batch
            .into_memory()
            .await
            .map_err(SyncError::from_batch)?;
        Ok(ChangesResponse {
            server_timestamp: changes.server_timestamp,
            batch: download,
            changes_selected: changes.changes_selected,
            changes_applied: changes.changes_applied,
        })
    }

    async fn get_estimated_changes_count(&self, request: EstimateRequest) -> SyncResult<ChangesEstimate> {
        self.check_connected()?;
        self.server
            .get_estimated_changes_count(&request.client)
            .await
            .map_err(|e| SyncError::Remote(Box::new(e)))
    }
}
