//! Client side of a session.

use super::{discard_batch, ClientSyncChanges, OrchestratorCore, ServerSyncChanges};
use crate::applier::ApplyContext;
use crate::config::SyncOptions;
use crate::conflict::{ConflictResolutionPolicy, ConflictResolver, SyncSide};
use crate::error::{SessionResult, StageExt, SyncError, SyncStage};
use crate::interceptor::Interceptors;
use crate::scope::ScopeInfoStore;
use crate::selector::{ChangesEstimate, SelectionContext};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tidemark_core::{
    ChangeStore, DatabaseChangesApplied, ScopeInfoClient, SyncParameters, SyncScope, SyncStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Drives the client store: selects uploads, applies downloads and
/// advances the client's watermarks.
pub struct LocalOrchestrator {
    core: OrchestratorCore,
}

impl LocalOrchestrator {
    /// Creates an orchestrator over a client store.
    pub fn new(store: Arc<dyn SyncStore>, options: SyncOptions) -> Self {
        Self {
            core: OrchestratorCore::new(store, options),
        }
    }

    /// Options in use.
    pub fn options(&self) -> &SyncOptions {
        &self.core.options
    }

    /// Event hooks of the client side.
    pub fn interceptors(&self) -> &Interceptors {
        &self.core.interceptors
    }

    /// Client store.
    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.core.store
    }

    /// Replaces the built-in policy with a custom resolver.
    pub fn set_conflict_resolver(&self, resolver: impl ConflictResolver + 'static) {
        self.core.set_resolver(Arc::new(resolver));
    }

    fn scopes<'a>(&'a self, scope_name: &'a str) -> ScopeInfoStore<'a> {
        ScopeInfoStore::new(self.core.store.as_ref(), scope_name)
    }

    /// Peer id of the client store.
    pub async fn peer_id(&self, scope_name: &str) -> SessionResult<Uuid> {
        self.scopes(scope_name)
            .local_peer_id()
            .await
            .at(SyncStage::ScopeLoading)
    }

    /// Checks the scope's tables exist locally and saves its definition.
    pub async fn provision_scope(&self, scope: &SyncScope) -> SessionResult<()> {
        self.core
            .check_provisioned(scope)
            .await
            .at(SyncStage::ScopeLoading)?;
        self.scopes(&scope.name)
            .save_scope(scope)
            .await
            .at(SyncStage::ScopeLoading)
    }

    /// The client's record for a scope and parameter bindings.
    ///
    /// A missing record is created as new, with zero watermarks.
    pub async fn get_scope_info_client(
        &self,
        scope_name: &str,
        parameters: &SyncParameters,
    ) -> SessionResult<ScopeInfoClient> {
        let scopes = self.scopes(scope_name);
        let id = scopes.local_peer_id().await.at(SyncStage::ScopeLoading)?;
        scopes
            .get_or_create_client(id, parameters)
            .await
            .at(SyncStage::ScopeLoading)
    }

    /// The client's record, or an unsaved new one if none exists.
    pub async fn load_scope_info_client(
        &self,
        scope_name: &str,
        parameters: &SyncParameters,
    ) -> SessionResult<ScopeInfoClient> {
        let scopes = self.scopes(scope_name);
        let id = scopes.local_peer_id().await.at(SyncStage::ScopeLoading)?;
        let found = scopes
            .find_client(id, parameters)
            .await
            .at(SyncStage::ScopeLoading)?;
        Ok(found.unwrap_or_else(|| ScopeInfoClient::new(id, scope_name, parameters.clone())))
    }

    /// Captures the local timestamp bounding this session's upload.
    pub async fn capture_timestamp(&self, scope_name: &str) -> SessionResult<i64> {
        self.scopes(scope_name)
            .local_timestamp()
            .await
            .at(SyncStage::TimestampCapture)
    }

    fn upload_context<'a>(
        scope: &'a SyncScope,
        client: &'a ScopeInfoClient,
        server_id: Option<Uuid>,
    ) -> SelectionContext<'a> {
        SelectionContext {
            scope,
            parameters: &client.parameters,
            side: SyncSide::Client,
            is_new: client.is_new_scope,
            from_timestamp: client.local_watermark(),
            excluded_peer: server_id,
        }
    }

    /// Selects local changes made after the client's last sync.
    ///
    /// Rows last written by the server's own sync are skipped.
    pub async fn select_changes(
        &self,
        scope: &SyncScope,
        client: &ScopeInfoClient,
        client_timestamp: i64,
        server_id: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> SessionResult<ClientSyncChanges> {
        let ctx = Self::upload_context(scope, client, server_id);
        let (batch, changes_selected) = self
            .core
            .selector(cancel)
            .select_changes(&ctx)
            .await
            .at(SyncStage::ChangesSelecting)?;
        Ok(ClientSyncChanges {
            client_timestamp,
            batch,
            changes_selected,
        })
    }

    /// Captures the local timestamp, then selects local changes.
    pub async fn get_changes(
        &self,
        scope: &SyncScope,
        client: &ScopeInfoClient,
        server_id: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> SessionResult<ClientSyncChanges> {
        let client_timestamp = self.capture_timestamp(&scope.name).await?;
        self.select_changes(scope, client, client_timestamp, server_id, cancel)
            .await
    }

    /// Counts the rows the next upload would carry.
    pub async fn get_estimated_changes_count(
        &self,
        scope: &SyncScope,
        client: &ScopeInfoClient,
        server_id: Option<Uuid>,
    ) -> SessionResult<ChangesEstimate> {
        let cancel = CancellationToken::new();
        let ctx = Self::upload_context(scope, client, server_id);
        self.core
            .selector(&cancel)
            .estimate_changes(&ctx)
            .await
            .at(SyncStage::ChangesEstimating)
    }

    /// Applies the server's batch.
    ///
    /// Local rows changed after `client_timestamp` conflict with incoming
    /// rows; `policy` is the server's policy, used unless a custom
    /// resolver is set.
    pub async fn apply_changes(
        &self,
        scope: &SyncScope,
        client_timestamp: i64,
        server: &ServerSyncChanges,
        server_id: Uuid,
        policy: ConflictResolutionPolicy,
        cancel: &CancellationToken,
    ) -> SessionResult<DatabaseChangesApplied> {
        let resolver = self.core.resolver_or(policy);
        let ctx = ApplyContext {
            scope,
            side: SyncSide::Client,
            sender: Some(server_id),
            sync_min_timestamp: Some(client_timestamp),
            resolver: resolver.as_ref(),
        };
        let outcome = self
            .core
            .applier(cancel)
            .apply_changes(&server.batch, &ctx)
            .await
            .at(SyncStage::ChangesApplying);
        if self.core.options.clean_folder {
            discard_batch(&server.batch).await;
        }
        outcome
    }

    /// Advances and saves the client's watermarks.
    ///
    /// Called only once everything else of the session has committed.
    pub async fn complete_session(
        &self,
        client: &mut ScopeInfoClient,
        client_timestamp: i64,
        server_timestamp: i64,
        duration: Duration,
    ) -> SessionResult<()> {
        let mut advanced = client.clone();
        advanced
            .advance(
                client_timestamp,
                server_timestamp,
                Utc::now(),
                u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            )
            .map_err(SyncError::from)
            .at(SyncStage::ScopeSaving)?;
        self.scopes(&client.scope_name)
            .save_client(&advanced)
            .await
            .at(SyncStage::ScopeSaving)?;
        debug!(
            scope = %advanced.scope_name,
            local = client_timestamp,
            server = server_timestamp,
            "client watermarks advanced"
        );
        info!(scope = %advanced.scope_name, duration_ms = advanced.last_sync_duration_ms, "session completed");
        *client = advanced;
        Ok(())
    }
}

impl std::fmt::Debug for LocalOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalOrchestrator")
            .field("provider", &self.core.store.provider_name())
            .field("interceptors", &self.core.interceptors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::{ColumnType, MemoryStore, ScopeStore, SyncColumn, SyncSet, SyncTable};

    fn scope() -> SyncScope {
        SyncScope::new(
            "default",
            SyncSet::new().with_table(SyncTable::new(
                "Customer",
                vec![
                    SyncColumn::new("Id", ColumnType::Integer),
                    SyncColumn::new("Name", ColumnType::Text),
                ],
                &["Id"],
            )),
        )
    }

    fn orchestrator() -> (MemoryStore, LocalOrchestrator) {
        let store = MemoryStore::new("client");
        store.create_table(scope().setup.tables[0].clone()).unwrap();
        let local = LocalOrchestrator::new(
            Arc::new(store.clone()),
            SyncOptions::new().with_batch_size(0),
        );
        (store, local)
    }

    #[tokio::test]
    async fn first_record_is_new() {
        let (store, local) = orchestrator();
        let info = local
            .get_scope_info_client("default", &SyncParameters::new())
            .await
            .unwrap();
        assert!(info.is_new_scope);
        assert_eq!(info.id, store.local_peer_id().await.unwrap());
    }

    #[tokio::test]
    async fn get_changes_captures_timestamp_first() {
        let (store, local) = orchestrator();
        store.upsert("Customer", vec![1i64.into(), "Ann".into()]).unwrap();
        let scope = scope();
        let client = local
            .get_scope_info_client("default", &SyncParameters::new())
            .await
            .unwrap();
        let changes = local
            .get_changes(&scope, &client, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(changes.client_timestamp, store.local_timestamp().await.unwrap());
        assert_eq!(changes.changes_selected.total_changes_selected(), 1);
    }

    #[tokio::test]
    async fn complete_session_persists_watermarks() {
        let (store, local) = orchestrator();
        let mut client = local
            .get_scope_info_client("default", &SyncParameters::new())
            .await
            .unwrap();
        local
            .complete_session(&mut client, 4, 9, Duration::from_millis(12))
            .await
            .unwrap();
        assert!(!client.is_new_scope);

        let saved = store.load_scope_info_clients("default").await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].last_sync_timestamp, 4);
        assert_eq!(saved[0].last_server_sync_timestamp, 9);

        let err = local
            .complete_session(&mut client, 3, 9, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.stage, SyncStage::ScopeSaving);
        assert_eq!(client.last_sync_timestamp, 4);
    }

    #[tokio::test]
    async fn provision_requires_tables() {
        let local = LocalOrchestrator::new(Arc::new(MemoryStore::new("bare")), SyncOptions::new());
        let err = local.provision_scope(&scope()).await.unwrap_err();
        assert!(matches!(err.source, SyncError::MissingSchema { .. }));
    }
}
