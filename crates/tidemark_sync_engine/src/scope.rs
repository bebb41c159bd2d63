//! Watermark store access.
//!
//! Every failure of the underlying [`ScopeStore`] surfaces as
//! [`SyncError::ScopeUnavailable`], so a session never proceeds with
//! watermarks it could not read.

use crate::error::{SyncError, SyncResult};
use tidemark_core::{ScopeInfoClient, ScopeStore, SyncParameters, SyncScope, SyncStore};
use tracing::debug;
use uuid::Uuid;

/// Scope metadata and peer records of one store.
pub struct ScopeInfoStore<'a> {
    store: &'a dyn SyncStore,
    scope: &'a str,
}

impl<'a> ScopeInfoStore<'a> {
    /// Accesses the records of `scope` in `store`.
    pub fn new(store: &'a dyn SyncStore, scope: &'a str) -> Self {
        Self { store, scope }
    }

    fn unavailable(&self) -> impl Fn(tidemark_core::CoreError) -> SyncError + '_ {
        move |e| SyncError::scope_unavailable(self.scope, e)
    }

    /// Current logical timestamp of the store.
    pub async fn local_timestamp(&self) -> SyncResult<i64> {
        self.store.local_timestamp().await.map_err(self.unavailable())
    }

    /// Peer id of the store.
    pub async fn local_peer_id(&self) -> SyncResult<Uuid> {
        self.store.local_peer_id().await.map_err(self.unavailable())
    }

    /// Loads the scope definition.
    pub async fn load_scope(&self) -> SyncResult<Option<SyncScope>> {
        self.store.load_scope(self.scope).await.map_err(self.unavailable())
    }

    /// Loads the scope definition, failing when it is not provisioned.
    pub async fn require_scope(&self) -> SyncResult<SyncScope> {
        self.load_scope()
            .await?
            .ok_or_else(|| SyncError::ScopeNotFound {
                scope: self.scope.to_string(),
            })
    }

    /// Saves the scope definition.
    pub async fn save_scope(&self, scope: &SyncScope) -> SyncResult<()> {
        self.store.save_scope(scope).await.map_err(self.unavailable())
    }

    /// Record of a peer with the given bindings, if one exists.
    pub async fn find_client(
        &self,
        id: Uuid,
        parameters: &SyncParameters,
    ) -> SyncResult<Option<ScopeInfoClient>> {
        let records = self
            .store
            .load_scope_info_clients(self.scope)
            .await
            .map_err(self.unavailable())?;
        Ok(records
            .into_iter()
            .find(|r| r.id == id && r.parameters.same_bindings(parameters)))
    }

    /// Record of a peer, created and saved as new on first use.
    pub async fn get_or_create_client(
        &self,
        id: Uuid,
        parameters: &SyncParameters,
    ) -> SyncResult<ScopeInfoClient> {
        if let Some(record) = self.find_client(id, parameters).await? {
            return Ok(record);
        }
        let record = ScopeInfoClient::new(id, self.scope, parameters.clone());
        self.save_client(&record).await?;
        debug!(scope = self.scope, peer = %id, "peer record created");
        Ok(record)
    }

    /// Saves a peer record.
    pub async fn save_client(&self, record: &ScopeInfoClient) -> SyncResult<()> {
        self.store
            .save_scope_info_client(record)
            .await
            .map_err(self.unavailable())
    }
}
