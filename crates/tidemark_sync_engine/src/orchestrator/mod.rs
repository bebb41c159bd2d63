//! Local (client) and remote (server) orchestration.
//!
//! Both orchestrators own a store, options and an interceptor registry,
//! and drive the selector and applier for their side of a session.

mod local;
mod remote;

pub use local::LocalOrchestrator;
pub use remote::{RemoteOrchestrator, ServerScopeInfo};

use crate::applier::ChangeApplier;
use crate::config::SyncOptions;
use crate::conflict::{ConflictResolutionPolicy, ConflictResolver};
use crate::error::{SyncError, SyncResult};
use crate::interceptor::Interceptors;
use crate::selector::ChangeSelector;
use parking_lot::RwLock;
use std::sync::Arc;
use tidemark_batch::BatchInfo;
use tidemark_core::{
    ChangeStore, DatabaseChangesApplied, DatabaseChangesSelected, SyncScope, SyncStore,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Changes selected on the client for one session.
#[derive(Debug, Clone)]
pub struct ClientSyncChanges {
    /// Local timestamp captured before selection.
    pub client_timestamp: i64,
    /// Selected rows.
    pub batch: BatchInfo,
    /// Selection counters.
    pub changes_selected: DatabaseChangesSelected,
}

/// What the server returned for one session.
#[derive(Debug, Clone)]
pub struct ServerSyncChanges {
    /// Server timestamp captured before its selection.
    pub server_timestamp: i64,
    /// Rows selected for the client.
    pub batch: BatchInfo,
    /// Server selection counters.
    pub changes_selected: DatabaseChangesSelected,
    /// Outcome of applying the client's rows on the server.
    pub changes_applied: DatabaseChangesApplied,
}

pub(crate) struct OrchestratorCore {
    pub store: Arc<dyn SyncStore>,
    pub options: SyncOptions,
    pub interceptors: Interceptors,
    resolver: RwLock<Option<Arc<dyn ConflictResolver>>>,
}

impl OrchestratorCore {
    pub fn new(store: Arc<dyn SyncStore>, options: SyncOptions) -> Self {
        Self {
            store,
            options,
            interceptors: Interceptors::new(),
            resolver: RwLock::new(None),
        }
    }

    pub fn selector<'a>(&'a self, cancel: &'a CancellationToken) -> ChangeSelector<'a> {
        ChangeSelector::new(self.store.as_ref(), &self.options, &self.interceptors, cancel)
    }

    pub fn applier<'a>(&'a self, cancel: &'a CancellationToken) -> ChangeApplier<'a> {
        ChangeApplier::new(self.store.as_ref(), &self.options, &self.interceptors, cancel)
    }

    pub fn set_resolver(&self, resolver: Arc<dyn ConflictResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    /// Custom resolver if one is set, else the given policy.
    pub fn resolver_or(&self, policy: ConflictResolutionPolicy) -> Arc<dyn ConflictResolver> {
        match self.resolver.read().as_ref() {
            Some(resolver) => Arc::clone(resolver),
            None => Arc::new(policy),
        }
    }

    /// Checks that every table of a scope exists in the store.
    pub async fn check_provisioned(&self, scope: &SyncScope) -> SyncResult<()> {
        scope.setup.validate()?;
        for table in &scope.setup.tables {
            if !self.store.table_exists(&table.name).await? {
                return Err(SyncError::missing_schema(
                    &table.name,
                    format!("table not provisioned in {}", self.store.provider_name()),
                ));
            }
        }
        Ok(())
    }
}

/// Removes a batch directory, logging failures.
pub(crate) async fn discard_batch(batch: &BatchInfo) {
    if let Err(e) = batch.delete().await {
        warn!(batch = %batch.id, error = %e, "could not remove batch");
    }
}
