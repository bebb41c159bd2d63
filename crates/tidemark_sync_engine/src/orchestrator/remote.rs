//! Server side of a session.

use super::{discard_batch, OrchestratorCore, ServerSyncChanges};
use crate::applier::ApplyContext;
use crate::config::SyncOptions;
use crate::conflict::{ConflictResolutionPolicy, ConflictResolver, SyncSide};
use crate::error::{SessionError, SessionResult, StageExt, SyncError, SyncStage};
use crate::interceptor::{Interceptors, SyncEvent};
use crate::scope::ScopeInfoStore;
use crate::selector::{ChangesEstimate, SelectionContext};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tidemark_batch::BatchInfo;
use tidemark_core::{ChangeStore, ScopeInfoClient, SyncScope, SyncStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// What a client needs to know about a server scope before syncing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerScopeInfo {
    /// Scope definition provisioned on the server.
    pub scope: SyncScope,
    /// Server peer id, the last writer of rows the server sends.
    pub server_id: Uuid,
    /// Policy the server resolves conflicts with.
    pub conflict_policy: ConflictResolutionPolicy,
}

type SessionKey = (Uuid, String);

/// Marks a client session active until dropped.
struct ActiveSession<'a> {
    sessions: &'a Mutex<HashSet<SessionKey>>,
    key: SessionKey,
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.sessions.lock().remove(&self.key);
    }
}

/// Drives the server store: applies client uploads and selects what
/// each client is missing.
pub struct RemoteOrchestrator {
    core: OrchestratorCore,
    active: Mutex<HashSet<SessionKey>>,
}

impl RemoteOrchestrator {
    /// Creates an orchestrator over the server store.
    pub fn new(store: Arc<dyn SyncStore>, options: SyncOptions) -> Self {
        Self {
            core: OrchestratorCore::new(store, options),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Options in use.
    pub fn options(&self) -> &SyncOptions {
        &self.core.options
    }

    /// Event hooks of the server side.
    pub fn interceptors(&self) -> &Interceptors {
        &self.core.interceptors
    }

    /// Server store.
    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.core.store
    }

    /// Replaces the configured policy with a custom resolver.
    pub fn set_conflict_resolver(&self, resolver: impl ConflictResolver + 'static) {
        self.core.set_resolver(Arc::new(resolver));
    }

    fn scopes<'a>(&'a self, scope_name: &'a str) -> ScopeInfoStore<'a> {
        ScopeInfoStore::new(self.core.store.as_ref(), scope_name)
    }

    /// Registers a scope whose tables already exist in the server store.
    ///
    /// Only metadata is written; no table is created or altered.
    pub async fn provision_scope(&self, scope: &SyncScope) -> SessionResult<()> {
        self.core
            .check_provisioned(scope)
            .await
            .at(SyncStage::ScopeLoading)?;
        self.scopes(&scope.name)
            .save_scope(scope)
            .await
            .at(SyncStage::ScopeLoading)?;
        info!(scope = %scope.name, tables = scope.setup.tables.len(), "scope provisioned");
        Ok(())
    }

    /// Loads a provisioned scope for a client handshake.
    pub async fn ensure_scope(&self, scope_name: &str) -> SessionResult<ServerScopeInfo> {
        let scopes = self.scopes(scope_name);
        let scope = scopes.require_scope().await.at(SyncStage::ScopeLoading)?;
        let server_id = scopes.local_peer_id().await.at(SyncStage::ScopeLoading)?;
        Ok(ServerScopeInfo {
            scope,
            server_id,
            conflict_policy: self.core.options.conflict_resolution_policy,
        })
    }

    /// Returns true while a session of this client on this scope runs.
    pub fn is_session_active(&self, client_id: Uuid, scope_name: &str) -> bool {
        self.active
            .lock()
            .contains(&(client_id, scope_name.to_string()))
    }

    fn begin_session(&self, client: &ScopeInfoClient) -> SessionResult<ActiveSession<'_>> {
        let key = (client.id, client.scope_name.clone());
        if !self.active.lock().insert(key.clone()) {
            return Err(SessionError::new(
                SyncStage::ScopeLoading,
                SyncError::SessionInProgress {
                    scope: client.scope_name.clone(),
                },
            ));
        }
        Ok(ActiveSession {
            sessions: &self.active,
            key,
        })
    }

    fn download_context<'a>(scope: &'a SyncScope, client: &'a ScopeInfoClient) -> SelectionContext<'a> {
        SelectionContext {
            scope,
            parameters: &client.parameters,
            side: SyncSide::Server,
            is_new: client.is_new_scope,
            from_timestamp: client.server_watermark(),
            excluded_peer: Some(client.id),
        }
    }

    /// Counts the rows the client's next download would carry.
    pub async fn get_estimated_changes_count(
        &self,
        client: &ScopeInfoClient,
    ) -> SessionResult<ChangesEstimate> {
        let scope = self
            .scopes(&client.scope_name)
            .require_scope()
            .await
            .at(SyncStage::ScopeLoading)?;
        let cancel = CancellationToken::new();
        self.core
            .selector(&cancel)
            .estimate_changes(&Self::download_context(&scope, client))
            .await
            .at(SyncStage::ChangesEstimating)
    }

    /// Applies a client's upload, then selects the rows it is missing.
    ///
    /// Uploaded rows conflict with server rows changed after the
    /// client's last server watermark. The returned batch holds server
    /// rows changed after that watermark, except rows this client wrote.
    /// Only one session per client and scope runs at a time.
    pub async fn apply_then_get_changes(
        &self,
        client: &ScopeInfoClient,
        batch: BatchInfo,
        cancel: &CancellationToken,
    ) -> SessionResult<ServerSyncChanges> {
        let _session = self.begin_session(client)?;
        let scope_name = client.scope_name.as_str();
        let interceptors = &self.core.interceptors;
        if let Err(e) = interceptors
            .check(
                &SyncEvent::SessionBegin {
                    scope: scope_name,
                    side: SyncSide::Server,
                },
                None,
            )
            .at(SyncStage::ScopeLoading)
        {
            discard_batch(&batch).await;
            return Err(e);
        }

        let started = Instant::now();
        let outcome = self.run_session(client, batch, cancel, started).await;
        interceptors.notify(&SyncEvent::SessionEnd {
            scope: scope_name,
            side: SyncSide::Server,
            succeeded: outcome.is_ok(),
        });
        match &outcome {
            Ok(changes) => info!(
                scope = scope_name,
                client = %client.id,
                applied = changes.changes_applied.total_applied_changes(),
                selected = changes.changes_selected.total_changes_selected(),
                duration_ms = started.elapsed().as_millis() as u64,
                "server session completed"
            ),
            Err(e) => error!(scope = scope_name, client = %client.id, error = %e, "server session failed"),
        }
        outcome
    }

    async fn load_session(
        scopes: &ScopeInfoStore<'_>,
        client: &ScopeInfoClient,
    ) -> SessionResult<(SyncScope, ScopeInfoClient)> {
        let scope = scopes.require_scope().await.at(SyncStage::ScopeLoading)?;
        let history = scopes
            .get_or_create_client(client.id, &client.parameters)
            .await
            .at(SyncStage::ScopeLoading)?;
        Ok((scope, history))
    }

    async fn save_history(
        scopes: &ScopeInfoStore<'_>,
        history: &mut ScopeInfoClient,
        server_timestamp: i64,
        started: Instant,
    ) -> SessionResult<()> {
        history
            .advance(
                server_timestamp,
                server_timestamp,
                Utc::now(),
                u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            )
            .map_err(SyncError::from)
            .at(SyncStage::ScopeSaving)?;
        scopes.save_client(history).await.at(SyncStage::ScopeSaving)
    }

    async fn run_session(
        &self,
        client: &ScopeInfoClient,
        batch: BatchInfo,
        cancel: &CancellationToken,
        started: Instant,
    ) -> SessionResult<ServerSyncChanges> {
        let options = &self.core.options;
        let scopes = self.scopes(&client.scope_name);
        let (scope, mut history) = match Self::load_session(&scopes, client).await {
            Ok(loaded) => loaded,
            Err(e) => {
                discard_batch(&batch).await;
                return Err(e);
            }
        };

        let batch = if options.batch_size > 0 && !batch.is_empty() {
            batch
                .persist_to(&options.batch_directory)
                .await
                .map_err(SyncError::from_batch)
                .at(SyncStage::ChangesApplying)?
        } else {
            batch
        };

        let resolver = self.core.resolver_or(options.conflict_resolution_policy);
        let ctx = ApplyContext {
            scope: &scope,
            side: SyncSide::Server,
            sender: Some(client.id),
            sync_min_timestamp: client.server_watermark(),
            resolver: resolver.as_ref(),
        };
        let applied = self
            .core
            .applier(cancel)
            .apply_changes(&batch, &ctx)
            .await
            .at(SyncStage::ChangesApplying);
        if options.clean_folder {
            discard_batch(&batch).await;
        }
        let changes_applied = applied?;

        let server_timestamp = scopes
            .local_timestamp()
            .await
            .at(SyncStage::TimestampCapture)?;
        let (batch, changes_selected) = self
            .core
            .selector(cancel)
            .select_changes(&Self::download_context(&scope, client))
            .await
            .at(SyncStage::ChangesSelecting)?;

        // The server keeps its own clock in both watermarks of its history.
        let saved = Self::save_history(&scopes, &mut history, server_timestamp, started).await;
        if let Err(e) = saved {
            discard_batch(&batch).await;
            return Err(e);
        }
        debug!(
            scope = %client.scope_name,
            client = %client.id,
            server_timestamp,
            "server history advanced"
        );

        Ok(ServerSyncChanges {
            server_timestamp,
            batch,
            changes_selected,
            changes_applied,
        })
    }
}

impl std::fmt::Debug for RemoteOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteOrchestrator")
            .field("provider", &self.core.store.provider_name())
            .field("active_sessions", &self.active.lock().len())
            .finish()
    }
}
