//! Client session driver.

use crate::conflict::SyncSide;
use crate::error::{SessionError, SessionResult, StageExt, SyncError, SyncStage};
use crate::interceptor::SyncEvent;
use crate::orchestrator::{discard_batch, ClientSyncChanges, LocalOrchestrator, ServerSyncChanges};
use crate::selector::ChangesEstimate;
use crate::state::{SessionState, SyncStats};
use crate::transport::{ChangesRequest, EnsureScopeRequest, EnsureScopeResponse, EstimateRequest, SyncTransport};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tidemark_core::{DatabaseChangesApplied, ScopeInfoClient, SyncParameters};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of a successful session.
#[derive(Debug, Clone)]
pub struct SyncSummary {
    /// Scope synchronized.
    pub scope_name: String,
    /// Wall clock start.
    pub started_at: DateTime<Utc>,
    /// Wall clock end.
    pub completed_at: DateTime<Utc>,
    /// What the client selected and uploaded.
    pub client_changes: ClientSyncChanges,
    /// What the server applied and sent back.
    pub server_changes: ServerSyncChanges,
    /// Outcome of applying the server's rows on the client.
    pub client_changes_applied: DatabaseChangesApplied,
}

impl SyncSummary {
    /// Rows uploaded.
    pub fn total_changes_uploaded(&self) -> u64 {
        self.client_changes.changes_selected.total_changes_selected()
    }

    /// Rows downloaded.
    pub fn total_changes_downloaded(&self) -> u64 {
        self.server_changes.changes_selected.total_changes_selected()
    }

    /// Conflicts resolved on either side.
    pub fn total_resolved_conflicts(&self) -> u64 {
        self.server_changes.changes_applied.total_resolved_conflicts()
            + self.client_changes_applied.total_resolved_conflicts()
    }

    /// Session duration.
    pub fn duration(&self) -> Duration {
        (self.completed_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// The sync agent runs sessions between a client store and a server.
///
/// One session runs at a time; watermarks only move once both applies
/// have committed.
pub struct SyncAgent<T: SyncTransport> {
    local: LocalOrchestrator,
    transport: T,
    state: RwLock<SessionState>,
    stats: RwLock<SyncStats>,
    cancel: Mutex<CancellationToken>,
    session: tokio::sync::Mutex<()>,
}

impl<T: SyncTransport> SyncAgent<T> {
    /// Creates an agent.
    pub fn new(local: LocalOrchestrator, transport: T) -> Self {
        Self {
            local,
            transport,
            state: RwLock::new(SessionState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancel: Mutex::new(CancellationToken::new()),
            session: tokio::sync::Mutex::new(()),
        }
    }

    /// Client orchestrator.
    pub fn local(&self) -> &LocalOrchestrator {
        &self.local
    }

    /// Transport to the server.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Gets the current state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Cancels the running session, if any.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    fn set_state(&self, next: SessionState, stage: SyncStage) -> SessionResult<()> {
        self.state.write().transition(next).at(stage)
    }

    /// Runs one session: upload local changes, apply them on the server,
    /// download and apply the server's changes, then advance watermarks.
    ///
    /// On failure nothing is recorded and the next session retries from
    /// the same watermarks.
    pub async fn synchronize(
        &self,
        scope_name: &str,
        parameters: &SyncParameters,
    ) -> SessionResult<SyncSummary> {
        let _session = self.session.try_lock().map_err(|_| {
            SessionError::new(
                SyncStage::ScopeLoading,
                SyncError::SessionInProgress {
                    scope: scope_name.to_string(),
                },
            )
        })?;
        {
            let mut state = self.state.write();
            if *state != SessionState::Idle {
                state.transition(SessionState::Idle).at(SyncStage::ScopeLoading)?;
            }
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        info!(scope = scope_name, "session started");
        let outcome = self.run(scope_name, parameters, &cancel).await;
        self.local.interceptors().notify(&SyncEvent::SessionEnd {
            scope: scope_name,
            side: SyncSide::Client,
            succeeded: outcome.is_ok(),
        });

        match &outcome {
            Ok(summary) => {
                let mut stats = self.stats.write();
                stats.sessions_completed += 1;
                stats.rows_uploaded += summary.total_changes_uploaded();
                stats.rows_downloaded += summary.total_changes_downloaded();
                stats.conflicts_resolved += summary.total_resolved_conflicts();
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
                info!(
                    scope = scope_name,
                    uploaded = summary.total_changes_uploaded(),
                    downloaded = summary.total_changes_downloaded(),
                    conflicts = summary.total_resolved_conflicts(),
                    duration_ms = summary.duration().as_millis() as u64,
                    "session completed"
                );
            }
            Err(e) => {
                if let Err(invalid) = self.state.write().transition(SessionState::Failed) {
                    warn!(error = %invalid, "could not mark session failed");
                }
                let mut stats = self.stats.write();
                stats.sessions_failed += 1;
                stats.last_error = Some(e.to_string());
                error!(scope = scope_name, stage = %e.stage, error = %e, "session failed");
            }
        }
        outcome
    }

    async fn run(
        &self,
        scope_name: &str,
        parameters: &SyncParameters,
        cancel: &CancellationToken,
    ) -> SessionResult<SyncSummary> {
        let started_at = Utc::now();
        let started = Instant::now();
        let server = self.ensure_scope(scope_name, cancel).await?;
        self.local
            .interceptors()
            .check(
                &SyncEvent::SessionBegin {
                    scope: scope_name,
                    side: SyncSide::Client,
                },
                None,
            )
            .at(SyncStage::ScopeLoading)?;
        self.local.provision_scope(&server.scope).await?;
        let mut client = self
            .local
            .get_scope_info_client(scope_name, parameters)
            .await?;

        let client_timestamp = self.local.capture_timestamp(scope_name).await?;
        self.set_state(SessionState::TimestampCaptured, SyncStage::TimestampCapture)?;
        self.set_state(SessionState::Selecting, SyncStage::ChangesSelecting)?;
        let client_changes = self
            .local
            .select_changes(
                &server.scope,
                &client,
                client_timestamp,
                Some(server.server_id),
                cancel,
            )
            .await?;
        self.set_state(SessionState::Selected, SyncStage::ChangesUploading)?;

        let exchanged = self.exchange(&client, &client_changes, cancel).await;
        if exchanged.is_err() || self.local.options().clean_folder {
            discard_batch(&client_changes.batch).await;
        }
        let server_changes = exchanged?;
        debug!(
            scope = scope_name,
            applied_on_server = server_changes.changes_applied.total_applied_changes(),
            server_timestamp = server_changes.server_timestamp,
            "server answered"
        );

        self.set_state(SessionState::Applying, SyncStage::ChangesApplying)?;
        let client_changes_applied = self
            .local
            .apply_changes(
                &server.scope,
                client_timestamp,
                &server_changes,
                server.server_id,
                server.conflict_policy,
                cancel,
            )
            .await?;
        self.local
            .complete_session(
                &mut client,
                client_timestamp,
                server_changes.server_timestamp,
                started.elapsed(),
            )
            .await?;
        self.set_state(SessionState::Applied, SyncStage::ScopeSaving)?;

        Ok(SyncSummary {
            scope_name: scope_name.to_string(),
            started_at,
            completed_at: Utc::now(),
            client_changes,
            server_changes,
            client_changes_applied,
        })
    }

    /// Sends the upload and stages the download in the client's batch
    /// directory.
    async fn exchange(
        &self,
        client: &ScopeInfoClient,
        client_changes: &ClientSyncChanges,
        cancel: &CancellationToken,
    ) -> SessionResult<ServerSyncChanges> {
        if cancel.is_cancelled() {
            return Err(SessionError::new(SyncStage::ChangesUploading, SyncError::Cancelled));
        }
        let request = ChangesRequest {
            client: client.clone(),
            client_timestamp: client_changes.client_timestamp,
            batch: client_changes.batch.clone(),
            changes_selected: client_changes.changes_selected.clone(),
        };
        let response = self
            .transport
            .apply_then_get_changes(request, cancel)
            .await
            .at(SyncStage::ChangesUploading)?;

        let options = self.local.options();
        let batch = if options.batch_size > 0 && !response.batch.is_empty() {
            response
                .batch
                .persist_to(&options.batch_directory)
                .await
                .map_err(SyncError::from_batch)
                .at(SyncStage::ChangesApplying)?
        } else {
            response.batch
        };
        Ok(ServerSyncChanges {
            server_timestamp: response.server_timestamp,
            batch,
            changes_selected: response.changes_selected,
            changes_applied: response.changes_applied,
        })
    }

    /// Scope handshake, retried on transient failures.
    async fn ensure_scope(
        &self,
        scope_name: &str,
        cancel: &CancellationToken,
    ) -> SessionResult<EnsureScopeResponse> {
        let retry = &self.local.options().retry;
        let mut attempt = 0u32;
        loop {
            let request = EnsureScopeRequest {
                scope_name: scope_name.to_string(),
            };
            match self.transport.ensure_scope(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        scope = scope_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "scope handshake failed, retrying"
                    );
                    self.stats.write().retries += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(SessionError::new(SyncStage::ScopeLoading, SyncError::Cancelled));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(SessionError::new(SyncStage::ScopeLoading, e)),
            }
        }
    }

    /// Counts the rows the server would send on the next session.
    ///
    /// Nothing is written on either side.
    pub async fn get_estimated_changes_count(
        &self,
        scope_name: &str,
        parameters: &SyncParameters,
    ) -> SessionResult<ChangesEstimate> {
        let client = self
            .local
            .load_scope_info_client(scope_name, parameters)
            .await?;
        self.transport
            .get_estimated_changes_count(EstimateRequest { client })
            .await
            .at(SyncStage::ChangesEstimating)
    }
}

impl<T: SyncTransport> std::fmt::Debug for SyncAgent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncAgent")
            .field("local", &self.local)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SyncOptions};
    use crate::orchestrator::RemoteOrchestrator;
    use crate::transport::LoopbackTransport;
    use std::sync::Arc;
    use tidemark_core::{
        ColumnType, MemoryStore, ScopeStore, SyncColumn, SyncScope, SyncSet, SyncTable,
    };

    fn customer() -> SyncTable {
        SyncTable::new(
            "Customer",
            vec![
                SyncColumn::new("Id", ColumnType::Integer),
                SyncColumn::new("Name", ColumnType::Text),
            ],
            &["Id"],
        )
    }

    async fn peers() -> (MemoryStore, MemoryStore, SyncAgent<LoopbackTransport>) {
        let options = SyncOptions::new()
            .with_batch_size(0)
            .with_retry(RetryConfig::new(2).with_initial_delay(Duration::from_millis(1)));
        let server_store = MemoryStore::new("server");
        server_store.create_table(customer()).unwrap();
        let server = RemoteOrchestrator::new(Arc::new(server_store.clone()), options.clone());
        server
            .provision_scope(&SyncScope::new("default", SyncSet::new().with_table(customer())))
            .await
            .unwrap();

        let client_store = MemoryStore::new("client");
        client_store.create_table(customer()).unwrap();
        let local = LocalOrchestrator::new(Arc::new(client_store.clone()), options);
        let agent = SyncAgent::new(local, LoopbackTransport::new(Arc::new(server)));
        (server_store, client_store, agent)
    }

    #[tokio::test]
    async fn session_exchanges_rows_both_ways() {
        let (server, client, agent) = peers().await;
        server.upsert("Customer", vec![1i64.into(), "Ann".into()]).unwrap();
        client.upsert("Customer", vec![2i64.into(), "Bob".into()]).unwrap();

        let summary = agent
            .synchronize("default", &SyncParameters::new())
            .await
            .unwrap();
        assert_eq!(summary.total_changes_uploaded(), 1);
        // The initial download carries every live server row.
        assert_eq!(summary.total_changes_downloaded(), 2);
        assert_eq!(agent.state(), SessionState::Applied);
        assert_eq!(server.row_count("Customer"), 2);
        assert_eq!(client.row_count("Customer"), 2);

        let stats = agent.stats();
        assert_eq!(stats.sessions_completed, 1);
        assert_eq!(stats.rows_uploaded, 1);

        let again = agent
            .synchronize("default", &SyncParameters::new())
            .await
            .unwrap();
        assert_eq!(again.total_changes_uploaded(), 0);
        assert_eq!(again.total_changes_downloaded(), 0);
    }

    #[tokio::test]
    async fn unreachable_server_fails_after_retries() {
        let (_server, client, agent) = peers().await;
        agent.transport().set_connected(false);

        let err = agent
            .synchronize("default", &SyncParameters::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.stage, SyncStage::ScopeLoading);
        assert_eq!(agent.state(), SessionState::Failed);

        let stats = agent.stats();
        assert_eq!(stats.sessions_failed, 1);
        assert_eq!(stats.retries, 1);
        assert!(stats.last_error.is_some());
        assert!(client.load_scope_info_clients("default").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn estimate_writes_nothing() {
        let (server, client, agent) = peers().await;
        server.upsert("Customer", vec![1i64.into(), "Ann".into()]).unwrap();

        let estimate = agent
            .get_estimated_changes_count("default", &SyncParameters::new())
            .await
            .unwrap();
        assert_eq!(estimate.total(), 1);
        assert!(client.load_scope_info_clients("default").await.unwrap().is_empty());
        assert!(server.load_scope_info_clients("default").await.unwrap().is_empty());
    }
}
