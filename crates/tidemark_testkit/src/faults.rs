//! Fault injection for store-level failure tests.
//!
//! [`FaultyStore`] wraps a [`MemoryStore`] and fails selected calls on
//! demand, so tests can check that a session fails cleanly: no batch
//! left behind, no watermark moved, nothing half applied.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tidemark_core::{
    ChangeStore, CoreError, CoreResult, DbCommand, MemoryStore, RowStream, ScopeInfoClient,
    ScopeStore, StoreTransaction, StoredRow, SyncRow, SyncScope, TableName,
};
use uuid::Uuid;

const NEVER: u64 = u64::MAX;

/// Switches shared by a [`FaultyStore`] and its transactions.
#[derive(Debug)]
pub struct Faults {
    offline: AtomicBool,
    fail_scope_saves: AtomicBool,
    fail_writes: AtomicBool,
    fail_commit: AtomicBool,
    read_limit: AtomicU64,
    rows_read: AtomicU64,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            offline: AtomicBool::new(false),
            fail_scope_saves: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            read_limit: AtomicU64::new(NEVER),
            rows_read: AtomicU64::new(0),
        }
    }
}

/// A [`MemoryStore`] that fails on demand.
#[derive(Clone)]
pub struct FaultyStore {
    inner: MemoryStore,
    faults: Arc<Faults>,
}

impl FaultyStore {
    /// Wraps a store with every fault off.
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }

    /// Wrapped store.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Makes every call fail with [`CoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes peer record saves fail.
    pub fn fail_scope_saves(&self, fail: bool) {
        self.faults.fail_scope_saves.store(fail, Ordering::SeqCst);
    }

    /// Makes row writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.faults.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes transaction commits fail.
    pub fn fail_commit(&self, fail: bool) {
        self.faults.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Fails selections once `limit` rows have been read in total;
    /// `None` lifts the limit.
    pub fn fail_reads_after(&self, limit: Option<u64>) {
        self.faults.rows_read.store(0, Ordering::SeqCst);
        self.faults
            .read_limit
            .store(limit.unwrap_or(NEVER), Ordering::SeqCst);
    }

    /// Rows read through selections since the last limit change.
    pub fn rows_read(&self) -> u64 {
        self.faults.rows_read.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> CoreResult<()> {
        if self.faults.offline.load(Ordering::SeqCst) {
            return Err(CoreError::Unavailable(format!("{} is offline", self.inner.name())));
        }
        Ok(())
    }
}

impl std::fmt::Debug for FaultyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyStore")
            .field("inner", &self.inner)
            .field("faults", &self.faults)
            .finish()
    }
}

#[async_trait]
impl ScopeStore for FaultyStore {
    async fn local_timestamp(&self) -> CoreResult<i64> {
        self.check_online()?;
        self.inner.local_timestamp().await
    }

    async fn local_peer_id(&self) -> CoreResult<Uuid> {
        self.check_online()?;
        self.inner.local_peer_id().await
    }

    async fn load_scope(&self, name: &str) -> CoreResult<Option<SyncScope>> {
        self.check_online()?;
        self.inner.load_scope(name).await
    }

    async fn save_scope(&self, scope: &SyncScope) -> CoreResult<()> {
        self.check_online()?;
        self.inner.save_scope(scope).await
    }

    async fn load_scope_info_clients(&self, scope_name: &str) -> CoreResult<Vec<ScopeInfoClient>> {
        self.check_online()?;
        self.inner.load_scope_info_clients(scope_name).await
    }

    async fn save_scope_info_client(&self, info: &ScopeInfoClient) -> CoreResult<()> {
        self.check_online()?;
        if self.faults.fail_scope_saves.load(Ordering::SeqCst) {
            return Err(CoreError::Unavailable("scope metadata write refused".into()));
        }
        self.inner.save_scope_info_client(info).await
    }
}

#[async_trait]
impl ChangeStore for FaultyStore {
    fn provider_name(&self) -> &str {
        "faulty-memory"
    }

    fn supports_multiple_active_result_sets(&self) -> bool {
        self.inner.supports_multiple_active_result_sets()
    }

    async fn table_exists(&self, table: &TableName) -> CoreResult<bool> {
        self.check_online()?;
        self.inner.table_exists(table).await
    }

    fn execute_reader<'a>(&'a self, command: DbCommand) -> RowStream<'a> {
        if let Err(e) = self.check_online() {
            return futures::stream::once(async move { Err(e) }).boxed();
        }
        let faults = Arc::clone(&self.faults);
        self.inner
            .execute_reader(command)
            .map(move |row: CoreResult<SyncRow>| -> CoreResult<SyncRow> {
                let row = row?;
                let read = faults.rows_read.fetch_add(1, Ordering::SeqCst) + 1;
                if read > faults.read_limit.load(Ordering::SeqCst) {
                    return Err(CoreError::Other(format!("read fault injected at row {read}")));
                }
                Ok(row)
            })
            .boxed()
    }

    async fn execute_count(&self, command: DbCommand) -> CoreResult<u64> {
        self.check_online()?;
        self.inner.execute_count(command).await
    }

    async fn begin_transaction(&self) -> CoreResult<Box<dyn StoreTransaction>> {
        self.check_online()?;
        let inner = self.inner.begin_transaction().await?;
        Ok(Box::new(FaultyTransaction {
            inner,
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct FaultyTransaction {
    inner: Box<dyn StoreTransaction>,
    faults: Arc<Faults>,
}

#[async_trait]
impl StoreTransaction for FaultyTransaction {
    async fn execute_row(&mut self, command: &DbCommand, row: &SyncRow) -> CoreResult<u64> {
        if self.faults.fail_writes.load(Ordering::SeqCst) {
            return Err(CoreError::Other(format!("write fault injected on {}", command.table)));
        }
        self.inner.execute_row(command, row).await
    }

    async fn fetch_row(&mut self, command: &DbCommand, row: &SyncRow) -> CoreResult<Option<StoredRow>> {
        self.inner.fetch_row(command, row).await
    }

    async fn commit(self: Box<Self>) -> CoreResult<()> {
        if self.faults.fail_commit.load(Ordering::SeqCst) {
            self.inner.rollback().await?;
            return Err(CoreError::Unavailable("commit refused".into()));
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> CoreResult<()> {
        self.inner.rollback().await
    }
}
