//! Cross-crate integration test helpers.
//!
//! Provides tracing setup, session shortcuts and assertions over
//! stores and batch directories.

use std::collections::BTreeMap;
use std::path::Path;
use tidemark_core::{MemoryStore, ScopeInfoClient, ScopeStore, SyncParameters, TableName};
use tidemark_sync_engine::{SyncAgent, SyncSummary, SyncTransport};
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly subscriber once; later calls are no-ops.
///
/// Honors `RUST_LOG`, defaulting to `warn`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Runs one session and panics with the session error on failure.
pub async fn sync_ok<T: SyncTransport>(
    agent: &SyncAgent<T>,
    scope_name: &str,
    parameters: &SyncParameters,
) -> SyncSummary {
    match agent.synchronize(scope_name, parameters).await {
        Ok(summary) => summary,
        Err(e) => panic!("session failed at {:?}: {}", e.stage, e),
    }
}

/// Asserts both stores hold the same live rows in `table`.
pub fn assert_same_rows(a: &MemoryStore, b: &MemoryStore, table: &str) {
    assert_eq!(
        a.rows(table),
        b.rows(table),
        "{table} differs between {} and {}",
        a.name(),
        b.name()
    );
}

/// Live `Customer` rows as id to name.
pub fn customers(store: &MemoryStore) -> BTreeMap<i64, String> {
    store
        .rows(TableName::new("Customer"))
        .into_iter()
        .filter_map(|row| {
            let id = row.first()?.as_integer()?;
            let name = row.get(1)?.as_text()?.to_string();
            Some((id, name))
        })
        .collect()
}

/// The store's own record for a scope and parameter bindings.
pub async fn client_record(
    store: &MemoryStore,
    scope_name: &str,
    parameters: &SyncParameters,
) -> Option<ScopeInfoClient> {
    let id = store.local_peer_id().await.ok()?;
    store
        .load_scope_info_clients(scope_name)
        .await
        .ok()?
        .into_iter()
        .find(|record| record.id == id && &record.parameters == parameters)
}

/// Every record a server keeps for a scope.
pub async fn server_records(store: &MemoryStore, scope_name: &str) -> Vec<ScopeInfoClient> {
    store
        .load_scope_info_clients(scope_name)
        .await
        .unwrap_or_default()
}

/// Number of files under `dir`, recursively; a missing directory counts zero.
pub fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{provisioned_store, seed_customers};
    use tempfile::TempDir;

    #[test]
    fn counts_nested_files() {
        let dir = TempDir::new().unwrap();
        assert_eq!(count_files(&dir.path().join("missing")), 0);
        std::fs::create_dir(dir.path().join("batch")).unwrap();
        std::fs::write(dir.path().join("batch").join("part-0"), b"x").unwrap();
        std::fs::write(dir.path().join("top"), b"y").unwrap();
        assert_eq!(count_files(dir.path()), 2);
    }

    #[test]
    fn customers_reads_live_rows() {
        let store = provisioned_store("client");
        seed_customers(&store, 1..=3);
        store.delete("Customer", vec![2i64.into()]).unwrap();
        let rows = customers(&store);
        assert_eq!(rows.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(rows[&1], "Customer 1");
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        init_tracing();
        let store = provisioned_store("client");
        assert!(client_record(&store, "sales", &SyncParameters::new()).await.is_none());
    }
}
