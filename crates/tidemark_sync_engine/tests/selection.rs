//! Change selection into batches, driven directly and through sessions.

use std::collections::BTreeSet;
use tempfile::TempDir;
use tidemark_batch::{BatchInfo, BatchPartReader};
use tidemark_core::{
    ColumnType, MemoryStore, RowState, SyncFilter, SyncParameters, SyncRow, SyncScope, SyncSet,
    TableName,
};
use tidemark_sync_engine::{
    ChangeSelector, EventKind, Flow, Interceptors, SelectionContext, SyncError, SyncOptions,
    SyncSide, SyncStage,
};
use tidemark_testkit::prelude::*;
use tokio_util::sync::CancellationToken;

struct Harness {
    store: MemoryStore,
    options: SyncOptions,
    interceptors: Interceptors,
    cancel: CancellationToken,
    dir: TempDir,
}

impl Harness {
    fn new(batch_size: usize) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        Self {
            store: provisioned_store("server"),
            options: SyncOptions::new()
                .with_batch_directory(dir.path())
                .with_batch_size(batch_size),
            interceptors: Interceptors::new(),
            cancel: CancellationToken::new(),
            dir,
        }
    }

    fn selector(&self) -> ChangeSelector<'_> {
        ChangeSelector::new(&self.store, &self.options, &self.interceptors, &self.cancel)
    }
}

fn context<'a>(
    scope: &'a SyncScope,
    parameters: &'a SyncParameters,
    from_timestamp: Option<i64>,
) -> SelectionContext<'a> {
    SelectionContext {
        scope,
        parameters,
        side: SyncSide::Server,
        is_new: from_timestamp.is_none(),
        from_timestamp,
        excluded_peer: None,
    }
}

async fn read_rows(batch: &BatchInfo) -> Vec<(TableName, SyncRow)> {
    let mut rows = Vec::new();
    for part in &batch.parts {
        let mut reader = BatchPartReader::open(batch, part).await.unwrap();
        while let Some(row) = reader.next_row().unwrap() {
            rows.push((part.table.clone(), row));
        }
    }
    rows
}

#[tokio::test]
async fn rows_after_the_watermark_are_selected() {
    let h = Harness::new(0);
    let scope = customer_scope();
    seed_customers(&h.store, 1..=2);
    let watermark = h.store.upsert("Customer", customer_row(3)).unwrap() - 1;
    seed_customers(&h.store, 4..=5);

    let params = SyncParameters::new();
    let (batch, changes) = h
        .selector()
        .select_changes(&context(&scope, &params, Some(watermark)))
        .await
        .unwrap();

    assert_eq!(changes.total_upserts(), 3);
    assert_eq!(changes.total_deletes(), 0);
    assert_eq!(batch.rows_count, 3);
    let rows = read_rows(&batch).await;
    assert!(rows.iter().all(|(_, row)| row.state == RowState::Modified));
}

#[tokio::test]
async fn deletes_travel_in_their_own_parts() {
    let h = Harness::new(0);
    let scope = customer_scope();
    seed_customers(&h.store, 1..=5);
    h.store.delete("Customer", vec![2i64.into()]).unwrap();
    h.store.delete("Customer", vec![4i64.into()]).unwrap();

    let params = SyncParameters::new();
    let (batch, changes) = h
        .selector()
        .select_changes(&context(&scope, &params, Some(0)))
        .await
        .unwrap();

    assert_eq!(changes.total_upserts(), 3);
    assert_eq!(changes.total_deletes(), 2);
    let states: BTreeSet<_> = batch.parts.iter().map(|p| p.state).collect();
    assert_eq!(states.len(), 2);
    for part in &batch.parts {
        let mut reader = BatchPartReader::open(&batch, part).await.unwrap();
        while let Some(row) = reader.next_row().unwrap() {
            assert_eq!(row.state, part.state);
        }
    }
}

#[tokio::test]
async fn initial_selection_skips_tombstones() {
    let h = Harness::new(0);
    let scope = customer_scope();
    seed_customers(&h.store, 1..=3);
    h.store.delete("Customer", vec![1i64.into()]).unwrap();

    let params = SyncParameters::new();
    let (_, changes) = h
        .selector()
        .select_changes(&context(&scope, &params, None))
        .await
        .unwrap();
    assert_eq!(changes.total_upserts(), 2);
    assert_eq!(changes.total_deletes(), 0);
}

#[tokio::test]
async fn large_selection_splits_into_ordered_parts() {
    let h = Harness::new(512);
    let scope = customer_scope();
    seed_customers(&h.store, 1..=200);

    let params = SyncParameters::new();
    let (batch, changes) = h
        .selector()
        .select_changes(&context(&scope, &params, None))
        .await
        .unwrap();

    assert_eq!(changes.total_changes_selected(), 200);
    assert!(batch.parts.len() > 1);
    assert!(!batch.is_in_memory());
    batch.validate().unwrap();
    for (index, part) in batch.parts.iter().enumerate() {
        assert_eq!(part.index as usize, index);
        assert!(part.rows_count > 0);
        assert_eq!(part.is_last_batch, index + 1 == batch.parts.len());
    }
    let ids: BTreeSet<i64> = read_rows(&batch)
        .await
        .iter()
        .filter_map(|(_, row)| row.values[0].as_integer())
        .collect();
    assert_eq!(ids, (1..=200).collect());

    batch.delete().await.unwrap();
    assert_eq!(count_files(h.dir.path()), 0);
}

#[tokio::test]
async fn empty_selection_leaves_nothing_on_disk() {
    let h = Harness::new(512);
    let scope = sales_scope();
    let params = customer_params(1);
    let (batch, changes) = h
        .selector()
        .select_changes(&context(&scope, &params, None))
        .await
        .unwrap();

    assert_eq!(changes.total_changes_selected(), 0);
    assert!(batch.is_empty());
    assert!(batch.directory.is_none());
    assert_eq!(count_files(h.dir.path()), 0);
}

#[tokio::test]
async fn tables_are_reported_in_dependency_order() {
    let h = Harness::new(0);
    h.store.set_multiple_active_result_sets(true);
    let scope = sales_scope();
    seed_customers(&h.store, 1..=3);
    seed_orders(&h.store, 1, 10..=14);
    h.store.upsert("OrderLine", order_line_row(100, 10)).unwrap();

    let params = customer_params(1);
    let (batch, changes) = h
        .selector()
        .select_changes(&context(&scope, &params, None))
        .await
        .unwrap();

    let names: Vec<String> = changes.tables.iter().map(|t| t.table.to_string()).collect();
    assert_eq!(names, vec!["Customer", "Orders", "OrderLine"]);
    let first_seen: Vec<String> = batch
        .parts
        .iter()
        .map(|p| p.table.to_string())
        .fold(Vec::new(), |mut seen, name| {
            if seen.last() != Some(&name) {
                seen.push(name);
            }
            seen
        });
    assert_eq!(first_seen, names);
}

#[tokio::test]
async fn filter_binds_the_client_parameter() {
    let h = Harness::new(0);
    let scope = sales_scope();
    seed_customers(&h.store, 5..=6);
    seed_orders(&h.store, 5, 100..=102);
    seed_orders(&h.store, 6, 200..=201);

    let params = customer_params(5);
    let (batch, changes) = h
        .selector()
        .select_changes(&context(&scope, &params, None))
        .await
        .unwrap();

    assert_eq!(changes.table(&TableName::new("Orders")).unwrap().upserts, 3);
    for (table, row) in read_rows(&batch).await {
        if table.to_string() == "Orders" {
            assert_eq!(row.values[1].as_integer(), Some(5));
        }
    }
}

#[tokio::test]
async fn filter_default_applies_without_parameter() {
    let h = Harness::new(0);
    let setup = SyncSet::new().with_table(orders_table()).with_filter(
        SyncFilter::new("Orders")
            .with_equals("CustomerID", CUSTOMER_PARAM, ColumnType::Integer)
            .with_default(CUSTOMER_PARAM, 6i64.into()),
    );
    let scope = SyncScope::new(SCOPE, setup);
    seed_orders(&h.store, 5, 100..=102);
    seed_orders(&h.store, 6, 200..=201);

    let params = SyncParameters::new();
    let (_, changes) = h
        .selector()
        .select_changes(&context(&scope, &params, None))
        .await
        .unwrap();
    assert_eq!(changes.total_changes_selected(), 2);
}

#[tokio::test]
async fn missing_filter_parameter_fails_the_selection() {
    let h = Harness::new(0);
    let scope = sales_scope();
    let params = SyncParameters::new();
    let err = h
        .selector()
        .select_changes(&context(&scope, &params, None))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::SelectionFailed { .. }));
    assert_eq!(err.table(), Some(&TableName::new("Orders")));
}

#[tokio::test]
async fn row_interceptor_rollback_removes_the_partial_batch() {
    let h = Harness::new(256);
    let scope = customer_scope();
    seed_customers(&h.store, 1..=100);
    h.interceptors.on(EventKind::RowSelected, |event| match event {
        tidemark_sync_engine::SyncEvent::RowSelected { row, .. }
            if row.values[0].as_integer() == Some(60) =>
        {
            Flow::Rollback("row 60 is off limits".into())
        }
        _ => Flow::Continue,
    });

    let params = SyncParameters::new();
    let err = h
        .selector()
        .select_changes(&context(&scope, &params, None))
        .await
        .unwrap_err();
    assert!(err.is_rollback());
    assert_eq!(count_files(h.dir.path()), 0);
}

#[tokio::test]
async fn cancelled_token_stops_before_reading() {
    let h = Harness::new(0);
    let scope = customer_scope();
    seed_customers(&h.store, 1..=3);
    h.cancel.cancel();

    let params = SyncParameters::new();
    let err = h
        .selector()
        .select_changes(&context(&scope, &params, None))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn estimate_counts_without_writing() {
    let h = Harness::new(64);
    let scope = customer_scope();
    seed_customers(&h.store, 1..=7);

    let params = SyncParameters::new();
    let estimate = h
        .selector()
        .estimate_changes(&context(&scope, &params, Some(3)))
        .await
        .unwrap();
    assert_eq!(estimate.total(), 4);
    assert_eq!(count_files(h.dir.path()), 0);
}

#[tokio::test]
async fn session_download_honors_the_customer_filter() {
    let peers = TestPeers::new().await;
    seed_customers(&peers.server, 5..=6);
    seed_orders(&peers.server, 5, 100..=102);
    seed_orders(&peers.server, 6, 200..=201);

    let summary = sync_ok(&peers.agent, SCOPE, &customer_params(5)).await;
    assert_eq!(summary.total_changes_downloaded(), 5);
    assert_eq!(peers.client.row_count("Customer"), 2);
    let orders = peers.client.rows("Orders");
    assert_eq!(orders.len(), 3);
    assert!(orders.iter().all(|row| row[1].as_integer() == Some(5)));
}

#[tokio::test]
async fn session_without_filter_parameter_fails_during_selection() {
    let peers = TestPeers::new().await;
    seed_orders(&peers.server, 5, 100..=101);

    let err = peers
        .agent
        .synchronize(SCOPE, &SyncParameters::new())
        .await
        .unwrap_err();
    assert_eq!(err.stage, SyncStage::ChangesSelecting);
    assert_eq!(peers.client.row_count("Orders"), 0);
    let record = client_record(&peers.client, SCOPE, &SyncParameters::new())
        .await
        .unwrap();
    assert!(record.is_new_scope);
}
