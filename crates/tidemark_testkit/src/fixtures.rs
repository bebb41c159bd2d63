//! Test fixtures and peer helpers.
//!
//! The sales schema used across tests: `Customer` (parent), `Orders`
//! filtered by `CustomerID`, and `OrderLine` (child of `Orders`).

use std::sync::Arc;
use tempfile::TempDir;
use tidemark_core::{
    ColumnType, MemoryStore, SyncColumn, SyncFilter, SyncParameters, SyncRelation, SyncScope,
    SyncSet, SyncTable, SyncValue,
};
use tidemark_sync_engine::{LocalOrchestrator, LoopbackTransport, RemoteOrchestrator, SyncAgent, SyncOptions};

/// Scope name used by the fixtures.
pub const SCOPE: &str = "sales";

/// Filter parameter of `Orders`.
pub const CUSTOMER_PARAM: &str = "CustomerID";

/// `Customer(Id, Name, Email unique)`.
pub fn customer_table() -> SyncTable {
    SyncTable::new(
        "Customer",
        vec![
            SyncColumn::new("Id", ColumnType::Integer),
            SyncColumn::new("Name", ColumnType::Text),
            SyncColumn::new("Email", ColumnType::Text).nullable(),
        ],
        &["Id"],
    )
    .with_unique("Email")
}

/// `Orders(Id, CustomerID, Ref, Amount)`.
pub fn orders_table() -> SyncTable {
    SyncTable::new(
        "Orders",
        vec![
            SyncColumn::new("Id", ColumnType::Integer),
            SyncColumn::new("CustomerID", ColumnType::Integer),
            SyncColumn::new("Ref", ColumnType::Text),
            SyncColumn::new("Amount", ColumnType::Real).nullable(),
        ],
        &["Id"],
    )
}

/// `OrderLine(Id, OrderID, Product, Quantity)`.
pub fn order_line_table() -> SyncTable {
    SyncTable::new(
        "OrderLine",
        vec![
            SyncColumn::new("Id", ColumnType::Integer),
            SyncColumn::new("OrderID", ColumnType::Integer),
            SyncColumn::new("Product", ColumnType::Text),
            SyncColumn::new("Quantity", ColumnType::Integer),
        ],
        &["Id"],
    )
}

/// Every sales table, children declared first to exercise ordering.
pub fn sales_tables() -> Vec<SyncTable> {
    vec![order_line_table(), orders_table(), customer_table()]
}

/// The sales set with its relations and the `Orders` filter.
pub fn sales_setup() -> SyncSet {
    let mut setup = SyncSet::new();
    for table in sales_tables() {
        setup = setup.with_table(table);
    }
    setup
        .with_relation(SyncRelation::new(
            "FK_Orders_Customer",
            "Orders",
            "CustomerID",
            "Customer",
            "Id",
        ))
        .with_relation(SyncRelation::new(
            "FK_OrderLine_Orders",
            "OrderLine",
            "OrderID",
            "Orders",
            "Id",
        ))
        .with_filter(SyncFilter::new("Orders").with_equals("CustomerID", CUSTOMER_PARAM, ColumnType::Integer))
}

/// The sales scope.
pub fn sales_scope() -> SyncScope {
    SyncScope::new(SCOPE, sales_setup())
}

/// A single-table scope over `Customer`, no filter.
pub fn customer_scope() -> SyncScope {
    SyncScope::new(SCOPE, SyncSet::new().with_table(customer_table()))
}

/// Parameters binding the `Orders` filter.
pub fn customer_params(customer_id: i64) -> SyncParameters {
    SyncParameters::new().with(CUSTOMER_PARAM, customer_id)
}

/// A store with every sales table created and no row.
pub fn provisioned_store(name: &str) -> MemoryStore {
    let store = MemoryStore::new(name);
    for table in sales_tables() {
        store.create_table(table).expect("Failed to create table");
    }
    store
}

/// Customer row values.
pub fn customer_row(id: i64) -> Vec<SyncValue> {
    vec![
        id.into(),
        format!("Customer {id}").into(),
        format!("customer{id}@example.com").into(),
    ]
}

/// Order row values.
pub fn order_row(id: i64, customer_id: i64) -> Vec<SyncValue> {
    vec![
        id.into(),
        customer_id.into(),
        format!("SO-{id:05}").into(),
        (id as f64 * 10.0).into(),
    ]
}

/// Order line row values.
pub fn order_line_row(id: i64, order_id: i64) -> Vec<SyncValue> {
    vec![id.into(), order_id.into(), format!("Product {id}").into(), 1i64.into()]
}

/// Inserts customers as local edits.
pub fn seed_customers(store: &MemoryStore, ids: impl IntoIterator<Item = i64>) {
    for id in ids {
        store
            .upsert("Customer", customer_row(id))
            .expect("Failed to seed customer");
    }
}

/// Inserts orders of one customer as local edits.
pub fn seed_orders(store: &MemoryStore, customer_id: i64, ids: impl IntoIterator<Item = i64>) {
    for id in ids {
        store
            .upsert("Orders", order_row(id, customer_id))
            .expect("Failed to seed order");
    }
}

/// A server with a provisioned sales scope and one client agent,
/// wired through a loopback transport.
///
/// Each side gets its own batch directory under a temporary root.
pub struct TestPeers {
    /// Server store.
    pub server: MemoryStore,
    /// Client store.
    pub client: MemoryStore,
    /// Server orchestrator.
    pub remote: Arc<RemoteOrchestrator>,
    /// Client agent.
    pub agent: SyncAgent<LoopbackTransport>,
    /// Batch directory root (kept alive to prevent cleanup).
    pub dirs: TempDir,
}

impl TestPeers {
    /// Creates peers over the sales scope with default options.
    pub async fn new() -> Self {
        Self::with_options(sales_scope(), SyncOptions::new(), SyncOptions::new()).await
    }

    /// Creates peers over `scope`; batch directories are placed under
    /// a temporary root whatever the options say.
    pub async fn with_options(scope: SyncScope, server: SyncOptions, client: SyncOptions) -> Self {
        let dirs = TempDir::new().expect("Failed to create temp directory");
        let server_store = provisioned_store("server");
        let remote = Arc::new(RemoteOrchestrator::new(
            Arc::new(server_store.clone()),
            server.with_batch_directory(dirs.path().join("server")),
        ));
        remote
            .provision_scope(&scope)
            .await
            .expect("Failed to provision server scope");

        let client_store = provisioned_store("client");
        let agent = client_agent(&client_store, &remote, client.with_batch_directory(dirs.path().join("client")));
        Self {
            server: server_store,
            client: client_store,
            remote,
            agent,
            dirs,
        }
    }

    /// Adds another client of the same server.
    pub fn add_client(&self, name: &str) -> (MemoryStore, SyncAgent<LoopbackTransport>) {
        let store = provisioned_store(name);
        let agent = client_agent(
            &store,
            &self.remote,
            SyncOptions::new().with_batch_directory(self.dirs.path().join(name)),
        );
        (store, agent)
    }

    /// Batch directory of the server.
    pub fn server_batch_dir(&self) -> std::path::PathBuf {
        self.dirs.path().join("server")
    }

    /// Batch directory of the first client.
    pub fn client_batch_dir(&self) -> std::path::PathBuf {
        self.dirs.path().join("client")
    }
}

/// Builds an agent over `store` talking to `remote` in process.
pub fn client_agent(
    store: &MemoryStore,
    remote: &Arc<RemoteOrchestrator>,
    options: SyncOptions,
) -> SyncAgent<LoopbackTransport> {
    let local = LocalOrchestrator::new(Arc::new(store.clone()), options);
    SyncAgent::new(local, LoopbackTransport::new(Arc::clone(remote)))
}
