//! Client side of the producer cluster in xCluster replication.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;

use crate::catalog::{
    MemoryTableCatalog, NamespaceInfo, RelationType, SnapshotCoordinator, SnapshotMeta,
    TableCatalog, TableInfo, TabletInfo,
};
use crate::error::{MasterError, Result};
use crate::types::{NamespaceId, ReplicationGroupId, SnapshotId, StreamId, TableId};

/// RPCs the consumer master issues against a producer cluster.
#[async_trait]
pub trait ProducerClient: Send + Sync {
    /// Schema of a producer table. A colocation parent yields every member table.
    async fn get_table_schema(&self, table_id: &TableId) -> Result<Vec<TableInfo>>;

    /// Looks up a producer namespace by id.
    async fn get_namespace(&self, namespace_id: &NamespaceId) -> Result<NamespaceInfo>;

    /// Looks up a producer namespace by name.
    async fn get_namespace_by_name(&self, name: &str) -> Result<NamespaceInfo>;

    /// Replicable user tables of a producer namespace.
    async fn list_namespace_tables(&self, namespace_id: &NamespaceId) -> Result<Vec<TableInfo>>;

    /// Tablets of a producer table.
    async fn get_table_tablets(&self, table_id: &TableId) -> Result<Vec<TabletInfo>>;

    /// Creates an xCluster stream on the producer.
    async fn create_xcluster_stream(&self, table_id: &TableId, transactional: bool)
        -> Result<StreamId>;

    /// Deletes producer streams.
    async fn delete_cdc_streams(&self, stream_ids: &[StreamId]) -> Result<()>;

    /// Creates streams whose checkpoints are set to the current log position.
    async fn bootstrap_producer(&self, table_ids: &[TableId]) -> Result<Vec<StreamId>>;

    /// Snapshots a producer namespace.
    async fn create_snapshot(&self, namespace_id: &NamespaceId) -> Result<SnapshotId>;

    /// Objects captured by a producer snapshot.
    async fn get_snapshot_meta(&self, snapshot_id: &SnapshotId) -> Result<SnapshotMeta>;

    /// Deletes a producer snapshot.
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<()>;
}

/// Opens clients to producer clusters.
pub trait ProducerClientFactory: Send + Sync {
    /// Connects to the producer of `group` through any of `master_addresses`.
    fn connect(
        &self,
        group: &ReplicationGroupId,
        master_addresses: &[String],
    ) -> Result<Arc<dyn ProducerClient>>;
}

/// Producer call names accepted by [`MemoryProducer::fail_operation`].
pub mod ops {
    /// `get_table_schema`
    pub const GET_TABLE_SCHEMA: &str = "get_table_schema";
    /// `create_xcluster_stream`
    pub const CREATE_STREAM: &str = "create_xcluster_stream";
    /// `delete_cdc_streams`
    pub const DELETE_STREAMS: &str = "delete_cdc_streams";
    /// `bootstrap_producer`
    pub const BOOTSTRAP: &str = "bootstrap_producer";
    /// `create_snapshot`
    pub const CREATE_SNAPSHOT: &str = "create_snapshot";
}

/// A producer cluster backed by an in-memory catalog.
pub struct MemoryProducer {
    catalog: Arc<MemoryTableCatalog>,
    streams: Mutex<BTreeMap<StreamId, TableId>>,
    failing_ops: Mutex<BTreeSet<String>>,
    held_tables: Mutex<BTreeMap<TableId, watch::Sender<bool>>>,
    schema_calls: Mutex<usize>,
}

impl MemoryProducer {
    /// Wraps a producer-side catalog.
    pub fn new(catalog: Arc<MemoryTableCatalog>) -> Self {
        Self {
            catalog,
            streams: Mutex::new(BTreeMap::new()),
            failing_ops: Mutex::new(BTreeSet::new()),
            held_tables: Mutex::new(BTreeMap::new()),
            schema_calls: Mutex::new(0),
        }
    }

    /// The producer's catalog.
    pub fn catalog(&self) -> &Arc<MemoryTableCatalog> {
        &self.catalog
    }

    /// Makes the named call fail until cleared.
    pub fn fail_operation(&self, op: &str) {
        self.failing_ops.lock().insert(op.to_string());
    }

    /// Clears every injected failure.
    pub fn clear_failures(&self) {
        self.failing_ops.lock().clear();
    }

    /// Parks schema and stream calls on `table_id` until
    /// [`release_table`](Self::release_table).
    pub fn hold_table(&self, table_id: &TableId) {
        self.held_tables
            .lock()
            .entry(table_id.clone())
            .or_insert_with(|| watch::channel(false).0);
    }

    /// Lets parked and future calls on `table_id` through.
    pub fn release_table(&self, table_id: &TableId) {
        if let Some(tx) = self.held_tables.lock().remove(table_id) {
            tx.send_replace(true);
        }
    }

    /// Streams currently alive on the producer.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.lock().keys().copied().collect()
    }

    /// Producer table of a stream.
    pub fn stream_table(&self, stream_id: &StreamId) -> Option<TableId> {
        self.streams.lock().get(stream_id).cloned()
    }

    /// How many schema requests were served.
    pub fn schema_calls(&self) -> usize {
        *self.schema_calls.lock()
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.failing_ops.lock().contains(op) {
            return Err(MasterError::Remote(format!("injected producer failure in {op}")));
        }
        Ok(())
    }

    async fn wait_if_held(&self, table_id: &TableId) {
        let rx = self.held_tables.lock().get(table_id).map(watch::Sender::subscribe);
        if let Some(mut rx) = rx {
            // A dropped sender means the hold is gone too.
            let _ = rx.wait_for(|released| *released).await;
        }
    }

    fn new_stream(&self, table_id: &TableId) -> Result<StreamId> {
        if self.catalog.get_table(table_id).is_none() {
            return Err(MasterError::NotFound(format!("producer table {table_id}")));
        }
        let mut streams = self.streams.lock();
        let mut id = StreamId::generate();
        while streams.contains_key(&id) {
            id = StreamId::generate();
        }
        streams.insert(id, table_id.clone());
        Ok(id)
    }
}

#[async_trait]
impl ProducerClient for MemoryProducer {
    async fn get_table_schema(&self, table_id: &TableId) -> Result<Vec<TableInfo>> {
        *self.schema_calls.lock() += 1;
        self.wait_if_held(table_id).await;
        self.check(ops::GET_TABLE_SCHEMA)?;
        let table = self
            .catalog
            .get_table(table_id)
            .filter(|t| t.is_running())
            .ok_or_else(|| MasterError::NotFound(format!("producer table {table_id}")))?;
        if !table.is_colocation_parent {
            return Ok(vec![table]);
        }
        Ok(self
            .catalog
            .list_tables(&table.namespace_id)
            .into_iter()
            .filter(|t| t.parent_table_id.as_ref() == Some(table_id))
            .collect())
    }

    async fn get_namespace(&self, namespace_id: &NamespaceId) -> Result<NamespaceInfo> {
        self.catalog
            .get_namespace(namespace_id)
            .ok_or_else(|| MasterError::NotFound(format!("producer namespace {namespace_id}")))
    }

    async fn get_namespace_by_name(&self, name: &str) -> Result<NamespaceInfo> {
        self.catalog
            .find_namespace_by_name(name)
            .ok_or_else(|| MasterError::NotFound(format!("producer namespace {name}")))
    }

    async fn list_namespace_tables(&self, namespace_id: &NamespaceId) -> Result<Vec<TableInfo>> {
        if self.catalog.get_namespace(namespace_id).is_none() {
            return Err(MasterError::NotFound(format!(
                "producer namespace {namespace_id}"
            )));
        }
        Ok(self
            .catalog
            .list_tables(namespace_id)
            .into_iter()
            .filter(|t| t.relation_type == RelationType::User && !t.is_colocated())
            .collect())
    }

    async fn get_table_tablets(&self, table_id: &TableId) -> Result<Vec<TabletInfo>> {
        self.catalog.get_tablets(table_id)
    }

    async fn create_xcluster_stream(
        &self,
        table_id: &TableId,
        _transactional: bool,
    ) -> Result<StreamId> {
        self.wait_if_held(table_id).await;
        self.check(ops::CREATE_STREAM)?;
        self.new_stream(table_id)
    }

    async fn delete_cdc_streams(&self, stream_ids: &[StreamId]) -> Result<()> {
        self.check(ops::DELETE_STREAMS)?;
        let mut streams = self.streams.lock();
        for id in stream_ids {
            streams.remove(id);
        }
        Ok(())
    }

    async fn bootstrap_producer(&self, table_ids: &[TableId]) -> Result<Vec<StreamId>> {
        self.check(ops::BOOTSTRAP)?;
        table_ids.iter().map(|t| self.new_stream(t)).collect()
    }

    async fn create_snapshot(&self, namespace_id: &NamespaceId) -> Result<SnapshotId> {
        self.check(ops::CREATE_SNAPSHOT)?;
        let tables: Vec<TableId> = self
            .catalog
            .list_tables(namespace_id)
            .into_iter()
            .filter(|t| t.relation_type == RelationType::User)
            .map(|t| t.id)
            .collect();
        self.catalog.create_snapshot(&tables).await
    }

    async fn get_snapshot_meta(&self, snapshot_id: &SnapshotId) -> Result<SnapshotMeta> {
        self.catalog.snapshot_meta(snapshot_id)
    }

    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<()> {
        SnapshotCoordinator::delete_snapshot(self.catalog.as_ref(), snapshot_id).await
    }
}

/// Routes producer master addresses to in-memory producers.
#[derive(Default)]
pub struct MemoryProducerFactory {
    producers: Mutex<BTreeMap<String, Arc<MemoryProducer>>>,
}

impl MemoryProducerFactory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `producer` on `address`.
    pub fn register(&self, address: &str, producer: Arc<MemoryProducer>) {
        self.producers.lock().insert(address.to_string(), producer);
    }
}

impl ProducerClientFactory for MemoryProducerFactory {
    fn connect(
        &self,
        group: &ReplicationGroupId,
        master_addresses: &[String],
    ) -> Result<Arc<dyn ProducerClient>> {
        let producers = self.producers.lock();
        master_addresses
            .iter()
            .find_map(|addr| producers.get(addr))
            .map(|p| p.clone() as Arc<dyn ProducerClient>)
            .ok_or_else(|| {
                MasterError::Remote(format!(
                    "replication group {group}: no producer reachable at {:?}",
                    master_addresses
                ))
            })
    }
}
