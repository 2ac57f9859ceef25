//! Table, tablet and namespace catalog.
//!
//! The catalog is owned by the wider master; the xrepl subsystems only read
//! it and issue the few tablet-level requests they need (WAL retention, safe
//! op ids, hidden tablet deletion). [`MemoryTableCatalog`] is a complete
//! in-process implementation, also used to model the producer cluster.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{MasterError, Result};
use crate::metadata::ImportedObjects;
use crate::types::{
    HybridTime, NamespaceId, OpId, PgReplicaIdentity, RestorationId, SnapshotId, StreamId,
    TableId, TabletId,
};

/// Storage flavour of a table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableType {
    /// YSQL table.
    Pgsql,
    /// YCQL table.
    Ycql,
    /// The transaction status table.
    TransactionStatus,
}

/// What kind of relation a table is.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationType {
    /// Regular user table.
    User,
    /// Secondary index.
    Index,
    /// Catalog table.
    System,
    /// Materialized view.
    MaterializedView,
}

/// Lifecycle of a table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableState {
    /// Serving.
    Running,
    /// Dropped but retained, e.g. by a snapshot.
    Hidden,
    /// Dropped.
    Deleted,
}

/// One column of a table schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// Type name.
    pub type_name: String,
    /// Part of the primary key.
    pub is_key: bool,
}

/// Column layout of a table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Columns in declaration order.
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// Two-column schema with an integer key.
    pub fn simple() -> Self {
        Self {
            columns: vec![
                ColumnSchema {
                    name: "id".into(),
                    type_name: "int4".into(),
                    is_key: true,
                },
                ColumnSchema {
                    name: "value".into(),
                    type_name: "text".into(),
                    is_key: false,
                },
            ],
        }
    }

    /// Schemas replicate into each other when column names, types and key
    /// flags match.
    pub fn is_compatible_with(&self, other: &TableSchema) -> bool {
        self.columns == other.columns
    }
}

/// A table as seen by the xrepl subsystems.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table id.
    pub id: TableId,
    /// Table name.
    pub name: String,
    /// Owning namespace.
    pub namespace_id: NamespaceId,
    /// Postgres schema the table lives in.
    pub pg_schema_name: String,
    /// Storage flavour.
    pub table_type: TableType,
    /// Relation kind.
    pub relation_type: RelationType,
    /// False when the table relies on the synthetic row id column.
    pub has_user_primary_key: bool,
    /// Synthetic parent of a colocation group.
    pub is_colocation_parent: bool,
    /// Colocated member tables carry an id inside the parent's tablet.
    pub colocation_id: Option<u32>,
    /// Colocation parent of a member table.
    pub parent_table_id: Option<TableId>,
    /// Current schema version.
    pub schema_version: u32,
    /// Columns.
    pub schema: TableSchema,
    /// Lifecycle.
    pub state: TableState,
    /// Replica identity set with ALTER TABLE.
    pub replica_identity: Option<PgReplicaIdentity>,
}

impl TableInfo {
    /// Serving and not dropped.
    pub fn is_running(&self) -> bool {
        self.state == TableState::Running
    }

    /// Member of a colocation group.
    pub fn is_colocated(&self) -> bool {
        self.colocation_id.is_some()
    }
}

/// Partition key range of a tablet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Inclusive start; empty means unbounded.
    pub start_key: Vec<u8>,
    /// Exclusive end; empty means unbounded.
    pub end_key: Vec<u8>,
}

/// A tablet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletInfo {
    /// Tablet id.
    pub id: TabletId,
    /// Owning table; the parent for colocated tablets.
    pub table_id: TableId,
    /// Key range.
    pub partition: Partition,
    /// Split parent kept alive after the split.
    pub hidden: bool,
    /// Children produced by a split.
    pub split_children: Vec<TabletId>,
    /// Every table stored on the tablet.
    pub hosted_table_ids: Vec<TableId>,
}

/// A namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    /// Namespace id.
    pub id: NamespaceId,
    /// Namespace name.
    pub name: String,
    /// Colocated database.
    pub colocated: bool,
}

/// Progress of a snapshot restoration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestorationState {
    /// Still running.
    Restoring,
    /// Finished.
    Restored,
    /// Gave up.
    Failed,
}

/// Objects captured by a snapshot, enough to import them elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Snapshot id on the cluster that took it.
    pub snapshot_id: SnapshotId,
    /// Namespace the snapshot covers.
    pub namespace: NamespaceInfo,
    /// Tables with their tablet counts.
    pub tables: Vec<(TableInfo, usize)>,
}

/// Read and tablet-request access to the table catalog.
#[async_trait]
pub trait TableCatalog: Send + Sync {
    /// Looks up a table in any state.
    fn get_table(&self, table_id: &TableId) -> Option<TableInfo>;

    /// Looks up a namespace.
    fn get_namespace(&self, namespace_id: &NamespaceId) -> Option<NamespaceInfo>;

    /// Looks up a namespace by name.
    fn find_namespace_by_name(&self, name: &str) -> Option<NamespaceInfo>;

    /// Looks up a running table by name.
    fn find_table_by_name(
        &self,
        namespace_id: &NamespaceId,
        pg_schema_name: &str,
        name: &str,
    ) -> Option<TableInfo>;

    /// Running tables of a namespace, every relation kind.
    fn list_tables(&self, namespace_id: &NamespaceId) -> Vec<TableInfo>;

    /// Visible tablets of a table. Colocated members return the parent's tablets.
    fn get_tablets(&self, table_id: &TableId) -> Result<Vec<TabletInfo>>;

    /// Looks up a tablet, hidden or not.
    fn get_tablet(&self, tablet_id: &TabletId) -> Option<TabletInfo>;

    /// Every hidden split parent.
    fn hidden_tablets(&self) -> Vec<TabletInfo>;

    /// Current cluster hybrid time.
    fn current_hybrid_time(&self) -> HybridTime;

    /// Raises WAL retention of every tablet of a table.
    async fn set_wal_retention(&self, table_id: &TableId, retention_secs: u64) -> Result<()>;

    /// Asks tablet leaders of a table to establish a snapshot-safe op id for a stream.
    async fn populate_cdc_safe_op_ids(&self, table_id: &TableId, stream_id: StreamId)
        -> Result<()>;

    /// Safe op id reported by a tablet leader, if any yet.
    async fn get_tablet_safe_op_id(
        &self,
        tablet_id: &TabletId,
        stream_id: StreamId,
    ) -> Result<Option<OpId>>;

    /// Whether a tablet's log was already garbage collected past its start.
    async fn tablet_requires_bootstrap(&self, tablet_id: &TabletId) -> Result<bool>;

    /// Deletes a hidden split parent.
    async fn delete_hidden_tablet(&self, tablet_id: &TabletId) -> Result<()>;
}

/// Local snapshot operations used by the bootstrap pipeline.
#[async_trait]
pub trait SnapshotCoordinator: Send + Sync {
    /// Snapshots a set of tables.
    async fn create_snapshot(&self, table_ids: &[TableId]) -> Result<SnapshotId>;

    /// Deletes a snapshot.
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<()>;

    /// Recreates the objects of a producer snapshot locally.
    async fn import_snapshot(&self, meta: &SnapshotMeta) -> Result<ImportedObjects>;

    /// Drops objects created by an import.
    async fn delete_imported_objects(&self, imported: &ImportedObjects) -> Result<()>;

    /// Copies producer snapshot files into the consumer snapshot.
    async fn transfer_snapshot(
        &self,
        producer_snapshot_id: &SnapshotId,
        consumer_snapshot_id: &SnapshotId,
        producer_master_addresses: &[String],
    ) -> Result<()>;

    /// Starts restoring a snapshot.
    async fn restore_snapshot(&self, snapshot_id: &SnapshotId) -> Result<RestorationId>;

    /// Progress of a restoration.
    async fn restoration_state(&self, restoration_id: &RestorationId) -> Result<RestorationState>;
}

/// Shape of a table created through [`MemoryTableCatalog::create_table_with`].
#[derive(Clone, Debug)]
pub struct TableSpec {
    /// Table name.
    pub name: String,
    /// Number of tablets.
    pub num_tablets: usize,
    /// Relation kind.
    pub relation_type: RelationType,
    /// Table has a user-visible primary key.
    pub has_user_primary_key: bool,
    /// Storage flavour.
    pub table_type: TableType,
}

impl TableSpec {
    /// A user table with a primary key.
    pub fn user(name: &str, num_tablets: usize) -> Self {
        Self {
            name: name.to_string(),
            num_tablets,
            relation_type: RelationType::User,
            has_user_primary_key: true,
            table_type: TableType::Pgsql,
        }
    }
}

/// Collaborator call names accepted by [`MemoryTableCatalog::fail_operation`].
pub mod ops {
    /// `set_wal_retention`
    pub const SET_WAL_RETENTION: &str = "set_wal_retention";
    /// `populate_cdc_safe_op_ids`
    pub const POPULATE_SAFE_OP_IDS: &str = "populate_cdc_safe_op_ids";
    /// `create_snapshot`
    pub const CREATE_SNAPSHOT: &str = "create_snapshot";
    /// `import_snapshot`
    pub const IMPORT_SNAPSHOT: &str = "import_snapshot";
    /// `transfer_snapshot`
    pub const TRANSFER_SNAPSHOT: &str = "transfer_snapshot";
    /// `restore_snapshot`
    pub const RESTORE_SNAPSHOT: &str = "restore_snapshot";
    /// `delete_hidden_tablet`
    pub const DELETE_HIDDEN_TABLET: &str = "delete_hidden_tablet";
}

#[derive(Default)]
struct CatalogState {
    namespaces: BTreeMap<NamespaceId, NamespaceInfo>,
    tables: BTreeMap<TableId, TableInfo>,
    tablets: BTreeMap<TabletId, TabletInfo>,
    wal_retention: BTreeMap<TableId, u64>,
    safe_op_ids: BTreeMap<(TabletId, StreamId), OpId>,
    bootstrap_required: BTreeSet<TabletId>,
    snapshots: BTreeMap<SnapshotId, Vec<TableId>>,
    restorations: BTreeMap<RestorationId, usize>,
    failing_ops: BTreeSet<String>,
    next_id: u64,
    next_safe_index: i64,
}

impl CatalogState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:06}", prefix, self.next_id)
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.failing_ops.contains(op) {
            return Err(MasterError::Internal(format!("injected failure in {op}")));
        }
        Ok(())
    }
}

/// Complete in-memory catalog with failure injection.
pub struct MemoryTableCatalog {
    prefix: String,
    state: RwLock<CatalogState>,
    auto_populate_safe_op_ids: RwLock<bool>,
    restore_polls: usize,
}

impl MemoryTableCatalog {
    /// Creates an empty catalog whose generated ids start with `prefix`.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            state: RwLock::new(CatalogState::default()),
            auto_populate_safe_op_ids: RwLock::new(true),
            restore_polls: 1,
        }
    }

    /// When false, safe op ids appear only through [`Self::report_safe_op_id`].
    pub fn set_auto_populate_safe_op_ids(&self, enabled: bool) {
        *self.auto_populate_safe_op_ids.write() = enabled;
    }

    /// Makes the named operation fail until cleared.
    pub fn fail_operation(&self, op: &str) {
        self.state.write().failing_ops.insert(op.to_string());
    }

    /// Clears every injected failure.
    pub fn clear_failures(&self) {
        self.state.write().failing_ops.clear();
    }

    /// Creates a namespace.
    pub fn create_namespace(&self, name: &str) -> NamespaceId {
        let mut state = self.state.write();
        let id = NamespaceId::new(state.next(&format!("{}-ns", self.prefix)));
        state.namespaces.insert(
            id.clone(),
            NamespaceInfo {
                id: id.clone(),
                name: name.to_string(),
                colocated: false,
            },
        );
        id
    }

    /// Creates a user table with a primary key.
    pub fn create_table(&self, namespace_id: &NamespaceId, name: &str, num_tablets: usize) -> TableId {
        self.create_table_with(namespace_id, TableSpec::user(name, num_tablets))
    }

    /// Creates a table of any shape, splitting the key space evenly.
    pub fn create_table_with(&self, namespace_id: &NamespaceId, spec: TableSpec) -> TableId {
        let mut state = self.state.write();
        let id = TableId::new(state.next(&format!("{}-table", self.prefix)));
        let table = TableInfo {
            id: id.clone(),
            name: spec.name,
            namespace_id: namespace_id.clone(),
            pg_schema_name: "public".into(),
            table_type: spec.table_type,
            relation_type: spec.relation_type,
            has_user_primary_key: spec.has_user_primary_key,
            is_colocation_parent: false,
            colocation_id: None,
            parent_table_id: None,
            schema_version: 0,
            schema: TableSchema::simple(),
            state: TableState::Running,
            replica_identity: None,
        };
        state.tables.insert(id.clone(), table);
        let n = spec.num_tablets.max(1);
        for i in 0..n {
            let tablet_id = TabletId::new(state.next(&format!("{}-tablet", self.prefix)));
            let partition = Partition {
                start_key: split_point(i, n),
                end_key: split_point(i + 1, n),
            };
            state.tablets.insert(
                tablet_id.clone(),
                TabletInfo {
                    id: tablet_id,
                    table_id: id.clone(),
                    partition,
                    hidden: false,
                    split_children: Vec::new(),
                    hosted_table_ids: vec![id.clone()],
                },
            );
        }
        id
    }

    /// Creates a colocation parent with a single shared tablet.
    pub fn create_colocation_parent(&self, namespace_id: &NamespaceId, name: &str) -> TableId {
        let id = self.create_table(namespace_id, name, 1);
        let mut state = self.state.write();
        if let Some(table) = state.tables.get_mut(&id) {
            table.is_colocation_parent = true;
            table.relation_type = RelationType::System;
        }
        id
    }

    /// Creates a member table stored on the parent's tablet.
    pub fn create_colocated_table(
        &self,
        parent_table_id: &TableId,
        name: &str,
        colocation_id: u32,
    ) -> Result<TableId> {
        let mut state = self.state.write();
        let parent = state
            .tables
            .get(parent_table_id)
            .cloned()
            .ok_or_else(|| MasterError::NotFound(format!("table {parent_table_id}")))?;
        let id = TableId::new(state.next(&format!("{}-table", self.prefix)));
        state.tables.insert(
            id.clone(),
            TableInfo {
                id: id.clone(),
                name: name.to_string(),
                namespace_id: parent.namespace_id.clone(),
                pg_schema_name: "public".into(),
                table_type: TableType::Pgsql,
                relation_type: RelationType::User,
                has_user_primary_key: true,
                is_colocation_parent: false,
                colocation_id: Some(colocation_id),
                parent_table_id: Some(parent_table_id.clone()),
                schema_version: 0,
                schema: TableSchema::simple(),
                state: TableState::Running,
                replica_identity: None,
            },
        );
        for tablet in state.tablets.values_mut() {
            if &tablet.table_id == parent_table_id {
                tablet.hosted_table_ids.push(id.clone());
            }
        }
        Ok(id)
    }

    /// Marks a table dropped. Its tablets stay so state rows can be reconciled.
    pub fn drop_table(&self, table_id: &TableId) -> Result<()> {
        let mut state = self.state.write();
        let table = state
            .tables
            .get_mut(table_id)
            .ok_or_else(|| MasterError::NotFound(format!("table {table_id}")))?;
        table.state = TableState::Deleted;
        Ok(())
    }

    /// Removes a namespace and every table in it.
    pub fn drop_namespace(&self, namespace_id: &NamespaceId) {
        let mut state = self.state.write();
        state.namespaces.remove(namespace_id);
        for table in state.tables.values_mut() {
            if &table.namespace_id == namespace_id {
                table.state = TableState::Deleted;
            }
        }
    }

    /// Bumps a table's schema version, optionally adding a column.
    pub fn alter_table(&self, table_id: &TableId, add_column: Option<&str>) -> Result<u32> {
        let mut state = self.state.write();
        let table = state
            .tables
            .get_mut(table_id)
            .ok_or_else(|| MasterError::NotFound(format!("table {table_id}")))?;
        if let Some(name) = add_column {
            table.schema.columns.push(ColumnSchema {
                name: name.to_string(),
                type_name: "text".into(),
                is_key: false,
            });
        }
        table.schema_version += 1;
        Ok(table.schema_version)
    }

    /// Splits a tablet at the middle of its key range. The parent is hidden.
    pub fn split_tablet(&self, tablet_id: &TabletId) -> Result<(TabletId, TabletId)> {
        let mut state = self.state.write();
        let parent = state
            .tablets
            .get(tablet_id)
            .cloned()
            .ok_or_else(|| MasterError::NotFound(format!("tablet {tablet_id}")))?;
        if parent.hidden {
            return Err(MasterError::IllegalState(format!(
                "tablet {tablet_id} already split"
            )));
        }
        let mid = midpoint(&parent.partition.start_key, &parent.partition.end_key);
        let left = TabletId::new(state.next(&format!("{}-tablet", self.prefix)));
        let right = TabletId::new(state.next(&format!("{}-tablet", self.prefix)));
        for (id, start, end) in [
            (&left, parent.partition.start_key.clone(), mid.clone()),
            (&right, mid.clone(), parent.partition.end_key.clone()),
        ] {
            state.tablets.insert(
                id.clone(),
                TabletInfo {
                    id: id.clone(),
                    table_id: parent.table_id.clone(),
                    partition: Partition {
                        start_key: start,
                        end_key: end,
                    },
                    hidden: false,
                    split_children: Vec::new(),
                    hosted_table_ids: parent.hosted_table_ids.clone(),
                },
            );
        }
        if let Some(p) = state.tablets.get_mut(tablet_id) {
            p.hidden = true;
            p.split_children = vec![left.clone(), right.clone()];
        }
        Ok((left, right))
    }

    /// Records the safe op id a tablet leader reported.
    pub fn report_safe_op_id(&self, tablet_id: &TabletId, stream_id: StreamId, op_id: OpId) {
        self.state
            .write()
            .safe_op_ids
            .insert((tablet_id.clone(), stream_id), op_id);
    }

    /// Marks every tablet of a table as having lost its log start.
    pub fn mark_requires_bootstrap(&self, table_id: &TableId) {
        let mut state = self.state.write();
        let ids: Vec<TabletId> = state
            .tablets
            .values()
            .filter(|t| &t.table_id == table_id)
            .map(|t| t.id.clone())
            .collect();
        state.bootstrap_required.extend(ids);
    }

    /// WAL retention last set on a table.
    pub fn wal_retention(&self, table_id: &TableId) -> Option<u64> {
        self.state.read().wal_retention.get(table_id).copied()
    }

    /// Number of live snapshots.
    pub fn snapshot_count(&self) -> usize {
        self.state.read().snapshots.len()
    }

    /// Snapshot meta of an existing snapshot.
    pub fn snapshot_meta(&self, snapshot_id: &SnapshotId) -> Result<SnapshotMeta> {
        let state = self.state.read();
        let tables = state
            .snapshots
            .get(snapshot_id)
            .ok_or_else(|| MasterError::NotFound(format!("snapshot {snapshot_id}")))?;
        let mut out = Vec::new();
        let mut namespace = None;
        for table_id in tables {
            let Some(table) = state.tables.get(table_id) else {
                continue;
            };
            if namespace.is_none() {
                namespace = state.namespaces.get(&table.namespace_id).cloned();
            }
            let count = state
                .tablets
                .values()
                .filter(|t| &t.table_id == table_id && !t.hidden)
                .count();
            out.push((table.clone(), count));
        }
        let namespace = namespace
            .ok_or_else(|| MasterError::NotFound(format!("namespace of snapshot {snapshot_id}")))?;
        Ok(SnapshotMeta {
            snapshot_id: snapshot_id.clone(),
            namespace,
            tables: out,
        })
    }
}

fn split_point(i: usize, n: usize) -> Vec<u8> {
    if i == 0 || i >= n {
        return Vec::new();
    }
    let point = (i * 0x1_0000 / n) as u16;
    point.to_be_bytes().to_vec()
}

fn key_value(key: &[u8], unbounded: u32) -> u32 {
    if key.is_empty() {
        return unbounded;
    }
    let mut buf = [0u8; 2];
    for (i, b) in key.iter().take(2).enumerate() {
        buf[i] = *b;
    }
    u16::from_be_bytes(buf) as u32
}

fn midpoint(start: &[u8], end: &[u8]) -> Vec<u8> {
    let lo = key_value(start, 0);
    let hi = key_value(end, 0x1_0000);
    let mid = (lo + (hi - lo) / 2) as u16;
    mid.to_be_bytes().to_vec()
}

#[async_trait]
impl TableCatalog for MemoryTableCatalog {
    fn get_table(&self, table_id: &TableId) -> Option<TableInfo> {
        self.state.read().tables.get(table_id).cloned()
    }

    fn get_namespace(&self, namespace_id: &NamespaceId) -> Option<NamespaceInfo> {
        self.state.read().namespaces.get(namespace_id).cloned()
    }

    fn find_namespace_by_name(&self, name: &str) -> Option<NamespaceInfo> {
        self.state
            .read()
            .namespaces
            .values()
            .find(|ns| ns.name == name)
            .cloned()
    }

    fn find_table_by_name(
        &self,
        namespace_id: &NamespaceId,
        pg_schema_name: &str,
        name: &str,
    ) -> Option<TableInfo> {
        self.state
            .read()
            .tables
            .values()
            .find(|t| {
                t.is_running()
                    && &t.namespace_id == namespace_id
                    && t.pg_schema_name == pg_schema_name
                    && t.name == name
            })
            .cloned()
    }

    fn list_tables(&self, namespace_id: &NamespaceId) -> Vec<TableInfo> {
        self.state
            .read()
            .tables
            .values()
            .filter(|t| t.is_running() && &t.namespace_id == namespace_id)
            .cloned()
            .collect()
    }

    fn get_tablets(&self, table_id: &TableId) -> Result<Vec<TabletInfo>> {
        let state = self.state.read();
        let table = state
            .tables
            .get(table_id)
            .ok_or_else(|| MasterError::NotFound(format!("table {table_id}")))?;
        let owner = table.parent_table_id.as_ref().unwrap_or(table_id);
        Ok(state
            .tablets
            .values()
            .filter(|t| &t.table_id == owner && !t.hidden)
            .cloned()
            .collect())
    }

    fn get_tablet(&self, tablet_id: &TabletId) -> Option<TabletInfo> {
        self.state.read().tablets.get(tablet_id).cloned()
    }

    fn hidden_tablets(&self) -> Vec<TabletInfo> {
        self.state
            .read()
            .tablets
            .values()
            .filter(|t| t.hidden)
            .cloned()
            .collect()
    }

    fn current_hybrid_time(&self) -> HybridTime {
        HybridTime::now()
    }

    async fn set_wal_retention(&self, table_id: &TableId, retention_secs: u64) -> Result<()> {
        let mut state = self.state.write();
        state.check(ops::SET_WAL_RETENTION)?;
        if !state.tables.contains_key(table_id) {
            return Err(MasterError::NotFound(format!("table {table_id}")));
        }
        let slot = state.wal_retention.entry(table_id.clone()).or_insert(0);
        *slot = (*slot).max(retention_secs);
        Ok(())
    }

    async fn populate_cdc_safe_op_ids(
        &self,
        table_id: &TableId,
        stream_id: StreamId,
    ) -> Result<()> {
        let auto = *self.auto_populate_safe_op_ids.read();
        let tablets = self.get_tablets(table_id)?;
        let mut state = self.state.write();
        state.check(ops::POPULATE_SAFE_OP_IDS)?;
        if auto {
            for tablet in tablets {
                state.next_safe_index += 1;
                let op = OpId::new(1, state.next_safe_index);
                state.safe_op_ids.insert((tablet.id, stream_id), op);
            }
        }
        Ok(())
    }

    async fn get_tablet_safe_op_id(
        &self,
        tablet_id: &TabletId,
        stream_id: StreamId,
    ) -> Result<Option<OpId>> {
        Ok(self
            .state
            .read()
            .safe_op_ids
            .get(&(tablet_id.clone(), stream_id))
            .copied())
    }

    async fn tablet_requires_bootstrap(&self, tablet_id: &TabletId) -> Result<bool> {
        let state = self.state.read();
        if !state.tablets.contains_key(tablet_id) {
            return Err(MasterError::NotFound(format!("tablet {tablet_id}")));
        }
        Ok(state.bootstrap_required.contains(tablet_id))
    }

    async fn delete_hidden_tablet(&self, tablet_id: &TabletId) -> Result<()> {
        let mut state = self.state.write();
        state.check(ops::DELETE_HIDDEN_TABLET)?;
        match state.tablets.get(tablet_id).map(|t| t.hidden) {
            Some(true) => {
                state.tablets.remove(tablet_id);
                Ok(())
            }
            Some(false) => Err(MasterError::IllegalState(format!(
                "tablet {tablet_id} is not hidden"
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SnapshotCoordinator for MemoryTableCatalog {
    async fn create_snapshot(&self, table_ids: &[TableId]) -> Result<SnapshotId> {
        let mut state = self.state.write();
        state.check(ops::CREATE_SNAPSHOT)?;
        for id in table_ids {
            if !state.tables.contains_key(id) {
                return Err(MasterError::NotFound(format!("table {id}")));
            }
        }
        let id = SnapshotId::new(state.next(&format!("{}-snapshot", self.prefix)));
        state.snapshots.insert(id.clone(), table_ids.to_vec());
        Ok(id)
    }

    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<()> {
        self.state.write().snapshots.remove(snapshot_id);
        Ok(())
    }

    async fn import_snapshot(&self, meta: &SnapshotMeta) -> Result<ImportedObjects> {
        self.state.read().check(ops::IMPORT_SNAPSHOT)?;
        let mut imported = ImportedObjects::default();
        let namespace_id = match self.find_namespace_by_name(&meta.namespace.name) {
            Some(ns) => ns.id,
            None => {
                let id = self.create_namespace(&meta.namespace.name);
                imported.new_namespace_ids.push(id.clone());
                id
            }
        };
        imported
            .namespace_map
            .insert(meta.namespace.id.clone(), namespace_id.clone());
        for (table, num_tablets) in &meta.tables {
            let local = match self.find_table_by_name(&namespace_id, &table.pg_schema_name, &table.name)
            {
                Some(t) => t.id,
                None => {
                    let id = self.create_table_with(
                        &namespace_id,
                        TableSpec {
                            name: table.name.clone(),
                            num_tablets: *num_tablets,
                            relation_type: table.relation_type,
                            has_user_primary_key: table.has_user_primary_key,
                            table_type: table.table_type,
                        },
                    );
                    imported.new_table_ids.push(id.clone());
                    id
                }
            };
            imported.table_map.insert(table.id.clone(), local);
        }
        Ok(imported)
    }

    async fn delete_imported_objects(&self, imported: &ImportedObjects) -> Result<()> {
        let mut state = self.state.write();
        for table_id in &imported.new_table_ids {
            state.tables.remove(table_id);
            state.tablets.retain(|_, t| &t.table_id != table_id);
        }
        for ns in &imported.new_namespace_ids {
            state.namespaces.remove(ns);
        }
        Ok(())
    }

    async fn transfer_snapshot(
        &self,
        _producer_snapshot_id: &SnapshotId,
        consumer_snapshot_id: &SnapshotId,
        _producer_master_addresses: &[String],
    ) -> Result<()> {
        let state = self.state.read();
        state.check(ops::TRANSFER_SNAPSHOT)?;
        if !state.snapshots.contains_key(consumer_snapshot_id) {
            return Err(MasterError::NotFound(format!(
                "snapshot {consumer_snapshot_id}"
            )));
        }
        Ok(())
    }

    async fn restore_snapshot(&self, snapshot_id: &SnapshotId) -> Result<RestorationId> {
        let mut state = self.state.write();
        state.check(ops::RESTORE_SNAPSHOT)?;
        if !state.snapshots.contains_key(snapshot_id) {
            return Err(MasterError::NotFound(format!("snapshot {snapshot_id}")));
        }
        let id = RestorationId::new(state.next(&format!("{}-restoration", self.prefix)));
        state.restorations.insert(id.clone(), self.restore_polls);
        Ok(id)
    }

    async fn restoration_state(&self, restoration_id: &RestorationId) -> Result<RestorationState> {
        let mut state = self.state.write();
        let remaining = state
            .restorations
            .get_mut(restoration_id)
            .ok_or_else(|| MasterError::NotFound(format!("restoration {restoration_id}")))?;
        if *remaining == 0 {
            return Ok(RestorationState::Restored);
        }
        *remaining -= 1;
        Ok(RestorationState::Restoring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table_splits_key_space() {
        let catalog = MemoryTableCatalog::new("c");
        let ns = catalog.create_namespace("db");
        let table = catalog.create_table(&ns, "t", 4);
        let tablets = catalog.get_tablets(&table).unwrap();
        assert_eq!(tablets.len(), 4);
        assert!(tablets[0].partition.start_key.is_empty());
        assert!(tablets[3].partition.end_key.is_empty());
        assert_eq!(tablets[1].partition.start_key, tablets[0].partition.end_key);
    }

    #[test]
    fn test_split_hides_parent() {
        let catalog = MemoryTableCatalog::new("c");
        let ns = catalog.create_namespace("db");
        let table = catalog.create_table(&ns, "t", 1);
        let parent = catalog.get_tablets(&table).unwrap()[0].id.clone();
        let (left, right) = catalog.split_tablet(&parent).unwrap();
        let visible: Vec<_> = catalog
            .get_tablets(&table)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(visible.len(), 2);
        assert!(visible.contains(&left) && visible.contains(&right));
        assert_eq!(catalog.hidden_tablets().len(), 1);
        let l = catalog.get_tablet(&left).unwrap();
        let r = catalog.get_tablet(&right).unwrap();
        assert_eq!(l.partition.end_key, r.partition.start_key);
    }

    #[test]
    fn test_colocated_members_share_tablet() {
        let catalog = MemoryTableCatalog::new("c");
        let ns = catalog.create_namespace("db");
        let parent = catalog.create_colocation_parent(&ns, "tg");
        let a = catalog.create_colocated_table(&parent, "a", 1).unwrap();
        let b = catalog.create_colocated_table(&parent, "b", 2).unwrap();
        let ta = catalog.get_tablets(&a).unwrap();
        let tb = catalog.get_tablets(&b).unwrap();
        assert_eq!(ta, tb);
        assert_eq!(ta[0].hosted_table_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_safe_op_ids_auto_populate() {
        let catalog = MemoryTableCatalog::new("c");
        let ns = catalog.create_namespace("db");
        let table = catalog.create_table(&ns, "t", 2);
        let stream = StreamId::generate();
        catalog.populate_cdc_safe_op_ids(&table, stream).await.unwrap();
        for tablet in catalog.get_tablets(&table).unwrap() {
            assert!(catalog
                .get_tablet_safe_op_id(&tablet.id, stream)
                .await
                .unwrap()
                .is_some());
        }
    }

    #[tokio::test]
    async fn test_restore_completes_after_polls() {
        let catalog = MemoryTableCatalog::new("c");
        let ns = catalog.create_namespace("db");
        let table = catalog.create_table(&ns, "t", 1);
        let snap = catalog.create_snapshot(&[table]).await.unwrap();
        let restoration = catalog.restore_snapshot(&snap).await.unwrap();
        assert_eq!(
            catalog.restoration_state(&restoration).await.unwrap(),
            RestorationState::Restoring
        );
        assert_eq!(
            catalog.restoration_state(&restoration).await.unwrap(),
            RestorationState::Restored
        );
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let catalog = MemoryTableCatalog::new("c");
        let ns = catalog.create_namespace("db");
        let table = catalog.create_table(&ns, "t", 1);
        catalog.fail_operation(ops::SET_WAL_RETENTION);
        assert!(catalog.set_wal_retention(&table, 10).await.is_err());
        catalog.clear_failures();
        catalog.set_wal_retention(&table, 10).await.unwrap();
        assert_eq!(catalog.wal_retention(&table), Some(10));
    }
}
