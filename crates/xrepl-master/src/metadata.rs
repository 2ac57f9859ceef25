//! Persisted record shapes and their in-memory handles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cow::{CowObject, WriteHandle};
use crate::sys_catalog::{SysCatalogEntry, SysEntryType};
use crate::types::{
    CdcCheckpointType, CdcRecordFormat, CdcRecordType, CdcSourceType, CdcsdkSnapshotOption,
    HybridTime, IdType, NamespaceId,
    PgReplicaIdentity, ReplicationGroupId, RestorationId, SnapshotId, StreamId, TableId, TabletId,
};

/// Keys of a stream's option bag.
pub mod options {
    /// Which images a record carries.
    pub const RECORD_TYPE: &str = "record_type";
    /// Record encoding.
    pub const RECORD_FORMAT: &str = "record_format";
    /// Consumer family.
    pub const SOURCE_TYPE: &str = "source_type";
    /// Checkpoint advancement mode.
    pub const CHECKPOINT_TYPE: &str = "checkpoint_type";
    /// What the creation target id refers to.
    pub const ID_TYPE: &str = "id_type";
    /// Mirrors the lifecycle state of xCluster streams.
    pub const STATE: &str = "state";
}

/// Lifecycle state of a CDC stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SysCdcStreamState {
    /// Created for a replication group that has not finished setup.
    Initiated,
    /// Streaming.
    Active,
    /// Some covered tables were dropped; their rows are being reconciled.
    DeletingMetadata,
    /// Marked for deletion; background cleanup removes rows and the entity.
    Deleting,
    /// Gone.
    Deleted,
}

impl SysCdcStreamState {
    /// Option-bag spelling of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SysCdcStreamState::Initiated => "INITIATED",
            SysCdcStreamState::Active => "ACTIVE",
            SysCdcStreamState::DeletingMetadata => "DELETING_METADATA",
            SysCdcStreamState::Deleting => "DELETING",
            SysCdcStreamState::Deleted => "DELETED",
        }
    }

    /// Parses the option-bag spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INITIATED" => Some(SysCdcStreamState::Initiated),
            "ACTIVE" => Some(SysCdcStreamState::Active),
            "DELETING_METADATA" => Some(SysCdcStreamState::DeletingMetadata),
            "DELETING" => Some(SysCdcStreamState::Deleting),
            "DELETED" => Some(SysCdcStreamState::Deleted),
            _ => None,
        }
    }

    /// Streams in these states are hidden from reads.
    pub fn is_deleting(&self) -> bool {
        matches!(
            self,
            SysCdcStreamState::DeletingMetadata
                | SysCdcStreamState::Deleting
                | SysCdcStreamState::Deleted
        )
    }
}

/// Snapshot established when a consistent snapshot stream was created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentSnapshotInfo {
    /// Cluster-wide as-of time; unset until every tablet reported a safe op id.
    pub snapshot_time: Option<HybridTime>,
    /// What the creating session does with the snapshot.
    pub consistent_snapshot_option: CdcsdkSnapshotOption,
}

/// Persisted CDC stream record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SysCdcStreamEntry {
    /// Set for CDCSDK streams, unset for xCluster streams.
    pub namespace_id: Option<NamespaceId>,
    /// Tables the stream currently streams.
    pub table_ids: Vec<TableId>,
    /// Tables staged for removal.
    pub unqualified_table_ids: Vec<TableId>,
    /// Option bag, see [`options`].
    pub options: BTreeMap<String, String>,
    /// Lifecycle state.
    pub state: SysCdcStreamState,
    /// Replica identity per table, slot-backed streams only.
    pub replica_identity_map: BTreeMap<TableId, PgReplicaIdentity>,
    /// Logical replication slot backed by this stream.
    pub cdcsdk_ysql_replication_slot_name: Option<String>,
    /// Output plugin of the slot.
    pub cdcsdk_ysql_replication_slot_plugin_name: Option<String>,
    /// Present for consistent snapshot streams.
    pub consistent_snapshot: Option<ConsistentSnapshotInfo>,
    /// Creation wall time in microseconds.
    pub stream_creation_time: u64,
    /// Newly created tables are not added to the stream.
    pub cdcsdk_disable_dynamic_table_addition: bool,
    /// Stream belongs to a transactional replication group.
    pub transactional: bool,
}

impl SysCdcStreamEntry {
    /// A blank stream record in state `state`.
    pub fn new(state: SysCdcStreamState) -> Self {
        Self {
            namespace_id: None,
            table_ids: Vec::new(),
            unqualified_table_ids: Vec::new(),
            options: BTreeMap::new(),
            state,
            replica_identity_map: BTreeMap::new(),
            cdcsdk_ysql_replication_slot_name: None,
            cdcsdk_ysql_replication_slot_plugin_name: None,
            consistent_snapshot: None,
            stream_creation_time: 0,
            cdcsdk_disable_dynamic_table_addition: false,
            transactional: false,
        }
    }

    /// Returns the option value for `key`.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Namespace-scoped streams are CDCSDK streams.
    pub fn is_cdcsdk(&self) -> bool {
        self.namespace_id.is_some()
            || self
                .option(options::SOURCE_TYPE)
                .and_then(|s| s.parse::<CdcSourceType>().ok())
                == Some(CdcSourceType::Cdcsdk)
    }

    /// Stream feeds cross-cluster replication.
    pub fn is_xcluster(&self) -> bool {
        !self.is_cdcsdk()
    }

    /// Record format from the option bag.
    pub fn record_format(&self) -> Option<CdcRecordFormat> {
        self.option(options::RECORD_FORMAT)
            .and_then(|s| s.parse().ok())
    }

    /// Id type from the option bag.
    pub fn id_type(&self) -> Option<IdType> {
        self.option(options::ID_TYPE).and_then(|s| s.parse().ok())
    }

    /// The replication slot name, if non-empty.
    pub fn slot_name(&self) -> Option<&str> {
        self.cdcsdk_ysql_replication_slot_name
            .as_deref()
            .filter(|s| !s.is_empty())
    }

    /// Stream backs a logical replication slot.
    pub fn has_slot(&self) -> bool {
        self.slot_name().is_some()
    }

    /// Stream was created with consistent snapshot semantics.
    pub fn is_consistent_snapshot(&self) -> bool {
        self.consistent_snapshot.is_some()
    }

    /// Hidden from get and list.
    pub fn is_deleting(&self) -> bool {
        self.state.is_deleting()
    }

    /// Sets the state and keeps the mirrored option in sync.
    pub fn set_state(&mut self, state: SysCdcStreamState) {
        self.state = state;
        if self.options.contains_key(options::STATE) {
            self.options
                .insert(options::STATE.to_string(), state.as_str().to_string());
        }
    }

    /// Covers `table_id` as a qualified table.
    pub fn covers(&self, table_id: &TableId) -> bool {
        self.table_ids.contains(table_id)
    }

    /// Fills option keys missing from records written by older masters.
    /// Returns true if anything was added.
    pub fn backfill_default_options(&mut self) -> bool {
        let cdcsdk = self.is_cdcsdk();
        let defaults = [
            (options::RECORD_TYPE, CdcRecordType::Change.as_str()),
            (
                options::RECORD_FORMAT,
                if cdcsdk {
                    CdcRecordFormat::Proto.as_str()
                } else {
                    CdcRecordFormat::Wal.as_str()
                },
            ),
            (
                options::SOURCE_TYPE,
                if cdcsdk {
                    CdcSourceType::Cdcsdk.as_str()
                } else {
                    CdcSourceType::Xcluster.as_str()
                },
            ),
            (options::CHECKPOINT_TYPE, CdcCheckpointType::Implicit.as_str()),
            (
                options::ID_TYPE,
                if cdcsdk {
                    IdType::NamespaceId.as_str()
                } else {
                    IdType::TableId.as_str()
                },
            ),
        ];
        let mut changed = false;
        for (key, value) in defaults {
            if !self.options.contains_key(key) {
                self.options.insert(key.to_string(), value.to_string());
                changed = true;
            }
        }
        changed
    }
}

impl SysCatalogEntry for SysCdcStreamEntry {
    const ENTRY_TYPE: SysEntryType = SysEntryType::CdcStream;
}

/// Lifecycle state of a replication group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SysUniverseReplicationState {
    /// Waiting for per-table schema validation.
    Initializing,
    /// Every table validated; streams are being created.
    Validated,
    /// Registered in the consumer registry and replicating.
    Active,
    /// Setup failed; must be deleted before retrying.
    Failed,
    /// Being torn down.
    Deleting,
    /// Torn down.
    Deleted,
    /// Setup failed while a delete was in flight.
    DeletedError,
}

/// One producer namespace replicated into one consumer namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacePair {
    /// Namespace on the producer.
    pub producer_namespace_id: NamespaceId,
    /// Namespace on this cluster.
    pub consumer_namespace_id: NamespaceId,
}

/// Namespace pairs of a DB-scoped group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbScopedInfo {
    /// Replicated namespace pairs.
    pub namespace_infos: Vec<NamespacePair>,
}

/// Producer and consumer schema versions observed at validation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersionMapping {
    /// Producer schema version.
    pub producer_schema_version: u32,
    /// Matching consumer schema version.
    pub consumer_schema_version: u32,
}

/// Persisted replication group record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SysUniverseReplicationEntry {
    /// Master addresses of the producer cluster.
    pub producer_master_addresses: Vec<String>,
    /// Producer tables requested.
    pub tables: Vec<TableId>,
    /// Producer table to stream created on the producer.
    pub table_streams: BTreeMap<TableId, StreamId>,
    /// Producer table to the consumer table it was validated against.
    pub validated_tables: BTreeMap<TableId, TableId>,
    /// Schema version pairs per producer table.
    pub schema_version_mappings: BTreeMap<TableId, SchemaVersionMapping>,
    /// Schema version pairs per colocated table, keyed by parent and colocation id.
    pub colocated_schema_version_mappings: BTreeMap<TableId, BTreeMap<u32, SchemaVersionMapping>>,
    /// Bootstrap stream ids supplied by the request, aligned with `tables`.
    pub producer_bootstrap_ids: BTreeMap<TableId, StreamId>,
    /// Lifecycle state.
    pub state: SysUniverseReplicationState,
    /// Whether the group replicates transactionally.
    pub transactional: bool,
    /// Present for DB-scoped groups.
    pub db_scoped_info: Option<DbScopedInfo>,
    /// Last failure.
    pub error: Option<String>,
}

impl SysUniverseReplicationEntry {
    /// A new group in `Initializing`.
    pub fn new(producer_master_addresses: Vec<String>, tables: Vec<TableId>) -> Self {
        Self {
            producer_master_addresses,
            tables,
            table_streams: BTreeMap::new(),
            validated_tables: BTreeMap::new(),
            schema_version_mappings: BTreeMap::new(),
            colocated_schema_version_mappings: BTreeMap::new(),
            producer_bootstrap_ids: BTreeMap::new(),
            state: SysUniverseReplicationState::Initializing,
            transactional: false,
            db_scoped_info: None,
            error: None,
        }
    }

    /// The group is being or has been removed.
    pub fn is_deleted_or_failed(&self) -> bool {
        matches!(
            self.state,
            SysUniverseReplicationState::Failed
                | SysUniverseReplicationState::Deleting
                | SysUniverseReplicationState::Deleted
                | SysUniverseReplicationState::DeletedError
        )
    }

    /// Defined over namespaces rather than table lists.
    pub fn is_db_scoped(&self) -> bool {
        self.db_scoped_info.is_some()
    }
}

impl SysCatalogEntry for SysUniverseReplicationEntry {
    const ENTRY_TYPE: SysEntryType = SysEntryType::UniverseReplication;
}

/// Stage of the bootstrap pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SysUniverseBootstrapState {
    /// Request accepted.
    Initializing,
    /// Asking the producer for bootstrap stream ids.
    BootstrapProducer,
    /// Snapshotting the producer namespace.
    CreateProducerSnapshot,
    /// Importing the snapshot's objects locally.
    ImportSnapshot,
    /// Snapshotting the imported objects.
    CreateConsumerSnapshot,
    /// Copying snapshot files.
    TransferSnapshot,
    /// Restoring the consumer snapshot.
    RestoreSnapshot,
    /// Handing off to universe replication setup.
    SetupReplication,
    /// Finished.
    Done,
    /// A stage failed; see `failed_on`.
    Failed,
    /// Being cleaned up.
    Deleting,
    /// Cleaned up.
    Deleted,
    /// Cleanup failed.
    DeletedError,
}

impl SysUniverseBootstrapState {
    /// Parses the debug spelling of a stage, case-insensitively, ignoring underscores.
    pub fn parse(s: &str) -> Option<Self> {
        use SysUniverseBootstrapState::*;
        let norm: String = s
            .chars()
            .filter(|c| *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        [
            Initializing,
            BootstrapProducer,
            CreateProducerSnapshot,
            ImportSnapshot,
            CreateConsumerSnapshot,
            TransferSnapshot,
            RestoreSnapshot,
            SetupReplication,
            Done,
        ]
        .into_iter()
        .find(|st| format!("{st:?}").to_ascii_lowercase() == norm)
    }

    /// Terminal failure or cleanup states.
    pub fn is_failed_or_deleted(&self) -> bool {
        matches!(
            self,
            SysUniverseBootstrapState::Failed
                | SysUniverseBootstrapState::Deleting
                | SysUniverseBootstrapState::Deleted
                | SysUniverseBootstrapState::DeletedError
        )
    }
}

/// Objects created on this cluster by importing the producer snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedObjects {
    /// Producer namespace id to local namespace id.
    pub namespace_map: BTreeMap<NamespaceId, NamespaceId>,
    /// Producer table id to local table id.
    pub table_map: BTreeMap<TableId, TableId>,
    /// Producer type id to local type id.
    pub type_map: BTreeMap<String, String>,
    /// Namespaces newly created by the import.
    pub new_namespace_ids: Vec<NamespaceId>,
    /// Tables newly created by the import.
    pub new_table_ids: Vec<TableId>,
    /// Types newly created by the import.
    pub new_type_ids: Vec<String>,
}

/// Persisted bootstrap pipeline record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SysUniverseReplicationBootstrapEntry {
    /// Current stage.
    pub state: SysUniverseBootstrapState,
    /// Stage that failed.
    pub failed_on: Option<SysUniverseBootstrapState>,
    /// Master addresses of the producer.
    pub producer_master_addresses: Vec<String>,
    /// Producer namespace to replicate.
    pub producer_namespace_name: String,
    /// Replicate transactionally.
    pub transactional: bool,
    /// Producer table to bootstrap stream.
    pub table_bootstrap_ids: BTreeMap<TableId, StreamId>,
    /// Snapshot taken on the producer.
    pub producer_snapshot_id: Option<SnapshotId>,
    /// Snapshot taken of the imported objects.
    pub consumer_snapshot_id: Option<SnapshotId>,
    /// Restoration of the consumer snapshot.
    pub restoration_id: Option<RestorationId>,
    /// Objects created by the import.
    pub imported: ImportedObjects,
    /// Leader term that started the pipeline.
    pub leader_term: u64,
    /// Last failure.
    pub error: Option<String>,
}

impl SysUniverseReplicationBootstrapEntry {
    /// A new pipeline in `Initializing`.
    pub fn new(
        producer_master_addresses: Vec<String>,
        producer_namespace_name: String,
        leader_term: u64,
    ) -> Self {
        Self {
            state: SysUniverseBootstrapState::Initializing,
            failed_on: None,
            producer_master_addresses,
            producer_namespace_name,
            transactional: false,
            table_bootstrap_ids: BTreeMap::new(),
            producer_snapshot_id: None,
            consumer_snapshot_id: None,
            restoration_id: None,
            imported: ImportedObjects::default(),
            leader_term,
            error: None,
        }
    }
}

impl SysCatalogEntry for SysUniverseReplicationBootstrapEntry {
    const ENTRY_TYPE: SysEntryType = SysEntryType::UniverseReplicationBootstrap;
}

/// Current and previous producer/consumer schema versions of one stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersions {
    /// Latest producer version.
    pub current_producer_schema_version: u32,
    /// Consumer version matching the latest producer version.
    pub current_consumer_schema_version: u32,
    /// Previous producer version.
    pub old_producer_schema_version: u32,
    /// Consumer version matching the previous producer version.
    pub old_consumer_schema_version: u32,
}

/// A producer tablet and the key range it covers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerTabletRange {
    /// Producer tablet.
    pub tablet_id: TabletId,
    /// Inclusive start of the partition key range.
    pub start_key: Vec<u8>,
    /// Exclusive end of the range; empty means unbounded.
    pub end_key: Vec<u8>,
}

/// Registry entry for one replicated stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Table written on this cluster.
    pub consumer_table_id: TableId,
    /// Table read on the producer.
    pub producer_table_id: TableId,
    /// Consumer tablet to the producer tablets it polls.
    pub consumer_producer_tablet_map: BTreeMap<TabletId, Vec<ProducerTabletRange>>,
    /// Producer and consumer tablet counts match one to one.
    pub same_num_producer_consumer_tablets: bool,
    /// Producer and consumer run in the same process.
    pub local_tserver_optimized: bool,
    /// Schema versions of the stream.
    pub schema_versions: SchemaVersions,
    /// Schema versions per colocation id.
    pub colocated_schema_versions: BTreeMap<u32, SchemaVersions>,
}

/// Registry entry for one replication group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerEntry {
    /// Producer master addresses.
    pub master_addrs: Vec<String>,
    /// Replicated streams.
    pub stream_map: BTreeMap<StreamId, StreamEntry>,
    /// Replication paused.
    pub disable_stream: bool,
}

/// Registry tservers read to know what to poll.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerRegistry {
    /// Replication group to its producer entry.
    pub producer_map: BTreeMap<ReplicationGroupId, ProducerEntry>,
    /// Some group replicates transactionally.
    pub transactional: bool,
}

/// Persisted cluster config record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysClusterConfigEntry {
    /// Bumped on every registry change so tservers refresh.
    pub version: u64,
    /// The consumer registry.
    pub consumer_registry: ConsumerRegistry,
}

impl SysCatalogEntry for SysClusterConfigEntry {
    const ENTRY_TYPE: SysEntryType = SysEntryType::ClusterConfig;
}

/// Id of the single cluster config record.
pub const CLUSTER_CONFIG_ID: &str = "cluster_config";

/// An identified metadata object shared between the maps and in-flight tasks.
#[derive(Debug)]
pub struct CatalogEntity<I, T> {
    id: I,
    meta: CowObject<T>,
}

impl<I: Clone, T: Clone> CatalogEntity<I, T> {
    /// Wraps a committed record.
    pub fn new(id: I, record: T) -> Arc<Self> {
        Arc::new(Self {
            id,
            meta: CowObject::new(record),
        })
    }

    /// The entity id.
    pub fn id(&self) -> &I {
        &self.id
    }

    /// The committed record.
    pub fn read(&self) -> Arc<T> {
        self.meta.read()
    }

    /// Stages a write.
    pub async fn lock_for_write(&self) -> WriteHandle<T> {
        self.meta.lock_for_write().await
    }
}

/// A CDC stream.
pub type CdcStreamInfo = CatalogEntity<StreamId, SysCdcStreamEntry>;
/// A replication group.
pub type UniverseReplicationInfo = CatalogEntity<ReplicationGroupId, SysUniverseReplicationEntry>;
/// A bootstrap pipeline.
pub type UniverseReplicationBootstrapInfo =
    CatalogEntity<ReplicationGroupId, SysUniverseReplicationBootstrapEntry>;
/// The cluster config.
pub type ClusterConfigInfo = CatalogEntity<String, SysClusterConfigEntry>;
