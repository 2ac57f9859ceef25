//! Request and response messages of the xrepl RPC surface.
//!
//! Fields a handler cannot work without are `Option`s so that omission is
//! detected and reported as an invalid request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::metadata::{
    SysCdcStreamEntry, SysCdcStreamState, SysUniverseBootstrapState, SysUniverseReplicationEntry,
    SysUniverseReplicationState,
};
use crate::types::{
    CdcsdkSnapshotOption, HybridTime, IdType, NamespaceId, PgReplicaIdentity,
    ReplicationErrorCode, ReplicationGroupId, StreamId, TableId, TabletId,
};

/// Creates a CDC stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateCdcStreamRequest {
    /// Table of an xCluster stream.
    pub table_id: Option<TableId>,
    /// Namespace of a CDCSDK stream.
    pub namespace_id: Option<NamespaceId>,
    /// Option bag; `id_type` selects the creation path.
    pub options: BTreeMap<String, String>,
    /// Initial state of an xCluster stream.
    pub initial_state: Option<SysCdcStreamState>,
    /// Logical replication slot to back with the stream.
    pub cdcsdk_ysql_replication_slot_name: Option<String>,
    /// Output plugin of the slot.
    pub cdcsdk_ysql_replication_slot_plugin_name: Option<String>,
    /// Requests consistent snapshot semantics.
    pub cdcsdk_consistent_snapshot_option: Option<CdcsdkSnapshotOption>,
    /// Stream belongs to a transactional replication group.
    pub transactional: bool,
    /// Insert not-yet-streamed state rows for every tablet of an xCluster stream.
    pub populate_state_rows: bool,
    /// RPC timeout.
    pub timeout_ms: Option<u64>,
}

/// Result of [`CreateCdcStreamRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCdcStreamResponse {
    /// The new stream.
    pub stream_id: StreamId,
    /// Snapshot time of a consistent snapshot stream.
    pub cdcsdk_consistent_snapshot_time: Option<HybridTime>,
}

/// Marks streams for deletion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteCdcStreamRequest {
    /// Streams by id.
    pub stream_ids: Vec<StreamId>,
    /// Streams by replication slot name.
    pub cdcsdk_ysql_replication_slot_names: Vec<String>,
    /// Proceed with the streams that exist.
    pub ignore_errors: bool,
    /// Allow deleting an active xCluster stream.
    pub force_delete: bool,
}

/// Result of [`DeleteCdcStreamRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteCdcStreamResponse {
    /// Requested ids that did not exist.
    pub not_found_stream_ids: Vec<StreamId>,
    /// Requested slot names that did not exist.
    pub not_found_cdcsdk_ysql_replication_slot_names: Vec<String>,
}

/// Public view of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcStreamDescriptor {
    /// Stream id.
    pub stream_id: StreamId,
    /// Namespace of a CDCSDK stream.
    pub namespace_id: Option<NamespaceId>,
    /// Qualified tables.
    pub table_ids: Vec<TableId>,
    /// Tables staged for removal.
    pub unqualified_table_ids: Vec<TableId>,
    /// Option bag.
    pub options: BTreeMap<String, String>,
    /// Lifecycle state.
    pub state: SysCdcStreamState,
    /// Replication slot.
    pub cdcsdk_ysql_replication_slot_name: Option<String>,
    /// Slot output plugin.
    pub cdcsdk_ysql_replication_slot_plugin_name: Option<String>,
    /// Consistent snapshot time.
    pub cdcsdk_consistent_snapshot_time: Option<HybridTime>,
    /// Consistent snapshot option.
    pub cdcsdk_consistent_snapshot_option: Option<CdcsdkSnapshotOption>,
    /// Creation wall time in microseconds.
    pub stream_creation_time: u64,
    /// Replica identities per table.
    pub replica_identity_map: BTreeMap<TableId, PgReplicaIdentity>,
    /// Dynamic table addition disabled.
    pub cdcsdk_disable_dynamic_table_addition: bool,
    /// Transactional stream.
    pub transactional: bool,
}

impl CdcStreamDescriptor {
    /// Projects a stream record.
    pub fn from_entry(stream_id: StreamId, entry: &SysCdcStreamEntry) -> Self {
        Self {
            stream_id,
            namespace_id: entry.namespace_id.clone(),
            table_ids: entry.table_ids.clone(),
            unqualified_table_ids: entry.unqualified_table_ids.clone(),
            options: entry.options.clone(),
            state: entry.state,
            cdcsdk_ysql_replication_slot_name: entry.slot_name().map(String::from),
            cdcsdk_ysql_replication_slot_plugin_name: entry
                .cdcsdk_ysql_replication_slot_plugin_name
                .clone(),
            cdcsdk_consistent_snapshot_time: entry
                .consistent_snapshot
                .as_ref()
                .and_then(|s| s.snapshot_time),
            cdcsdk_consistent_snapshot_option: entry
                .consistent_snapshot
                .as_ref()
                .map(|s| s.consistent_snapshot_option),
            stream_creation_time: entry.stream_creation_time,
            replica_identity_map: entry.replica_identity_map.clone(),
            cdcsdk_disable_dynamic_table_addition: entry.cdcsdk_disable_dynamic_table_addition,
            transactional: entry.transactional,
        }
    }
}

/// Reads one stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetCdcStreamRequest {
    /// Stream by id.
    pub stream_id: Option<StreamId>,
    /// Stream by slot name.
    pub cdcsdk_ysql_replication_slot_name: Option<String>,
}

/// Lists streams.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListCdcStreamsRequest {
    /// Only streams covering this table.
    pub table_id: Option<TableId>,
    /// Only streams of this namespace.
    pub namespace_id: Option<NamespaceId>,
    /// Only namespace or only table streams.
    pub id_type: Option<IdType>,
}

/// One stream update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCdcStreamEntry {
    /// Stream to update.
    pub stream_id: Option<StreamId>,
    /// Replacement option bag; empty keeps the current one.
    pub options: BTreeMap<String, String>,
    /// Replacement state.
    pub state: Option<SysCdcStreamState>,
}

/// Overwrites metadata of several streams.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCdcStreamRequest {
    /// Updates to apply.
    pub entries: Vec<UpdateCdcStreamEntry>,
}

/// Asks whether tables need a bootstrap before replication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsBootstrapRequiredRequest {
    /// Producer tables.
    pub table_ids: Vec<TableId>,
    /// Existing stream to check the state rows of.
    pub stream_id: Option<StreamId>,
    /// RPC timeout.
    pub timeout_ms: Option<u64>,
}

/// Result of [`IsBootstrapRequiredRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsBootstrapRequiredResponse {
    /// Some table needs a bootstrap.
    pub bootstrap_required: bool,
}

/// Stages a table for removal from a CDCSDK stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveUserTableFromCdcsdkStreamRequest {
    /// Stream.
    pub stream_id: Option<StreamId>,
    /// Table to remove.
    pub table_id: Option<TableId>,
}

/// Stops new tables from joining a CDCSDK stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisableDynamicTableAdditionRequest {
    /// Stream.
    pub stream_id: Option<StreamId>,
}

/// Attaches a replication slot name to a legacy CDCSDK stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct YsqlBackfillReplicationSlotNameRequest {
    /// Stream.
    pub stream_id: Option<StreamId>,
    /// Slot name.
    pub cdcsdk_ysql_replication_slot_name: Option<String>,
}

/// Reads replication errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetReplicationStatusRequest {
    /// Only this group.
    pub replication_group_id: Option<ReplicationGroupId>,
}

/// Errors of one replicated stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// Group.
    pub replication_group_id: ReplicationGroupId,
    /// Stream.
    pub stream_id: StreamId,
    /// Reported errors with details.
    pub errors: Vec<(ReplicationErrorCode, String)>,
}

/// Result of [`GetReplicationStatusRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReplicationStatusResponse {
    /// One entry per stream.
    pub statuses: Vec<ReplicationStatus>,
}

/// Waits for streams to catch up to a point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitForReplicationDrainRequest {
    /// Streams to wait for.
    pub stream_ids: Vec<StreamId>,
    /// Target physical time in microseconds; now when unset.
    pub target_time: Option<u64>,
    /// RPC timeout.
    pub timeout_ms: Option<u64>,
}

/// Result of [`WaitForReplicationDrainRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitForReplicationDrainResponse {
    /// Stream and tablet pairs still behind the target at the deadline.
    pub undrained: Vec<(StreamId, TabletId)>,
}

/// A producer namespace named in a DB-scoped setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceIdentifier {
    /// Producer namespace id.
    pub id: NamespaceId,
    /// Namespace name, matched against the consumer.
    pub name: String,
}

/// Sets up an xCluster replication group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupUniverseReplicationRequest {
    /// Group id.
    pub replication_group_id: Option<ReplicationGroupId>,
    /// Producer master addresses.
    pub producer_master_addresses: Vec<String>,
    /// Producer tables.
    pub producer_table_ids: Vec<TableId>,
    /// Pre-created producer streams, aligned with `producer_table_ids`.
    pub producer_bootstrap_ids: Vec<StreamId>,
    /// Producer namespaces of a DB-scoped group.
    pub producer_namespaces: Vec<NamespaceIdentifier>,
    /// Replicate transactionally.
    pub transactional: bool,
}

/// Polls setup completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsSetupUniverseReplicationDoneRequest {
    /// Group id.
    pub replication_group_id: Option<ReplicationGroupId>,
}

/// Result of an `Is*Done` poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsOperationDoneResponse {
    /// Finished, successfully or not.
    pub done: bool,
    /// Failure, if finished unsuccessfully.
    pub error: Option<String>,
}

/// Alters a replication group. Exactly one change per request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlterUniverseReplicationRequest {
    /// Group id.
    pub replication_group_id: Option<ReplicationGroupId>,
    /// Replacement producer master addresses.
    pub producer_master_addresses: Vec<String>,
    /// Producer namespace to stop replicating (DB-scoped groups).
    pub producer_namespace_id_to_remove: Option<NamespaceId>,
    /// Producer tables to stop replicating.
    pub producer_table_ids_to_remove: Vec<TableId>,
    /// Producer tables to start replicating.
    pub producer_table_ids_to_add: Vec<TableId>,
    /// Pre-created producer streams for the added tables.
    pub producer_bootstrap_ids_to_add: Vec<StreamId>,
    /// New group id.
    pub new_replication_group_id: Option<ReplicationGroupId>,
}

/// Tears down a replication group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteUniverseReplicationRequest {
    /// Group id.
    pub replication_group_id: Option<ReplicationGroupId>,
    /// Keep going when producer calls fail.
    pub ignore_errors: bool,
    /// Leave producer streams in place.
    pub skip_producer_stream_deletion: bool,
}

/// Reads a replication group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetUniverseReplicationRequest {
    /// Group id.
    pub replication_group_id: Option<ReplicationGroupId>,
}

/// Result of [`GetUniverseReplicationRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetUniverseReplicationResponse {
    /// Group id.
    pub replication_group_id: ReplicationGroupId,
    /// Persisted record.
    pub entry: SysUniverseReplicationEntry,
}

impl GetUniverseReplicationResponse {
    /// Lifecycle state.
    pub fn state(&self) -> SysUniverseReplicationState {
        self.entry.state
    }
}

/// Sets up a namespace replication group after a full bootstrap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupNamespaceReplicationWithBootstrapRequest {
    /// Group id.
    pub replication_group_id: Option<ReplicationGroupId>,
    /// Producer master addresses.
    pub producer_master_addresses: Vec<String>,
    /// Producer namespace name.
    pub producer_namespace_name: Option<String>,
    /// Replicate transactionally.
    pub transactional: bool,
    /// RPC timeout applied to each blocking stage.
    pub timeout_ms: Option<u64>,
}

/// Polls bootstrap completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsSetupNamespaceReplicationWithBootstrapDoneRequest {
    /// Group id.
    pub replication_group_id: Option<ReplicationGroupId>,
}

/// Result of [`IsSetupNamespaceReplicationWithBootstrapDoneRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsSetupNamespaceReplicationWithBootstrapDoneResponse {
    /// Finished, successfully or not.
    pub done: bool,
    /// Current stage.
    pub state: SysUniverseBootstrapState,
    /// Failure, if any.
    pub error: Option<String>,
}

/// Producer-side tablet split as reported by a consumer tserver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerSplitTabletInfo {
    /// Split parent.
    pub tablet_id: TabletId,
    /// Child covering the lower half.
    pub new_tablet1_id: TabletId,
    /// Child covering the upper half.
    pub new_tablet2_id: TabletId,
    /// First key of the upper child.
    pub split_partition_key: Vec<u8>,
}

/// Applies a producer split to the consumer registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConsumerOnProducerSplitRequest {
    /// Group id.
    pub replication_group_id: Option<ReplicationGroupId>,
    /// Stream the split happened on.
    pub stream_id: Option<StreamId>,
    /// Split details.
    pub producer_split_tablet_info: Option<ProducerSplitTabletInfo>,
}

/// Reports a producer schema version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConsumerOnProducerMetadataRequest {
    /// Group id.
    pub replication_group_id: Option<ReplicationGroupId>,
    /// Stream.
    pub stream_id: Option<StreamId>,
    /// Colocated table within the stream.
    pub colocation_id: Option<u32>,
    /// Producer schema version.
    pub producer_schema_version: u32,
    /// Consumer schema version the tserver applies with.
    pub consumer_schema_version: u32,
}

/// Result of [`UpdateConsumerOnProducerMetadataRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConsumerOnProducerMetadataResponse {
    /// The tserver must wait for a newer consumer schema.
    pub should_wait: bool,
    /// Consumer version compatible with the reported producer version.
    pub last_compatible_consumer_schema_version: u32,
}
