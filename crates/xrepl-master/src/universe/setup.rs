//! Setup of an xCluster replication group.
//!
//! The kickoff call validates the request, persists the group in
//! `Initializing` and spawns the workflow. The workflow validates every
//! producer table against its consumer counterpart in parallel, creates one
//! producer stream per table once all of them validated, and finally registers
//! the group in the consumer registry. Task results come back as
//! [`SetupEvent`]s over a channel and are folded by [`SetupWorkflow`], which
//! decides when each fan-in barrier is passed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::{TableCatalog, TabletInfo};
use crate::error::{MasterError, Result};
use crate::manager::XreplCatalogManager;
use crate::metadata::{
    CatalogEntity, DbScopedInfo, NamespacePair, ProducerEntry, ProducerTabletRange,
    SchemaVersionMapping, SchemaVersions, StreamEntry, SysUniverseReplicationEntry,
    SysUniverseReplicationState, UniverseReplicationInfo,
};
use crate::producer::ProducerClient;
use crate::rpc::{IsOperationDoneResponse, SetupUniverseReplicationRequest};
use crate::sys_catalog::SysCatalogWriter;
use crate::types::{ReplicationGroupId, StreamId, TableId, TabletId};

use super::{
    is_alter_replication_group_id, original_replication_group_id, required_group_id,
};

/// What validation found for one producer table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedTable {
    /// Consumer table receiving the data; the consumer colocation parent for
    /// colocated tables.
    pub consumer_table_id: TableId,
    /// Schema versions of a non-colocated table.
    pub schema_version: Option<SchemaVersionMapping>,
    /// Schema versions of colocated member tables by colocation id.
    pub colocated_schema_versions: BTreeMap<u32, SchemaVersionMapping>,
}

/// Results reported by the workflow's tasks.
#[derive(Clone, Debug)]
pub enum SetupEvent {
    /// A producer table matched its consumer table.
    TableSchemaValidated {
        /// Producer table.
        producer_table_id: TableId,
        /// Validation result.
        validation: ValidatedTable,
    },
    /// The producer stream of a table exists.
    StreamReady {
        /// Producer table.
        producer_table_id: TableId,
        /// Its stream.
        stream_id: StreamId,
    },
    /// A task failed; the workflow stops.
    Failed {
        /// Cause.
        error: MasterError,
    },
}

/// Where the workflow stands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetupStage {
    /// Waiting for table validations.
    Validating,
    /// Waiting for producer streams.
    CreatingStreams,
    /// Writing the consumer registry.
    Registering,
    /// Done or failed.
    Finished,
}

/// What the driver must do next.
#[derive(Clone, Debug, PartialEq)]
pub enum SetupStep {
    /// Keep waiting for events.
    Wait,
    /// Every table validated; create the producer streams.
    CreateStreams,
    /// Every stream exists; register the group.
    Register,
    /// Stop with this error.
    Fail(MasterError),
}

/// Event-driven state of one setup run.
#[derive(Debug)]
pub struct SetupWorkflow {
    tables: BTreeSet<TableId>,
    validated: BTreeMap<TableId, ValidatedTable>,
    streams: BTreeMap<TableId, StreamId>,
    stage: SetupStage,
}

impl SetupWorkflow {
    /// A workflow over the given producer tables.
    pub fn new(tables: impl IntoIterator<Item = TableId>) -> Self {
        Self {
            tables: tables.into_iter().collect(),
            validated: BTreeMap::new(),
            streams: BTreeMap::new(),
            stage: SetupStage::Validating,
        }
    }

    /// First step. A group without tables goes straight to registration.
    pub fn start(&mut self) -> SetupStep {
        if self.tables.is_empty() {
            self.stage = SetupStage::Registering;
            return SetupStep::Register;
        }
        SetupStep::Wait
    }

    /// Folds an event in. Returns `None` for events that do not apply: late,
    /// duplicate or about an unknown table.
    pub fn handle(&mut self, event: &SetupEvent) -> Option<SetupStep> {
        match event {
            SetupEvent::TableSchemaValidated {
                producer_table_id,
                validation,
            } => {
                if self.stage != SetupStage::Validating
                    || !self.tables.contains(producer_table_id)
                    || self.validated.contains_key(producer_table_id)
                {
                    return None;
                }
                self.validated
                    .insert(producer_table_id.clone(), validation.clone());
                if self.validated.len() < self.tables.len() {
                    return Some(SetupStep::Wait);
                }
                self.stage = SetupStage::CreatingStreams;
                Some(SetupStep::CreateStreams)
            }
            SetupEvent::StreamReady {
                producer_table_id,
                stream_id,
            } => {
                if self.stage != SetupStage::CreatingStreams
                    || !self.tables.contains(producer_table_id)
                    || self.streams.contains_key(producer_table_id)
                {
                    return None;
                }
                self.streams.insert(producer_table_id.clone(), *stream_id);
                if self.streams.len() < self.tables.len() {
                    return Some(SetupStep::Wait);
                }
                self.stage = SetupStage::Registering;
                Some(SetupStep::Register)
            }
            SetupEvent::Failed { error } => {
                if self.stage == SetupStage::Finished {
                    return None;
                }
                self.stage = SetupStage::Finished;
                Some(SetupStep::Fail(error.clone()))
            }
        }
    }

    /// Marks the run complete.
    pub fn finish(&mut self) {
        self.stage = SetupStage::Finished;
    }

    /// Current stage.
    pub fn stage(&self) -> SetupStage {
        self.stage
    }

    /// Producer tables of the run.
    pub fn tables(&self) -> &BTreeSet<TableId> {
        &self.tables
    }

    /// Validations received so far.
    pub fn validated(&self) -> &BTreeMap<TableId, ValidatedTable> {
        &self.validated
    }

    /// Streams received so far.
    pub fn streams(&self) -> &BTreeMap<TableId, StreamId> {
        &self.streams
    }
}

/// Matches a producer table, or every member of a producer colocation parent,
/// with the same-named consumer tables.
async fn validate_producer_table(
    client: Arc<dyn ProducerClient>,
    tables: Arc<dyn TableCatalog>,
    producer_table_id: TableId,
    skip_schema_check: bool,
) -> Result<ValidatedTable> {
    let producer_tables = client.get_table_schema(&producer_table_id).await?;
    let first = producer_tables.first().ok_or_else(|| {
        MasterError::NotFound(format!("producer table {producer_table_id} has no replicable tables"))
    })?;
    let producer_ns = client.get_namespace(&first.namespace_id).await?;
    let consumer_ns = tables
        .find_namespace_by_name(&producer_ns.name)
        .ok_or_else(|| MasterError::NotFound(format!("consumer namespace {}", producer_ns.name)))?;

    let mut consumer_table_id = None;
    let mut schema_version = None;
    let mut colocated_schema_versions = BTreeMap::new();
    for producer in &producer_tables {
        let consumer = tables
            .find_table_by_name(&consumer_ns.id, &producer.pg_schema_name, &producer.name)
            .ok_or_else(|| {
                MasterError::NotFound(format!(
                    "consumer table {}.{}.{}",
                    consumer_ns.name, producer.pg_schema_name, producer.name
                ))
            })?;
        if !skip_schema_check && !producer.schema.is_compatible_with(&consumer.schema) {
            return Err(MasterError::IllegalState(format!(
                "schema of producer table {} does not match consumer table {}",
                producer.id, consumer.id
            )));
        }
        if producer.colocation_id != consumer.colocation_id {
            return Err(MasterError::IllegalState(format!(
                "colocation id of producer table {} ({:?}) does not match consumer table {} ({:?})",
                producer.id, producer.colocation_id, consumer.id, consumer.colocation_id
            )));
        }
        let mapping = SchemaVersionMapping {
            producer_schema_version: producer.schema_version,
            consumer_schema_version: consumer.schema_version,
        };
        match producer.colocation_id {
            Some(colocation_id) => {
                if producer.parent_table_id.as_ref() != Some(&producer_table_id) {
                    return Err(MasterError::IllegalState(format!(
                        "colocated table {} must be replicated through its parent",
                        producer.id
                    )));
                }
                let parent = consumer.parent_table_id.clone().ok_or_else(|| {
                    MasterError::IllegalState(format!("consumer table {} has no colocation parent", consumer.id))
                })?;
                if *consumer_table_id.get_or_insert_with(|| parent.clone()) != parent {
                    return Err(MasterError::IllegalState(format!(
                        "members of producer table {producer_table_id} map to different consumer parents"
                    )));
                }
                colocated_schema_versions.insert(colocation_id, mapping);
            }
            None => {
                consumer_table_id = Some(consumer.id.clone());
                schema_version = Some(mapping);
            }
        }
    }
    let consumer_table_id = consumer_table_id.ok_or_else(|| {
        MasterError::Internal(format!("no consumer table resolved for {producer_table_id}"))
    })?;
    Ok(ValidatedTable {
        consumer_table_id,
        schema_version,
        colocated_schema_versions,
    })
}

fn ranges_overlap(a: &TabletInfo, b: &TabletInfo) -> bool {
    let below_end = |start: &[u8], end: &[u8]| end.is_empty() || start < end;
    below_end(&a.partition.start_key, &b.partition.end_key)
        && below_end(&b.partition.start_key, &a.partition.end_key)
}

/// Consumer tablet to the producer tablets whose key ranges overlap it.
fn map_tablets(
    producer: &[TabletInfo],
    consumer: &[TabletInfo],
) -> BTreeMap<TabletId, Vec<ProducerTabletRange>> {
    consumer
        .iter()
        .map(|c| {
            let ranges = producer
                .iter()
                .filter(|p| ranges_overlap(p, c))
                .map(|p| ProducerTabletRange {
                    tablet_id: p.id.clone(),
                    start_key: p.partition.start_key.clone(),
                    end_key: p.partition.end_key.clone(),
                })
                .collect();
            (c.id.clone(), ranges)
        })
        .collect()
}

fn schema_versions(mapping: &SchemaVersionMapping) -> SchemaVersions {
    SchemaVersions {
        current_producer_schema_version: mapping.producer_schema_version,
        current_consumer_schema_version: mapping.consumer_schema_version,
        ..Default::default()
    }
}

impl XreplCatalogManager {
    /// Starts setting up a replication group. Returns once the group is
    /// persisted; progress is polled with
    /// [`is_setup_universe_replication_done`](Self::is_setup_universe_replication_done).
    pub async fn setup_universe_replication(
        self: &Arc<Self>,
        req: &SetupUniverseReplicationRequest,
    ) -> Result<()> {
        self.setup_universe_replication_internal(req, false).await
    }

    pub(crate) async fn setup_universe_replication_internal(
        self: &Arc<Self>,
        req: &SetupUniverseReplicationRequest,
        allow_alter: bool,
    ) -> Result<()> {
        self.leader_term()?;
        let group = required_group_id(&req.replication_group_id)?.clone();
        if is_alter_replication_group_id(&group) && !allow_alter {
            return Err(MasterError::InvalidArgument(format!(
                "replication group id {group} uses a reserved suffix"
            )));
        }
        if req.producer_master_addresses.is_empty() {
            return Err(MasterError::InvalidArgument(
                "producer master addresses are required".into(),
            ));
        }
        if let Some(addr) = req
            .producer_master_addresses
            .iter()
            .find(|a| self.config().master_addresses.contains(a))
        {
            return Err(MasterError::InvalidArgument(format!(
                "producer master address {addr} belongs to this cluster"
            )));
        }
        if req.producer_table_ids.is_empty() == req.producer_namespaces.is_empty() {
            return Err(MasterError::InvalidArgument(
                "exactly one of producer tables or producer namespaces is required".into(),
            ));
        }
        if !req.producer_bootstrap_ids.is_empty()
            && req.producer_bootstrap_ids.len() != req.producer_table_ids.len()
        {
            return Err(MasterError::InvalidArgument(format!(
                "{} bootstrap ids given for {} tables",
                req.producer_bootstrap_ids.len(),
                req.producer_table_ids.len()
            )));
        }
        if !req.producer_namespaces.is_empty() && !req.transactional {
            return Err(MasterError::InvalidArgument(
                "namespace replication must be transactional".into(),
            ));
        }
        if self.universe(&group).is_some() {
            return Err(MasterError::AlreadyPresent(format!("replication group {group}")));
        }

        let mut entry = SysUniverseReplicationEntry::new(
            req.producer_master_addresses.clone(),
            req.producer_table_ids.clone(),
        );
        entry.transactional = req.transactional;
        entry.producer_bootstrap_ids = req
            .producer_table_ids
            .iter()
            .cloned()
            .zip(req.producer_bootstrap_ids.iter().copied())
            .collect();
        if !req.producer_namespaces.is_empty() {
            let client = self
                .producers()
                .connect(&group, &req.producer_master_addresses)?;
            let mut info = DbScopedInfo::default();
            for ns in &req.producer_namespaces {
                let consumer_ns = self
                    .tables()
                    .find_namespace_by_name(&ns.name)
                    .ok_or_else(|| MasterError::NotFound(format!("consumer namespace {}", ns.name)))?;
                for table in client.list_namespace_tables(&ns.id).await? {
                    entry.tables.push(table.id);
                }
                info.namespace_infos.push(NamespacePair {
                    producer_namespace_id: ns.id.clone(),
                    consumer_namespace_id: consumer_ns.id,
                });
            }
            entry.db_scoped_info = Some(info);
        }

        let table_count = entry.tables.len();
        let universe = CatalogEntity::new(group.clone(), entry);
        {
            let mut maps = self.maps.write();
            if maps.universe_replication_map.contains_key(&group) {
                return Err(MasterError::AlreadyPresent(format!("replication group {group}")));
            }
            maps.universe_replication_map
                .insert(group.clone(), universe.clone());
        }
        let mut writer = SysCatalogWriter::new();
        writer.upsert(group.as_str(), &*universe.read())?;
        if let Err(e) = self.persist(writer).await {
            self.maps.write().universe_replication_map.remove(&group);
            return Err(e);
        }
        info!(replication_group_id = %group, tables = table_count, "setting up replication group");

        let manager = self.clone();
        tokio::spawn(async move { manager.run_setup_workflow(universe).await });
        Ok(())
    }

    async fn run_setup_workflow(self: Arc<Self>, universe: Arc<UniverseReplicationInfo>) {
        if let Err(e) = self.drive_setup_workflow(&universe).await {
            self.mark_universe_failed(&universe, &e).await;
        }
    }

    async fn drive_setup_workflow(self: &Arc<Self>, universe: &Arc<UniverseReplicationInfo>) -> Result<()> {
        let group = universe.id().clone();
        let meta = universe.read();
        let client = self
            .producers()
            .connect(&group, &meta.producer_master_addresses)?;
        let mut workflow = SetupWorkflow::new(meta.tables.iter().cloned());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut step = workflow.start();
        if step == SetupStep::Wait {
            let skip = self.config().xcluster_skip_schema_compatibility_checks;
            for table in workflow.tables() {
                let (client, tables, tx) = (client.clone(), self.tables().clone(), tx.clone());
                let table = table.clone();
                tokio::spawn(async move {
                    let event = match validate_producer_table(client, tables, table.clone(), skip).await {
                        Ok(validation) => SetupEvent::TableSchemaValidated {
                            producer_table_id: table,
                            validation,
                        },
                        Err(error) => SetupEvent::Failed { error },
                    };
                    let _ = tx.send(event);
                });
            }
        }

        loop {
            match step {
                SetupStep::Wait => {}
                SetupStep::CreateStreams => {
                    self.set_universe_state(universe, SysUniverseReplicationState::Validated)
                        .await?;
                    for table in workflow.tables() {
                        if let Some(stream_id) = meta.producer_bootstrap_ids.get(table) {
                            let _ = tx.send(SetupEvent::StreamReady {
                                producer_table_id: table.clone(),
                                stream_id: *stream_id,
                            });
                            continue;
                        }
                        let (client, tx, table) = (client.clone(), tx.clone(), table.clone());
                        let transactional = meta.transactional;
                        tokio::spawn(async move {
                            let event = match client.create_xcluster_stream(&table, transactional).await {
                                Ok(stream_id) => SetupEvent::StreamReady {
                                    producer_table_id: table,
                                    stream_id,
                                },
                                Err(error) => SetupEvent::Failed { error },
                            };
                            let _ = tx.send(event);
                        });
                    }
                }
                SetupStep::Register => {
                    self.register_universe(universe, client.as_ref()).await?;
                    workflow.finish();
                    break;
                }
                SetupStep::Fail(error) => return Err(error),
            }

            let event = rx
                .recv()
                .await
                .ok_or_else(|| MasterError::Internal("setup event channel closed".into()))?;
            let Some(next) = workflow.handle(&event) else {
                debug!(replication_group_id = %group, event = ?event, "ignoring setup event");
                step = SetupStep::Wait;
                continue;
            };
            match &event {
                SetupEvent::TableSchemaValidated {
                    producer_table_id,
                    validation,
                } => {
                    self.record_validated_table(universe, producer_table_id, validation)
                        .await?;
                    if let Some(limit) = self.config().test_fail_setup_replication_after_validated {
                        if workflow.validated().len() >= limit {
                            return Err(MasterError::IllegalState(format!(
                                "injected setup failure after {limit} validated tables"
                            )));
                        }
                    }
                }
                SetupEvent::StreamReady {
                    producer_table_id,
                    stream_id,
                } => {
                    self.record_table_stream(universe, producer_table_id, *stream_id)
                        .await?;
                }
                SetupEvent::Failed { .. } => {}
            }
            step = next;
        }

        if is_alter_replication_group_id(&group) {
            self.merge_universe_replication(&original_replication_group_id(&group), &group)
                .await?;
        }
        Ok(())
    }

    async fn set_universe_state(
        &self,
        universe: &Arc<UniverseReplicationInfo>,
        state: SysUniverseReplicationState,
    ) -> Result<()> {
        let mut l = universe.lock_for_write().await;
        l.mutable().state = state;
        let mut writer = SysCatalogWriter::new();
        writer.upsert(universe.id().as_str(), l.data())?;
        self.persist(writer).await?;
        l.commit();
        info!(replication_group_id = %universe.id(), state = ?state, "replication group state changed");
        Ok(())
    }

    /// Persists one validation result. The consumer table is claimed for the
    /// group under the maps write lock first, so two groups validating the
    /// same consumer table cannot both pass.
    async fn record_validated_table(
        &self,
        universe: &Arc<UniverseReplicationInfo>,
        producer_table_id: &TableId,
        validation: &ValidatedTable,
    ) -> Result<()> {
        let group = universe.id();
        let consumer = &validation.consumer_table_id;
        self.maps.write().claim_consumer_table(consumer, group)?;

        let mut l = universe.lock_for_write().await;
        let entry = l.mutable();
        entry
            .validated_tables
            .insert(producer_table_id.clone(), consumer.clone());
        if let Some(mapping) = validation.schema_version {
            entry
                .schema_version_mappings
                .insert(producer_table_id.clone(), mapping);
        }
        if !validation.colocated_schema_versions.is_empty() {
            entry.colocated_schema_version_mappings.insert(
                producer_table_id.clone(),
                validation.colocated_schema_versions.clone(),
            );
        }
        let mut writer = SysCatalogWriter::new();
        writer.upsert(group.as_str(), l.data())?;
        self.persist(writer).await?;
        l.commit();
        debug!(replication_group_id = %group, producer_table_id = %producer_table_id, consumer_table_id = %consumer, "validated table");
        Ok(())
    }

    async fn record_table_stream(
        &self,
        universe: &Arc<UniverseReplicationInfo>,
        producer_table_id: &TableId,
        stream_id: StreamId,
    ) -> Result<()> {
        let mut l = universe.lock_for_write().await;
        l.mutable()
            .table_streams
            .insert(producer_table_id.clone(), stream_id);
        let mut writer = SysCatalogWriter::new();
        writer.upsert(universe.id().as_str(), l.data())?;
        self.persist(writer).await?;
        l.commit();
        debug!(replication_group_id = %universe.id(), producer_table_id = %producer_table_id, stream_id = %stream_id, "producer stream ready");
        Ok(())
    }

    /// Adds the group to the consumer registry and activates it in one write.
    async fn register_universe(
        &self,
        universe: &Arc<UniverseReplicationInfo>,
        client: &dyn ProducerClient,
    ) -> Result<()> {
        let group = universe.id().clone();
        let meta = universe.read();
        let mut stream_map = BTreeMap::new();
        for (producer_table, stream_id) in &meta.table_streams {
            let consumer_table = meta.validated_tables.get(producer_table).ok_or_else(|| {
                MasterError::Internal(format!("producer table {producer_table} was not validated"))
            })?;
            let producer_tablets = client.get_table_tablets(producer_table).await?;
            let consumer_tablets = self.tables().get_tablets(consumer_table)?;
            stream_map.insert(
                *stream_id,
                StreamEntry {
                    consumer_table_id: consumer_table.clone(),
                    producer_table_id: producer_table.clone(),
                    consumer_producer_tablet_map: map_tablets(&producer_tablets, &consumer_tablets),
                    same_num_producer_consumer_tablets: producer_tablets.len() == consumer_tablets.len(),
                    local_tserver_optimized: false,
                    schema_versions: meta
                        .schema_version_mappings
                        .get(producer_table)
                        .map(schema_versions)
                        .unwrap_or_default(),
                    colocated_schema_versions: meta
                        .colocated_schema_version_mappings
                        .get(producer_table)
                        .map(|m| m.iter().map(|(id, v)| (*id, schema_versions(v))).collect())
                        .unwrap_or_default(),
                },
            );
        }

        let config = self.cluster_config();
        let mut ul = universe.lock_for_write().await;
        let mut cl = config.lock_for_write().await;
        if ul.data().is_deleted_or_failed() {
            return Err(MasterError::Aborted(format!(
                "replication group {group} left setup while registering"
            )));
        }
        ul.mutable().state = SysUniverseReplicationState::Active;
        let registry = &mut cl.mutable().consumer_registry;
        registry.producer_map.insert(
            group.clone(),
            ProducerEntry {
                master_addrs: meta.producer_master_addresses.clone(),
                stream_map,
                disable_stream: false,
            },
        );
        registry.transactional |= meta.transactional;
        cl.mutable().version += 1;

        let mut writer = SysCatalogWriter::new();
        writer.upsert(group.as_str(), ul.data())?;
        writer.upsert(config.id(), cl.data())?;
        self.persist(writer).await?;
        ul.commit();
        cl.commit();

        let mut maps = self.maps.write();
        for consumer in meta.validated_tables.values() {
            maps.xcluster_consumer_tables
                .insert(consumer.clone(), group.clone());
        }
        info!(replication_group_id = %group, streams = meta.table_streams.len(), "replication group active");
        Ok(())
    }

    /// Reports whether setup of a group finished, and how.
    pub fn is_setup_universe_replication_done(
        &self,
        group: &ReplicationGroupId,
    ) -> Result<IsOperationDoneResponse> {
        let Some(universe) = self.universe(group) else {
            if is_alter_replication_group_id(group) {
                // The shadow group is gone once merged into the original.
                return Ok(IsOperationDoneResponse {
                    done: true,
                    error: None,
                });
            }
            return Err(MasterError::NotFound(format!("replication group {group}")));
        };
        let meta = universe.read();
        let response = match meta.state {
            SysUniverseReplicationState::Active if !is_alter_replication_group_id(group) => {
                IsOperationDoneResponse {
                    done: true,
                    error: None,
                }
            }
            SysUniverseReplicationState::Failed | SysUniverseReplicationState::DeletedError => {
                IsOperationDoneResponse {
                    done: true,
                    error: Some(
                        meta.error
                            .clone()
                            .unwrap_or_else(|| "replication setup failed".into()),
                    ),
                }
            }
            SysUniverseReplicationState::Deleting | SysUniverseReplicationState::Deleted => {
                warn!(replication_group_id = %group, "setup polled on a group being deleted");
                IsOperationDoneResponse {
                    done: true,
                    error: Some(format!("replication group {group} was deleted")),
                }
            }
            _ => IsOperationDoneResponse {
                done: false,
                error: None,
            },
        };
        Ok(response)
    }
}
