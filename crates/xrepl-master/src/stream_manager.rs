//! CDC stream lifecycle.
//!
//! Namespace (CDCSDK) streams are created in stages tracked by
//! [`CreationState`]; a failure at any stage runs the matching compensation
//! before the error is returned. xCluster streams are a single persisted
//! record. Deletion only marks streams; the background sweep removes rows and
//! records later.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cdc_state::{
    entries_for_stream, CdcStateTableEntry, CdcStateTableEntrySelector, CdcStateTableKey,
};
use crate::dynamic_tables::eligible_tables;
use crate::error::{MasterError, Result};
use crate::fanout::fan_out_until;
use crate::manager::XreplCatalogManager;
use crate::metadata::{
    options, CatalogEntity, CdcStreamInfo, ConsistentSnapshotInfo, SysCdcStreamEntry,
    SysCdcStreamState,
};
use crate::rpc::{
    CdcStreamDescriptor, CreateCdcStreamRequest, CreateCdcStreamResponse, DeleteCdcStreamRequest,
    DeleteCdcStreamResponse, GetCdcStreamRequest, ListCdcStreamsRequest, UpdateCdcStreamRequest,
    WaitForReplicationDrainResponse,
};
use crate::sys_catalog::SysCatalogWriter;
use crate::types::{
    now_micros, CdcRecordFormat, CdcSourceType, CreationState, Deadline, HybridTime, IdType,
    NamespaceId, OpId, StreamId, TableId, TabletId,
};

/// Longest accepted replication slot name, exclusive.
pub const MAX_SLOT_NAME_LEN: usize = 64;

/// Slot names are non-empty, shorter than 64 bytes and use `[a-z0-9_]` only.
pub fn validate_slot_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MasterError::InvalidArgument(
            "replication slot name must not be empty".into(),
        ));
    }
    if name.len() >= MAX_SLOT_NAME_LEN {
        return Err(MasterError::InvalidArgument(format!(
            "replication slot name {name} is longer than {} characters",
            MAX_SLOT_NAME_LEN - 1
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(MasterError::InvalidArgument(format!(
            "replication slot name {name} may only contain lower case letters, digits and underscores"
        )));
    }
    Ok(())
}

fn parse_option<T: std::str::FromStr<Err = MasterError>>(
    opts: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>> {
    opts.get(key).map(|v| v.parse()).transpose()
}

fn stream_record_writer(stream_id: StreamId, entry: &SysCdcStreamEntry) -> Result<SysCatalogWriter> {
    let mut writer = SysCatalogWriter::new();
    writer.upsert(&stream_id.to_string(), entry)?;
    Ok(writer)
}

impl XreplCatalogManager {
    /// Creates a namespace or xCluster stream depending on `id_type` and the
    /// presence of a slot name.
    pub async fn create_cdc_stream(
        &self,
        req: &CreateCdcStreamRequest,
        deadline: Deadline,
    ) -> Result<CreateCdcStreamResponse> {
        self.leader_term()?;
        let id_type: Option<IdType> = parse_option(&req.options, options::ID_TYPE)?;
        let source: Option<CdcSourceType> = parse_option(&req.options, options::SOURCE_TYPE)?;
        parse_option::<CdcRecordFormat>(&req.options, options::RECORD_FORMAT)?;

        let has_slot = req
            .cdcsdk_ysql_replication_slot_name
            .as_deref()
            .is_some_and(|s| !s.is_empty());
        if id_type == Some(IdType::NamespaceId) || has_slot {
            let namespace_id = req.namespace_id.clone().ok_or_else(|| {
                MasterError::InvalidArgument("namespace stream requires a namespace id".into())
            })?;
            return self
                .create_namespace_stream(req, &namespace_id, deadline)
                .await;
        }
        if source == Some(CdcSourceType::Cdcsdk) {
            return Err(MasterError::InvalidArgument(
                "CDCSDK streams must be created on a namespace".into(),
            ));
        }
        let table_id = req.table_id.clone().ok_or_else(|| {
            MasterError::InvalidArgument("xCluster stream requires a table id".into())
        })?;
        let stream_id = self.create_xcluster_stream(req, &table_id).await?;
        Ok(CreateCdcStreamResponse {
            stream_id,
            cdcsdk_consistent_snapshot_time: None,
        })
    }

    async fn create_namespace_stream(
        &self,
        req: &CreateCdcStreamRequest,
        namespace_id: &NamespaceId,
        deadline: Deadline,
    ) -> Result<CreateCdcStreamResponse> {
        if self.tables().get_namespace(namespace_id).is_none() {
            return Err(MasterError::NotFound(format!("namespace {namespace_id}")));
        }
        let slot_name = req.cdcsdk_ysql_replication_slot_name.clone();
        if let Some(name) = &slot_name {
            validate_slot_name(name)?;
        }
        if let Some(option) = req.cdcsdk_consistent_snapshot_option {
            if !self.config().yb_enable_cdc_consistent_snapshot_streams {
                return Err(MasterError::NotSupported(format!(
                    "consistent snapshot option {option} is disabled"
                )));
            }
            if slot_name.is_none() {
                return Err(MasterError::InvalidArgument(
                    "consistent snapshot streams require a replication slot".into(),
                ));
            }
        }

        let tables = eligible_tables(self.tables().as_ref(), namespace_id, self.config());
        let mut entry = SysCdcStreamEntry::new(SysCdcStreamState::Initiated);
        entry.namespace_id = Some(namespace_id.clone());
        entry.table_ids = tables.iter().map(|t| t.id.clone()).collect();
        entry.options = req.options.clone();
        entry
            .options
            .insert(options::ID_TYPE.to_string(), IdType::NamespaceId.as_str().to_string());
        entry.options.insert(
            options::SOURCE_TYPE.to_string(),
            CdcSourceType::Cdcsdk.as_str().to_string(),
        );
        entry.backfill_default_options();
        if slot_name.is_some() {
            for table in &tables {
                entry.replica_identity_map.insert(
                    table.id.clone(),
                    table
                        .replica_identity
                        .unwrap_or(self.config().default_replica_identity),
                );
            }
        }
        entry.cdcsdk_ysql_replication_slot_name = slot_name.clone();
        entry.cdcsdk_ysql_replication_slot_plugin_name =
            req.cdcsdk_ysql_replication_slot_plugin_name.clone();
        entry.consistent_snapshot =
            req.cdcsdk_consistent_snapshot_option
                .map(|option| ConsistentSnapshotInfo {
                    snapshot_time: None,
                    consistent_snapshot_option: option,
                });
        entry.stream_creation_time = now_micros();
        entry.transactional = req.transactional;

        let stream = {
            let mut maps = self.maps.write();
            if let Some(name) = &slot_name {
                if maps.replication_slot_to_stream.contains_key(name) {
                    return Err(MasterError::AlreadyPresent(format!(
                        "replication slot {name}"
                    )));
                }
                if maps.slot_count() >= self.config().max_replication_slots {
                    return Err(MasterError::IllegalState(format!(
                        "all {} replication slots are in use",
                        self.config().max_replication_slots
                    )));
                }
            }
            let existing = maps.cdcsdk_streams_for_namespace(namespace_id);
            if existing.iter().any(|s| s.read().has_slot() != slot_name.is_some()) {
                return Err(MasterError::IllegalState(format!(
                    "namespace {namespace_id} cannot mix replication slot streams with other CDCSDK streams"
                )));
            }
            let stream_id = maps.generate_stream_id();
            let stream = CatalogEntity::new(stream_id, entry);
            maps.insert_stream(stream.clone());
            stream
        };

        let mut state = CreationState::AddedToMaps;
        match self
            .finish_namespace_stream(&stream, deadline, &mut state)
            .await
        {
            Ok(snapshot_time) => {
                info!(
                    stream_id = %stream.id(),
                    namespace_id = %namespace_id,
                    tables = tables.len(),
                    "created CDCSDK stream"
                );
                Ok(CreateCdcStreamResponse {
                    stream_id: *stream.id(),
                    cdcsdk_consistent_snapshot_time: snapshot_time,
                })
            }
            Err(e) => {
                warn!(stream_id = %stream.id(), state = ?state, error = %e, "CDCSDK stream creation failed");
                self.compensate_stream_creation(&stream, state).await;
                Err(e)
            }
        }
    }

    fn check_abort_injection(&self, state: CreationState) -> Result<()> {
        if self.config().test_abort_stream_creation_at == Some(state) {
            return Err(MasterError::Aborted(format!(
                "stream creation aborted at {state:?}"
            )));
        }
        Ok(())
    }

    async fn finish_namespace_stream(
        &self,
        stream: &Arc<CdcStreamInfo>,
        deadline: Deadline,
        state: &mut CreationState,
    ) -> Result<Option<HybridTime>> {
        let stream_id = *stream.id();
        self.check_abort_injection(*state)?;

        let l = stream.lock_for_write().await;
        *state = CreationState::PreCommitMutation;
        self.persist(stream_record_writer(stream_id, l.data())?).await?;
        self.check_abort_injection(*state)?;
        l.commit();
        *state = CreationState::PostCommitMutation;
        self.check_abort_injection(*state)?;

        let meta = stream.read();
        let mut tablets: BTreeSet<TabletId> = BTreeSet::new();
        for table_id in &meta.table_ids {
            for tablet in self.tables().get_tablets(table_id)? {
                tablets.insert(tablet.id);
            }
        }
        let mut rows: Vec<CdcStateTableEntry> = tablets
            .iter()
            .map(|t| CdcStateTableEntry::with_checkpoint(t.clone(), stream_id, OpId::INVALID))
            .collect();
        let creation_time = self.tables().current_hybrid_time();
        if meta.has_slot() {
            let mut slot_row = CdcStateTableEntry::new(CdcStateTableKey::slot_entry(stream_id));
            slot_row.confirmed_flush_lsn = Some(1);
            slot_row.restart_lsn = Some(1);
            slot_row.xmin = Some(1);
            slot_row.record_id_commit_time = Some(creation_time.as_raw());
            rows.push(slot_row);
        }
        self.cdc_state().upsert_entries(rows).await?;

        for table_id in &meta.table_ids {
            self.tables()
                .set_wal_retention(table_id, self.config().cdc_wal_retention_secs)
                .await?;
        }

        let snapshot_time = if meta.is_consistent_snapshot() {
            for table_id in &meta.table_ids {
                self.tables()
                    .populate_cdc_safe_op_ids(table_id, stream_id)
                    .await?;
            }
            let safe_op_ids = self
                .wait_for_safe_op_ids(stream_id, &tablets, deadline)
                .await?;
            let snapshot_time = self.tables().current_hybrid_time();
            let mut rows: Vec<CdcStateTableEntry> = safe_op_ids
                .into_iter()
                .map(|(tablet, op_id)| {
                    let mut row = CdcStateTableEntry::with_checkpoint(tablet, stream_id, op_id);
                    row.cdc_sdk_safe_time = Some(snapshot_time.as_raw());
                    row.snapshot_key = Some(String::new());
                    row
                })
                .collect();
            let mut slot_row = CdcStateTableEntry::new(CdcStateTableKey::slot_entry(stream_id));
            slot_row.record_id_commit_time = Some(snapshot_time.as_raw());
            rows.push(slot_row);
            self.cdc_state().upsert_entries(rows).await?;
            Some(snapshot_time)
        } else {
            None
        };

        let mut l = stream.lock_for_write().await;
        let entry = l.mutable();
        if let (Some(info), Some(time)) = (entry.consistent_snapshot.as_mut(), snapshot_time) {
            info.snapshot_time = Some(time);
        }
        entry.set_state(SysCdcStreamState::Active);
        self.persist(stream_record_writer(stream_id, l.data())?).await?;
        l.commit();
        *state = CreationState::Ready;
        Ok(snapshot_time)
    }

    async fn wait_for_safe_op_ids(
        &self,
        stream_id: StreamId,
        tablets: &BTreeSet<TabletId>,
        deadline: Deadline,
    ) -> Result<BTreeMap<TabletId, OpId>> {
        let mut reported = BTreeMap::new();
        loop {
            for tablet in tablets {
                if reported.contains_key(tablet) {
                    continue;
                }
                if let Some(op_id) = self
                    .tables()
                    .get_tablet_safe_op_id(tablet, stream_id)
                    .await?
                {
                    reported.insert(tablet.clone(), op_id);
                }
            }
            if reported.len() == tablets.len() {
                return Ok(reported);
            }
            if deadline.expired() {
                return Err(MasterError::TimedOut(format!(
                    "{} of {} tablets reported a safe op id for stream {stream_id}",
                    reported.len(),
                    tablets.len()
                )));
            }
            let wait = self.config().safe_op_id_poll_interval().min(deadline.remaining());
            tokio::time::sleep(wait).await;
        }
    }

    /// Undoes a partially created namespace stream. Failures are logged only.
    pub(crate) async fn compensate_stream_creation(
        &self,
        stream: &Arc<CdcStreamInfo>,
        state: CreationState,
    ) {
        let stream_id = *stream.id();
        match state {
            CreationState::Initialized | CreationState::Ready => {}
            CreationState::AddedToMaps | CreationState::PreCommitMutation => {
                let mut record_gone = true;
                if state == CreationState::PreCommitMutation {
                    let mut writer = SysCatalogWriter::new();
                    writer.delete::<SysCdcStreamEntry>(&stream_id.to_string());
                    if let Err(e) = self.persist(writer).await {
                        warn!(stream_id = %stream_id, error = %e, "failed to delete record of aborted stream");
                        record_gone = false;
                    }
                }
                let mut maps = self.maps.write();
                maps.remove_stream(&stream_id);
                if record_gone {
                    maps.recover_stream_id(stream_id);
                }
            }
            CreationState::PostCommitMutation => {
                let mut l = stream.lock_for_write().await;
                l.mutable().set_state(SysCdcStreamState::Deleting);
                let persisted = match stream_record_writer(stream_id, l.data()) {
                    Ok(writer) => self.persist(writer).await,
                    Err(e) => Err(e),
                };
                match persisted {
                    Ok(()) => {
                        l.commit();
                        self.maps.write().reindex_stream(&stream_id);
                    }
                    Err(e) => {
                        warn!(stream_id = %stream_id, error = %e, "failed to mark aborted stream for deletion");
                    }
                }
            }
        }
        debug!(stream_id = %stream_id, state = ?state, "compensated stream creation");
    }

    async fn create_xcluster_stream(
        &self,
        req: &CreateCdcStreamRequest,
        table_id: &TableId,
    ) -> Result<StreamId> {
        let table = self
            .tables()
            .get_table(table_id)
            .filter(|t| t.is_running())
            .ok_or_else(|| MasterError::NotFound(format!("table {table_id}")))?;

        let state = match req.options.get(options::STATE) {
            Some(s) => SysCdcStreamState::parse(s).ok_or_else(|| {
                MasterError::InvalidArgument(format!("invalid stream state {s}"))
            })?,
            None => req.initial_state.unwrap_or(SysCdcStreamState::Active),
        };
        if !matches!(state, SysCdcStreamState::Initiated | SysCdcStreamState::Active) {
            return Err(MasterError::InvalidArgument(format!(
                "xCluster streams cannot be created in state {}",
                state.as_str()
            )));
        }

        let mut entry = SysCdcStreamEntry::new(state);
        entry.table_ids = vec![table.id.clone()];
        entry.options = req.options.clone();
        entry.backfill_default_options();
        entry.set_state(state);
        entry.stream_creation_time = now_micros();
        entry.transactional = req.transactional;

        let stream_id = self.maps.write().generate_stream_id();
        let prepared = async {
            self.tables()
                .set_wal_retention(table_id, self.config().cdc_wal_retention_secs)
                .await?;
            self.persist(stream_record_writer(stream_id, &entry)?).await
        };
        if let Err(e) = prepared.await {
            self.maps.write().recover_stream_id(stream_id);
            return Err(e);
        }
        self.maps
            .write()
            .insert_stream(CatalogEntity::new(stream_id, entry));

        if req.populate_state_rows {
            let rows = self
                .tables()
                .get_tablets(table_id)?
                .into_iter()
                .map(|t| CdcStateTableEntry::with_checkpoint(t.id, stream_id, OpId::INVALID))
                .collect();
            self.cdc_state().upsert_entries(rows).await?;
        }
        info!(stream_id = %stream_id, table_id = %table_id, state = state.as_str(), "created xCluster stream");
        Ok(stream_id)
    }

    /// Marks streams for deletion. Rows and records are removed by the
    /// background sweep.
    pub async fn delete_cdc_stream(&self, req: &DeleteCdcStreamRequest) -> Result<DeleteCdcStreamResponse> {
        self.leader_term()?;
        let mut found: BTreeMap<StreamId, Arc<CdcStreamInfo>> = BTreeMap::new();
        let mut resp = DeleteCdcStreamResponse::default();
        {
            let maps = self.maps.read();
            let deletable = |s: &Arc<CdcStreamInfo>| {
                !matches!(
                    s.read().state,
                    SysCdcStreamState::Deleting | SysCdcStreamState::Deleted
                )
            };
            for id in &req.stream_ids {
                match maps.cdc_stream_map.get(id).filter(|s| deletable(s)) {
                    Some(s) => {
                        found.insert(*id, s.clone());
                    }
                    None => resp.not_found_stream_ids.push(*id),
                }
            }
            for name in &req.cdcsdk_ysql_replication_slot_names {
                match maps.find_stream_by_slot(name).filter(|s| deletable(s)) {
                    Some(s) => {
                        found.insert(*s.id(), s);
                    }
                    None => resp
                        .not_found_cdcsdk_ysql_replication_slot_names
                        .push(name.clone()),
                }
            }
        }
        let missing = !resp.not_found_stream_ids.is_empty()
            || !resp.not_found_cdcsdk_ysql_replication_slot_names.is_empty();
        if missing && !req.ignore_errors {
            return Err(MasterError::NotFound(format!(
                "CDC streams {:?} and replication slots {:?}",
                resp.not_found_stream_ids
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
                resp.not_found_cdcsdk_ysql_replication_slot_names
            )));
        }

        if !req.force_delete {
            for (id, stream) in &found {
                let meta = stream.read();
                if meta.is_xcluster()
                    && meta.state == SysCdcStreamState::Active
                    && meta.record_format() == Some(CdcRecordFormat::Wal)
                    && self.is_stream_used_by_replication_group(id)
                {
                    return Err(MasterError::InvalidArgument(format!(
                        "stream {id} is used by an xCluster replication group; use force_delete to delete it"
                    )));
                }
            }
        }
        if found.is_empty() {
            return Ok(resp);
        }

        let mut handles = Vec::with_capacity(found.len());
        let mut writer = SysCatalogWriter::new();
        for (id, stream) in &found {
            let mut l = stream.lock_for_write().await;
            l.mutable().set_state(SysCdcStreamState::Deleting);
            writer.upsert(&id.to_string(), l.data())?;
            handles.push(l);
        }
        self.persist(writer).await?;
        for l in handles {
            l.commit();
        }
        let mut maps = self.maps.write();
        for id in found.keys() {
            maps.reindex_stream(id);
        }
        info!(streams = found.len(), "marked CDC streams for deletion");
        Ok(resp)
    }

    /// Reads one live stream by id or slot name.
    pub fn get_cdc_stream(&self, req: &GetCdcStreamRequest) -> Result<CdcStreamDescriptor> {
        let stream = match (&req.stream_id, &req.cdcsdk_ysql_replication_slot_name) {
            (Some(id), _) => self.live_stream(id)?,
            (None, Some(name)) => self
                .maps
                .read()
                .find_stream_by_slot(name)
                .filter(|s| !s.read().is_deleting())
                .ok_or_else(|| MasterError::NotFound(format!("replication slot {name}")))?,
            (None, None) => {
                return Err(MasterError::InvalidArgument(
                    "stream id or replication slot name is required".into(),
                ))
            }
        };
        Ok(CdcStreamDescriptor::from_entry(*stream.id(), &stream.read()))
    }

    /// Lists live streams, ordered by id.
    pub fn list_cdc_streams(&self, req: &ListCdcStreamsRequest) -> Vec<CdcStreamDescriptor> {
        let maps = self.maps.read();
        maps.cdc_stream_map
            .iter()
            .filter_map(|(id, stream)| {
                let meta = stream.read();
                if meta.is_deleting() {
                    return None;
                }
                if let Some(table_id) = &req.table_id {
                    if !meta.covers(table_id) {
                        return None;
                    }
                }
                if let Some(ns) = &req.namespace_id {
                    if meta.namespace_id.as_ref() != Some(ns) {
                        return None;
                    }
                }
                match req.id_type {
                    Some(IdType::NamespaceId) if !meta.is_cdcsdk() => return None,
                    Some(IdType::TableId) if !meta.is_xcluster() => return None,
                    _ => {}
                }
                Some(CdcStreamDescriptor::from_entry(*id, &meta))
            })
            .collect()
    }

    /// Overwrites options and state of several streams in one write.
    pub async fn update_cdc_stream(&self, req: &UpdateCdcStreamRequest) -> Result<()> {
        self.leader_term()?;
        let mut updates = BTreeMap::new();
        for update in &req.entries {
            let id = update.stream_id.ok_or_else(|| {
                MasterError::InvalidArgument("stream id is required for every update".into())
            })?;
            let stream = self
                .stream(&id)
                .ok_or_else(|| MasterError::NotFound(format!("CDC stream {id}")))?;
            if updates.insert(id, (stream, update)).is_some() {
                return Err(MasterError::InvalidArgument(format!(
                    "stream {id} is updated twice"
                )));
            }
        }

        let mut handles = Vec::with_capacity(updates.len());
        let mut writer = SysCatalogWriter::new();
        for (id, (stream, update)) in &updates {
            let mut l = stream.lock_for_write().await;
            let state = match update.state {
                Some(state) => Some(state),
                None => update
                    .options
                    .get(options::STATE)
                    .and_then(|s| SysCdcStreamState::parse(s)),
            };
            let entry = l.mutable();
            if !update.options.is_empty() {
                entry.options = update.options.clone();
            }
            if let Some(state) = state {
                entry.set_state(state);
            }
            writer.upsert(&id.to_string(), l.data())?;
            handles.push(l);
        }
        self.persist(writer).await?;
        for l in handles {
            l.commit();
        }
        let mut maps = self.maps.write();
        for id in updates.keys() {
            maps.reindex_stream(id);
        }
        Ok(())
    }

    async fn live_cdcsdk_stream(&self, stream_id: &StreamId) -> Result<Arc<CdcStreamInfo>> {
        self.leader_term()?;
        let stream = self.live_stream(stream_id)?;
        if !stream.read().is_cdcsdk() {
            return Err(MasterError::InvalidArgument(format!(
                "stream {stream_id} is not a CDCSDK stream"
            )));
        }
        Ok(stream)
    }

    /// Stages a table for removal; the background pass completes it.
    pub async fn remove_user_table_from_cdcsdk_stream(
        &self,
        stream_id: &StreamId,
        table_id: &TableId,
    ) -> Result<()> {
        let stream = self.live_cdcsdk_stream(stream_id).await?;
        let mut l = stream.lock_for_write().await;
        if !l.data().covers(table_id) {
            return Err(MasterError::NotFound(format!(
                "table {table_id} in stream {stream_id}"
            )));
        }
        if l.data().unqualified_table_ids.contains(table_id) {
            return Ok(());
        }
        l.mutable().unqualified_table_ids.push(table_id.clone());
        self.persist(stream_record_writer(*stream_id, l.data())?).await?;
        l.commit();
        info!(stream_id = %stream_id, table_id = %table_id, "staged table removal from CDCSDK stream");
        Ok(())
    }

    /// Stops new tables from joining a CDCSDK stream.
    pub async fn disable_dynamic_table_addition_on_cdcsdk_stream(
        &self,
        stream_id: &StreamId,
    ) -> Result<()> {
        let stream = self.live_cdcsdk_stream(stream_id).await?;
        let mut l = stream.lock_for_write().await;
        if l.data().cdcsdk_disable_dynamic_table_addition {
            return Ok(());
        }
        l.mutable().cdcsdk_disable_dynamic_table_addition = true;
        self.persist(stream_record_writer(*stream_id, l.data())?).await?;
        l.commit();
        info!(stream_id = %stream_id, "disabled dynamic table addition");
        Ok(())
    }

    /// Gives a legacy CDCSDK stream a replication slot name.
    pub async fn ysql_backfill_replication_slot_name(
        &self,
        stream_id: &StreamId,
        slot_name: &str,
    ) -> Result<()> {
        validate_slot_name(slot_name)?;
        let stream = self.live_cdcsdk_stream(stream_id).await?;
        if stream.read().has_slot() {
            return Err(MasterError::InvalidArgument(format!(
                "stream {stream_id} already has a replication slot"
            )));
        }
        {
            let maps = self.maps.read();
            if maps.replication_slot_to_stream.contains_key(slot_name) {
                return Err(MasterError::AlreadyPresent(format!(
                    "replication slot {slot_name}"
                )));
            }
            if maps.slot_count() >= self.config().max_replication_slots {
                return Err(MasterError::IllegalState(format!(
                    "all {} replication slots are in use",
                    self.config().max_replication_slots
                )));
            }
        }
        let mut l = stream.lock_for_write().await;
        l.mutable().cdcsdk_ysql_replication_slot_name = Some(slot_name.to_string());
        self.persist(stream_record_writer(*stream_id, l.data())?).await?;
        l.commit();
        self.maps.write().reindex_stream(stream_id);
        info!(stream_id = %stream_id, slot_name, "backfilled replication slot name");
        Ok(())
    }

    /// Returns true if any tablet of the tables needs a bootstrap. With a
    /// stream id, a tablet without a valid checkpoint row needs one.
    pub async fn is_bootstrap_required(
        &self,
        table_ids: &[TableId],
        stream_id: Option<StreamId>,
        deadline: Deadline,
    ) -> Result<bool> {
        if let Some(id) = &stream_id {
            self.live_stream(id)?;
        }
        let mut per_table = Vec::with_capacity(table_ids.len());
        for table_id in table_ids {
            let tablets: Vec<TabletId> = self
                .tables()
                .get_tablets(table_id)?
                .into_iter()
                .map(|t| t.id)
                .collect();
            per_table.push(tablets);
        }

        let cdc_state = self.cdc_state().clone();
        let tables = self.tables().clone();
        let summary = fan_out_until(
            per_table,
            deadline,
            move |tablets| {
                let cdc_state = cdc_state.clone();
                let tables = tables.clone();
                async move {
                    for tablet in tablets {
                        let required = match stream_id {
                            Some(stream_id) => cdc_state
                                .try_fetch_entry(
                                    &CdcStateTableKey::new(tablet, stream_id),
                                    CdcStateTableEntrySelector::default().include_checkpoint(),
                                )
                                .await?
                                .and_then(|row| row.checkpoint)
                                .map_or(true, |op| !op.is_valid()),
                            None => tables.tablet_requires_bootstrap(&tablet).await?,
                        };
                        if required {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            },
            |required| *required,
        )
        .await?;
        Ok(summary.results.iter().any(|r| *r))
    }

    /// Polls until every tablet row of the streams replicated past
    /// `target_time` (now when unset). Pairs still behind at the deadline are
    /// returned rather than treated as an error.
    pub async fn wait_for_replication_drain(
        &self,
        stream_ids: &[StreamId],
        target_time: Option<u64>,
        deadline: Deadline,
    ) -> Result<WaitForReplicationDrainResponse> {
        for id in stream_ids {
            self.live_stream(id)?;
        }
        let target = target_time.unwrap_or_else(now_micros);
        let selector = CdcStateTableEntrySelector::default()
            .include_checkpoint()
            .include_last_replication_time();
        loop {
            let mut undrained = Vec::new();
            for id in stream_ids {
                for row in entries_for_stream(self.cdc_state().as_ref(), *id, selector.clone()).await? {
                    if row.key.is_slot_entry() || row.checkpoint.is_some_and(|op| op.is_max()) {
                        continue;
                    }
                    if row.last_replication_time.map_or(true, |t| t < target) {
                        undrained.push((*id, row.key.tablet_id));
                    }
                }
            }
            if undrained.is_empty() || deadline.expired() {
                if !undrained.is_empty() {
                    debug!(undrained = undrained.len(), "replication drain deadline expired");
                }
                return Ok(WaitForReplicationDrainResponse { undrained });
            }
            let wait = self.config().safe_op_id_poll_interval().min(deadline.remaining());
            tokio::time::sleep(wait).await;
        }
    }

    /// Ids of live streams covering a table.
    pub fn get_all_streams_for_table(&self, table_id: &TableId) -> Vec<StreamId> {
        self.maps
            .read()
            .streams_for_table(table_id)
            .iter()
            .map(|s| *s.id())
            .collect()
    }

    /// Ids of live CDCSDK streams of a namespace.
    pub fn get_cdc_streams_for_namespace(&self, namespace_id: &NamespaceId) -> Vec<StreamId> {
        self.maps
            .read()
            .cdcsdk_streams_for_namespace(namespace_id)
            .iter()
            .map(|s| *s.id())
            .collect()
    }

    /// Whether a replication group's registry entry or table map points at
    /// the stream.
    pub fn is_stream_used_by_replication_group(&self, stream_id: &StreamId) -> bool {
        let (config, universes) = {
            let maps = self.maps.read();
            let universes: Vec<_> = maps.universe_replication_map.values().cloned().collect();
            (maps.cluster_config.clone(), universes)
        };
        if config.is_some_and(|c| {
            c.read()
                .consumer_registry
                .producer_map
                .values()
                .any(|p| p.stream_map.contains_key(stream_id))
        }) {
            return true;
        }
        universes
            .iter()
            .any(|u| u.read().table_streams.values().any(|s| s == stream_id))
    }

    /// Whether a table is streamed or is the target of an xCluster group.
    pub fn is_table_part_of_xrepl(&self, table_id: &TableId) -> bool {
        let maps = self.maps.read();
        !maps.streams_for_table(table_id).is_empty()
            || maps.xcluster_consumer_tables.contains_key(table_id)
    }
}
