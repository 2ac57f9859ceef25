//! RPC entry points of the xrepl master.
//!
//! `ReplicationService` is what the master's RPC layer dispatches to. It
//! rejects requests that are missing required fields, turns client timeouts
//! into deadlines, requires leadership, and forwards to the
//! [`XreplCatalogManager`].

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{MasterError, Result};
use crate::manager::XreplCatalogManager;
use crate::rpc::*;
use crate::types::Deadline;

/// Handles the CDC stream and xCluster replication RPCs.
pub struct ReplicationService {
    manager: Arc<XreplCatalogManager>,
}

fn required<'a, T>(field: &'a Option<T>, name: &str) -> Result<&'a T> {
    field
        .as_ref()
        .ok_or_else(|| MasterError::InvalidArgument(format!("{name} is required")))
}

impl ReplicationService {
    /// Wraps a manager.
    pub fn new(manager: Arc<XreplCatalogManager>) -> Self {
        Self { manager }
    }

    /// The wrapped manager.
    pub fn manager(&self) -> &Arc<XreplCatalogManager> {
        &self.manager
    }

    fn deadline(&self, timeout_ms: Option<u64>) -> Deadline {
        Deadline::after(
            timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.manager.config().default_rpc_timeout()),
        )
    }

    fn check_leader(&self, rpc: &str) -> Result<()> {
        debug!(rpc, "handling xrepl rpc");
        self.manager.leader_term().map(|_| ())
    }

    /// CreateCDCStream.
    pub async fn create_cdc_stream(&self, req: &CreateCdcStreamRequest) -> Result<CreateCdcStreamResponse> {
        self.check_leader("CreateCDCStream")?;
        if req.table_id.is_none() && req.namespace_id.is_none() {
            return Err(MasterError::InvalidArgument(
                "table id or namespace id is required".into(),
            ));
        }
        self.manager
            .create_cdc_stream(req, self.deadline(req.timeout_ms))
            .await
    }

    /// DeleteCDCStream.
    pub async fn delete_cdc_stream(&self, req: &DeleteCdcStreamRequest) -> Result<DeleteCdcStreamResponse> {
        self.check_leader("DeleteCDCStream")?;
        if req.stream_ids.is_empty() && req.cdcsdk_ysql_replication_slot_names.is_empty() {
            return Err(MasterError::InvalidArgument(
                "stream ids or replication slot names are required".into(),
            ));
        }
        self.manager.delete_cdc_stream(req).await
    }

    /// GetCDCStream.
    pub fn get_cdc_stream(&self, req: &GetCdcStreamRequest) -> Result<CdcStreamDescriptor> {
        self.check_leader("GetCDCStream")?;
        if req.stream_id.is_none() && req.cdcsdk_ysql_replication_slot_name.is_none() {
            return Err(MasterError::InvalidArgument(
                "stream id or replication slot name is required".into(),
            ));
        }
        self.manager.get_cdc_stream(req)
    }

    /// ListCDCStreams.
    pub fn list_cdc_streams(&self, req: &ListCdcStreamsRequest) -> Result<Vec<CdcStreamDescriptor>> {
        self.check_leader("ListCDCStreams")?;
        Ok(self.manager.list_cdc_streams(req))
    }

    /// UpdateCDCStream.
    pub async fn update_cdc_stream(&self, req: &UpdateCdcStreamRequest) -> Result<()> {
        self.check_leader("UpdateCDCStream")?;
        if req.entries.is_empty() {
            return Err(MasterError::InvalidArgument("stream updates are required".into()));
        }
        for entry in &req.entries {
            required(&entry.stream_id, "stream id")?;
        }
        self.manager.update_cdc_stream(req).await
    }

    /// IsBootstrapRequired.
    pub async fn is_bootstrap_required(
        &self,
        req: &IsBootstrapRequiredRequest,
    ) -> Result<IsBootstrapRequiredResponse> {
        self.check_leader("IsBootstrapRequired")?;
        if req.table_ids.is_empty() {
            return Err(MasterError::InvalidArgument("table ids are required".into()));
        }
        let bootstrap_required = self
            .manager
            .is_bootstrap_required(&req.table_ids, req.stream_id, self.deadline(req.timeout_ms))
            .await?;
        Ok(IsBootstrapRequiredResponse { bootstrap_required })
    }

    /// SetupUniverseReplication.
    pub async fn setup_universe_replication(&self, req: &SetupUniverseReplicationRequest) -> Result<()> {
        self.check_leader("SetupUniverseReplication")?;
        self.manager.setup_universe_replication(req).await
    }

    /// AlterUniverseReplication.
    pub async fn alter_universe_replication(&self, req: &AlterUniverseReplicationRequest) -> Result<()> {
        self.check_leader("AlterUniverseReplication")?;
        self.manager.alter_universe_replication(req).await
    }

    /// DeleteUniverseReplication.
    pub async fn delete_universe_replication(&self, req: &DeleteUniverseReplicationRequest) -> Result<()> {
        self.check_leader("DeleteUniverseReplication")?;
        self.manager.delete_universe_replication(req).await
    }

    /// GetUniverseReplication.
    pub fn get_universe_replication(
        &self,
        req: &GetUniverseReplicationRequest,
    ) -> Result<GetUniverseReplicationResponse> {
        self.check_leader("GetUniverseReplication")?;
        let group = required(&req.replication_group_id, "replication group id")?;
        self.manager.get_universe_replication(group)
    }

    /// IsSetupUniverseReplicationDone.
    pub fn is_setup_universe_replication_done(
        &self,
        req: &IsSetupUniverseReplicationDoneRequest,
    ) -> Result<IsOperationDoneResponse> {
        self.check_leader("IsSetupUniverseReplicationDone")?;
        let group = required(&req.replication_group_id, "replication group id")?;
        self.manager.is_setup_universe_replication_done(group)
    }

    /// SetupNamespaceReplicationWithBootstrap.
    pub async fn setup_namespace_replication_with_bootstrap(
        &self,
        req: &SetupNamespaceReplicationWithBootstrapRequest,
    ) -> Result<()> {
        self.check_leader("SetupNamespaceReplicationWithBootstrap")?;
        self.manager
            .setup_namespace_replication_with_bootstrap(req)
            .await
    }

    /// IsSetupNamespaceReplicationWithBootstrapDone.
    pub fn is_setup_namespace_replication_with_bootstrap_done(
        &self,
        req: &IsSetupNamespaceReplicationWithBootstrapDoneRequest,
    ) -> Result<IsSetupNamespaceReplicationWithBootstrapDoneResponse> {
        self.check_leader("IsSetupNamespaceReplicationWithBootstrapDone")?;
        let group = required(&req.replication_group_id, "replication group id")?;
        self.manager
            .is_setup_namespace_replication_with_bootstrap_done(group)
    }

    /// WaitForReplicationDrain.
    pub async fn wait_for_replication_drain(
        &self,
        req: &WaitForReplicationDrainRequest,
    ) -> Result<WaitForReplicationDrainResponse> {
        self.check_leader("WaitForReplicationDrain")?;
        if req.stream_ids.is_empty() {
            return Err(MasterError::InvalidArgument("stream ids are required".into()));
        }
        self.manager
            .wait_for_replication_drain(&req.stream_ids, req.target_time, self.deadline(req.timeout_ms))
            .await
    }

    /// UpdateConsumerOnProducerSplit.
    pub async fn update_consumer_on_producer_split(
        &self,
        req: &UpdateConsumerOnProducerSplitRequest,
    ) -> Result<()> {
        self.check_leader("UpdateConsumerOnProducerSplit")?;
        self.manager.update_consumer_on_producer_split(req).await
    }

    /// UpdateConsumerOnProducerMetadata.
    pub async fn update_consumer_on_producer_metadata(
        &self,
        req: &UpdateConsumerOnProducerMetadataRequest,
    ) -> Result<UpdateConsumerOnProducerMetadataResponse> {
        self.check_leader("UpdateConsumerOnProducerMetadata")?;
        self.manager.update_consumer_on_producer_metadata(req).await
    }

    /// GetReplicationStatus.
    pub fn get_replication_status(
        &self,
        req: &GetReplicationStatusRequest,
    ) -> Result<GetReplicationStatusResponse> {
        self.check_leader("GetReplicationStatus")?;
        self.manager
            .get_replication_status(req.replication_group_id.as_ref())
    }

    /// RemoveUserTableFromCDCSDKStream.
    pub async fn remove_user_table_from_cdcsdk_stream(
        &self,
        req: &RemoveUserTableFromCdcsdkStreamRequest,
    ) -> Result<()> {
        self.check_leader("RemoveUserTableFromCDCSDKStream")?;
        let stream_id = required(&req.stream_id, "stream id")?;
        let table_id = required(&req.table_id, "table id")?;
        self.manager
            .remove_user_table_from_cdcsdk_stream(stream_id, table_id)
            .await
    }

    /// DisableDynamicTableAdditionOnCDCSDKStream.
    pub async fn disable_dynamic_table_addition_on_cdcsdk_stream(
        &self,
        req: &DisableDynamicTableAdditionRequest,
    ) -> Result<()> {
        self.check_leader("DisableDynamicTableAdditionOnCDCSDKStream")?;
        let stream_id = required(&req.stream_id, "stream id")?;
        self.manager
            .disable_dynamic_table_addition_on_cdcsdk_stream(stream_id)
            .await
    }

    /// YsqlBackfillReplicationSlotNameToCDCSDKStream.
    pub async fn ysql_backfill_replication_slot_name(
        &self,
        req: &YsqlBackfillReplicationSlotNameRequest,
    ) -> Result<()> {
        self.check_leader("YsqlBackfillReplicationSlotNameToCDCSDKStream")?;
        let stream_id = required(&req.stream_id, "stream id")?;
        let slot_name = required(&req.cdcsdk_ysql_replication_slot_name, "replication slot name")?;
        self.manager
            .ysql_backfill_replication_slot_name(stream_id, slot_name)
            .await
    }
}
