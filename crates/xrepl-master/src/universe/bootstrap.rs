//! Namespace replication with a full bootstrap of the consumer.
//!
//! The pipeline streams nothing until the consumer holds a restored copy of
//! the producer namespace: it creates bootstrap streams on the producer,
//! snapshots the producer namespace, imports the snapshot's objects here,
//! snapshots them, transfers the producer files, restores, and finally sets
//! up a replication group over the bootstrap streams. Every stage transition
//! is persisted so a new leader can tell which pipelines it inherited.
//!
//! A failed pipeline stays in `Failed` until the background task unwinds it,
//! newest to oldest: consumer snapshot, imported objects, producer snapshot,
//! producer streams. Each undone piece is cleared from the record, so an
//! interrupted unwind resumes where it stopped.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog::RestorationState;
use crate::error::{MasterError, Result};
use crate::manager::XreplCatalogManager;
use crate::metadata::{
    CatalogEntity, ImportedObjects, SysUniverseBootstrapState, SysUniverseReplicationBootstrapEntry,
    UniverseReplicationBootstrapInfo,
};
use crate::rpc::{
    IsSetupNamespaceReplicationWithBootstrapDoneResponse,
    SetupNamespaceReplicationWithBootstrapRequest, SetupUniverseReplicationRequest,
};
use crate::sys_catalog::SysCatalogWriter;
use crate::types::{Deadline, ReplicationGroupId, TableId};

use super::{is_alter_replication_group_id, required_group_id};

impl XreplCatalogManager {
    /// Starts a bootstrap pipeline. Returns once the pipeline is persisted;
    /// progress is polled with
    /// [`is_setup_namespace_replication_with_bootstrap_done`](Self::is_setup_namespace_replication_with_bootstrap_done).
    pub async fn setup_namespace_replication_with_bootstrap(
        self: &Arc<Self>,
        req: &SetupNamespaceReplicationWithBootstrapRequest,
    ) -> Result<()> {
        let term = self.leader_term()?;
        let group = required_group_id(&req.replication_group_id)?.clone();
        if is_alter_replication_group_id(&group) {
            return Err(MasterError::InvalidArgument(format!(
                "replication group id {group} uses a reserved suffix"
            )));
        }
        let namespace_name = req
            .producer_namespace_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| MasterError::InvalidArgument("producer namespace name is required".into()))?;
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
        if self.universe(&group).is_some() {
            return Err(MasterError::AlreadyPresent(format!("replication group {group}")));
        }
        let timeout = req
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config().default_rpc_timeout());

        let mut entry = SysUniverseReplicationBootstrapEntry::new(
            req.producer_master_addresses.clone(),
            namespace_name.to_string(),
            term.as_u64(),
        );
        entry.transactional = req.transactional;
        let bootstrap = CatalogEntity::new(group.clone(), entry);
        {
            let mut maps = self.maps.write();
            if maps.universe_bootstrap_map.contains_key(&group) {
                return Err(MasterError::AlreadyPresent(format!(
                    "bootstrap of replication group {group}"
                )));
            }
            maps.universe_bootstrap_map
                .insert(group.clone(), bootstrap.clone());
        }
        let mut writer = SysCatalogWriter::new();
        writer.upsert(group.as_str(), &*bootstrap.read())?;
        if let Err(e) = self.persist(writer).await {
            self.maps.write().universe_bootstrap_map.remove(&group);
            return Err(e);
        }
        info!(replication_group_id = %group, namespace = namespace_name, "starting replication bootstrap");

        let manager = self.clone();
        tokio::spawn(async move { manager.run_bootstrap(bootstrap, timeout).await });
        Ok(())
    }

    async fn run_bootstrap(self: Arc<Self>, bootstrap: Arc<UniverseReplicationBootstrapInfo>, timeout: Duration) {
        if let Err(e) = self.drive_bootstrap(&bootstrap, timeout).await {
            if let Err(mark) = self.mark_bootstrap_failed(&bootstrap, &e).await {
                warn!(replication_group_id = %bootstrap.id(), error = %mark, "failed to record bootstrap failure");
            }
        }
    }

    async fn drive_bootstrap(
        self: &Arc<Self>,
        bootstrap: &Arc<UniverseReplicationBootstrapInfo>,
        timeout: Duration,
    ) -> Result<()> {
        use SysUniverseBootstrapState as Stage;
        let group = bootstrap.id().clone();
        let meta = bootstrap.read();
        let addresses = meta.producer_master_addresses.clone();
        let client = self.producers().connect(&group, &addresses)?;

        self.enter_bootstrap_stage(bootstrap, Stage::BootstrapProducer)
            .await?;
        let namespace = client
            .get_namespace_by_name(&meta.producer_namespace_name)
            .await?;
        let tables: Vec<TableId> = client
            .list_namespace_tables(&namespace.id)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        if tables.is_empty() {
            return Err(MasterError::InvalidArgument(format!(
                "producer namespace {} has no tables to replicate",
                namespace.name
            )));
        }
        let stream_ids = client.bootstrap_producer(&tables).await?;
        self.update_bootstrap(bootstrap, |e| {
            e.table_bootstrap_ids = tables.iter().cloned().zip(stream_ids).collect();
        })
        .await?;

        self.enter_bootstrap_stage(bootstrap, Stage::CreateProducerSnapshot)
            .await?;
        let producer_snapshot = client.create_snapshot(&namespace.id).await?;
        self.update_bootstrap(bootstrap, |e| {
            e.producer_snapshot_id = Some(producer_snapshot.clone());
        })
        .await?;

        self.enter_bootstrap_stage(bootstrap, Stage::ImportSnapshot)
            .await?;
        let snapshot_meta = client.get_snapshot_meta(&producer_snapshot).await?;
        let imported = self.snapshots().import_snapshot(&snapshot_meta).await?;
        let consumer_tables: Vec<TableId> = imported.table_map.values().cloned().collect();
        self.update_bootstrap(bootstrap, |e| e.imported = imported).await?;

        self.enter_bootstrap_stage(bootstrap, Stage::CreateConsumerSnapshot)
            .await?;
        let consumer_snapshot = self.snapshots().create_snapshot(&consumer_tables).await?;
        self.update_bootstrap(bootstrap, |e| {
            e.consumer_snapshot_id = Some(consumer_snapshot.clone());
        })
        .await?;

        self.enter_bootstrap_stage(bootstrap, Stage::TransferSnapshot)
            .await?;
        self.snapshots()
            .transfer_snapshot(&producer_snapshot, &consumer_snapshot, &addresses)
            .await?;

        self.enter_bootstrap_stage(bootstrap, Stage::RestoreSnapshot)
            .await?;
        let restoration = self.snapshots().restore_snapshot(&consumer_snapshot).await?;
        self.update_bootstrap(bootstrap, |e| {
            e.restoration_id = Some(restoration.clone());
        })
        .await?;
        let deadline = Deadline::after(timeout);
        loop {
            match self.snapshots().restoration_state(&restoration).await? {
                RestorationState::Restored => break,
                RestorationState::Failed => {
                    return Err(MasterError::IllegalState(format!(
                        "restoration {restoration} failed"
                    )))
                }
                RestorationState::Restoring => {}
            }
            if deadline.expired() {
                return Err(MasterError::TimedOut(format!(
                    "restoration {restoration} did not finish"
                )));
            }
            debug!(replication_group_id = %group, restoration_id = %restoration, "waiting for restoration");
            tokio::time::sleep(self.config().restore_poll_interval()).await;
        }

        self.enter_bootstrap_stage(bootstrap, Stage::SetupReplication)
            .await?;
        let meta = bootstrap.read();
        let (producer_table_ids, producer_bootstrap_ids): (Vec<TableId>, Vec<_>) = meta
            .table_bootstrap_ids
            .iter()
            .map(|(table, stream)| (table.clone(), *stream))
            .unzip();
        self.setup_universe_replication(&SetupUniverseReplicationRequest {
            replication_group_id: Some(group.clone()),
            producer_master_addresses: addresses,
            producer_table_ids,
            producer_bootstrap_ids,
            producer_namespaces: Vec::new(),
            transactional: meta.transactional,
        })
        .await?;
        let deadline = Deadline::after(timeout);
        loop {
            let done = self.is_setup_universe_replication_done(&group)?;
            if done.done {
                if let Some(error) = done.error {
                    return Err(MasterError::IllegalState(error));
                }
                break;
            }
            if deadline.expired() {
                return Err(MasterError::TimedOut(format!(
                    "setup of replication group {group} did not finish"
                )));
            }
            tokio::time::sleep(self.config().restore_poll_interval()).await;
        }

        self.update_bootstrap(bootstrap, |e| e.state = Stage::Done)
            .await?;
        info!(replication_group_id = %group, tables = meta.table_bootstrap_ids.len(), "replication bootstrap done");
        Ok(())
    }

    async fn update_bootstrap(
        &self,
        bootstrap: &UniverseReplicationBootstrapInfo,
        f: impl FnOnce(&mut SysUniverseReplicationBootstrapEntry),
    ) -> Result<()> {
        let mut l = bootstrap.lock_for_write().await;
        f(l.mutable());
        let mut writer = SysCatalogWriter::new();
        writer.upsert(bootstrap.id().as_str(), l.data())?;
        self.persist(writer).await?;
        l.commit();
        Ok(())
    }

    async fn enter_bootstrap_stage(
        &self,
        bootstrap: &UniverseReplicationBootstrapInfo,
        stage: SysUniverseBootstrapState,
    ) -> Result<()> {
        self.update_bootstrap(bootstrap, |e| e.state = stage).await?;
        info!(replication_group_id = %bootstrap.id(), stage = ?stage, "replication bootstrap stage");
        let injected = self
            .config()
            .test_fail_bootstrap_at
            .as_deref()
            .and_then(SysUniverseBootstrapState::parse);
        if injected == Some(stage) {
            return Err(MasterError::IllegalState(format!(
                "injected bootstrap failure at {stage:?}"
            )));
        }
        Ok(())
    }

    async fn mark_bootstrap_failed(
        &self,
        bootstrap: &UniverseReplicationBootstrapInfo,
        error: &MasterError,
    ) -> Result<()> {
        warn!(replication_group_id = %bootstrap.id(), error = %error, "replication bootstrap failed");
        self.update_bootstrap(bootstrap, |e| {
            if !e.state.is_failed_or_deleted() {
                e.failed_on = Some(e.state);
            }
            e.state = SysUniverseBootstrapState::Failed;
            e.error = Some(error.to_string());
        })
        .await
    }

    /// Undoes whatever the pipeline created, newest first.
    async fn undo_bootstrap(&self, bootstrap: &UniverseReplicationBootstrapInfo) -> Result<()> {
        let group = bootstrap.id();
        let meta = bootstrap.read();

        if let Some(snapshot) = &meta.consumer_snapshot_id {
            self.snapshots().delete_snapshot(snapshot).await?;
            self.update_bootstrap(bootstrap, |e| e.consumer_snapshot_id = None)
                .await?;
            debug!(replication_group_id = %group, snapshot_id = %snapshot, "deleted consumer snapshot");
        }
        if meta.imported != ImportedObjects::default() {
            self.snapshots()
                .delete_imported_objects(&meta.imported)
                .await?;
            self.update_bootstrap(bootstrap, |e| e.imported = ImportedObjects::default())
                .await?;
            debug!(
                replication_group_id = %group,
                tables = meta.imported.new_table_ids.len(),
                "deleted imported objects"
            );
        }
        if meta.producer_snapshot_id.is_none() && meta.table_bootstrap_ids.is_empty() {
            return Ok(());
        }
        let client = self
            .producers()
            .connect(group, &meta.producer_master_addresses)?;
        if let Some(snapshot) = &meta.producer_snapshot_id {
            client.delete_snapshot(snapshot).await?;
            self.update_bootstrap(bootstrap, |e| e.producer_snapshot_id = None)
                .await?;
            debug!(replication_group_id = %group, snapshot_id = %snapshot, "deleted producer snapshot");
        }
        if !meta.table_bootstrap_ids.is_empty() {
            let streams: Vec<_> = meta.table_bootstrap_ids.values().copied().collect();
            client.delete_cdc_streams(&streams).await?;
            self.update_bootstrap(bootstrap, |e| e.table_bootstrap_ids.clear())
                .await?;
            debug!(replication_group_id = %group, streams = streams.len(), "deleted producer bootstrap streams");
        }
        Ok(())
    }

    /// Reports whether a bootstrap pipeline finished, and how.
    pub fn is_setup_namespace_replication_with_bootstrap_done(
        &self,
        group: &ReplicationGroupId,
    ) -> Result<IsSetupNamespaceReplicationWithBootstrapDoneResponse> {
        let bootstrap = self
            .bootstrap(group)
            .ok_or_else(|| MasterError::NotFound(format!("bootstrap of replication group {group}")))?;
        let meta = bootstrap.read();
        let (done, error) = match meta.state {
            SysUniverseBootstrapState::Done => (true, None),
            state if state.is_failed_or_deleted() => (
                true,
                Some(
                    meta.error
                        .clone()
                        .unwrap_or_else(|| "replication bootstrap failed".into()),
                ),
            ),
            _ => (false, None),
        };
        Ok(IsSetupNamespaceReplicationWithBootstrapDoneResponse {
            done,
            state: meta.state,
            error,
        })
    }

    /// Fails pipelines left running by an earlier leader, then unwinds and
    /// removes one failed pipeline. Returns true if one was removed.
    pub(crate) async fn clear_failed_bootstrap(&self) -> Result<bool> {
        let term = self.leader_term()?.as_u64();
        let (orphaned, failed) = {
            let maps = self.maps.read();
            let orphaned: Vec<_> = maps
                .universe_bootstrap_map
                .values()
                .filter(|b| {
                    let meta = b.read();
                    meta.leader_term < term
                        && meta.state != SysUniverseBootstrapState::Done
                        && !meta.state.is_failed_or_deleted()
                })
                .cloned()
                .collect();
            let failed = maps
                .universe_bootstrap_map
                .values()
                .find(|b| {
                    matches!(
                        b.read().state,
                        SysUniverseBootstrapState::Failed | SysUniverseBootstrapState::DeletedError
                    )
                })
                .cloned();
            (orphaned, failed)
        };
        for bootstrap in &orphaned {
            self.mark_bootstrap_failed(
                bootstrap,
                &MasterError::Aborted("bootstrap interrupted by a leader change".into()),
            )
            .await?;
        }
        let Some(bootstrap) = failed.or_else(|| orphaned.into_iter().next()) else {
            return Ok(false);
        };

        let group = bootstrap.id().clone();
        self.update_bootstrap(&bootstrap, |e| e.state = SysUniverseBootstrapState::Deleting)
            .await?;
        if let Err(e) = self.undo_bootstrap(&bootstrap).await {
            self.update_bootstrap(&bootstrap, |e| {
                e.state = SysUniverseBootstrapState::DeletedError;
            })
            .await?;
            return Err(e);
        }

        let mut l = bootstrap.lock_for_write().await;
        l.mutable().state = SysUniverseBootstrapState::Deleted;
        let mut writer = SysCatalogWriter::new();
        writer.delete::<SysUniverseReplicationBootstrapEntry>(group.as_str());
        self.persist(writer).await?;
        l.commit();
        self.maps.write().universe_bootstrap_map.remove(&group);
        info!(replication_group_id = %group, "cleared failed replication bootstrap");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ops as catalog_ops, TableCatalog};
    use crate::config::MasterConfig;
    use crate::metadata::SysUniverseReplicationState;
    use crate::sys_catalog::SysEntryType;
    use crate::universe::testing::{fixture, Fixture, PRODUCER_ADDR};

    fn config() -> MasterConfig {
        MasterConfig {
            restore_poll_interval_ms: 1,
            ..Default::default()
        }
    }

    fn request(group: &str) -> SetupNamespaceReplicationWithBootstrapRequest {
        SetupNamespaceReplicationWithBootstrapRequest {
            replication_group_id: Some(ReplicationGroupId::new(group)),
            producer_master_addresses: vec![PRODUCER_ADDR.into()],
            producer_namespace_name: Some("db".into()),
            transactional: false,
            timeout_ms: Some(5_000),
        }
    }

    async fn wait_bootstrap(f: &Fixture, group: &str) -> IsSetupNamespaceReplicationWithBootstrapDoneResponse {
        let group = ReplicationGroupId::new(group);
        for _ in 0..500 {
            let resp = f
                .manager
                .is_setup_namespace_replication_with_bootstrap_done(&group)
                .unwrap();
            if resp.done {
                return resp;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("bootstrap of {group} did not finish");
    }

    fn record(f: &Fixture, group: &str) -> Arc<SysUniverseReplicationBootstrapEntry> {
        f.manager
            .bootstrap(&ReplicationGroupId::new(group))
            .unwrap()
            .read()
    }

    #[tokio::test]
    async fn test_bootstrap_sets_up_replication() {
        let f = fixture(config()).await;
        let a = f.producer.catalog().create_table(&f.producer_ns, "a", 2);
        let b = f.producer.catalog().create_table(&f.producer_ns, "b", 1);
        f.manager
            .setup_namespace_replication_with_bootstrap(&request("g"))
            .await
            .unwrap();

        let resp = wait_bootstrap(&f, "g").await;
        assert_eq!(resp.error, None);
        assert_eq!(resp.state, SysUniverseBootstrapState::Done);

        let meta = record(&f, "g");
        assert_eq!(meta.table_bootstrap_ids.len(), 2);
        assert_eq!(meta.imported.new_table_ids.len(), 2);
        assert!(meta.imported.new_namespace_ids.is_empty());

        let universe = f.manager.universe(&ReplicationGroupId::new("g")).unwrap().read();
        assert_eq!(universe.state, SysUniverseReplicationState::Active);
        assert_eq!(universe.table_streams[&a], meta.table_bootstrap_ids[&a]);
        assert_eq!(universe.table_streams[&b], meta.table_bootstrap_ids[&b]);
        assert_eq!(universe.validated_tables[&a], meta.imported.table_map[&a]);
        assert_eq!(f.consumer.list_tables(&f.consumer_ns).len(), 2);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let f = fixture(config()).await;
        f.producer.catalog().create_table(&f.producer_ns, "a", 1);

        let mut req = request("g");
        req.producer_namespace_name = None;
        assert!(matches!(
            f.manager.setup_namespace_replication_with_bootstrap(&req).await,
            Err(MasterError::InvalidArgument(_))
        ));
        let req = request("g.ALTER");
        assert!(matches!(
            f.manager.setup_namespace_replication_with_bootstrap(&req).await,
            Err(MasterError::InvalidArgument(_))
        ));

        f.manager
            .setup_namespace_replication_with_bootstrap(&request("g"))
            .await
            .unwrap();
        assert!(matches!(
            f.manager
                .setup_namespace_replication_with_bootstrap(&request("g"))
                .await,
            Err(MasterError::AlreadyPresent(_))
        ));
        assert!(f
            .manager
            .is_setup_namespace_replication_with_bootstrap_done(&ReplicationGroupId::new("x"))
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failure_unwinds_producer_side() {
        let f = fixture(MasterConfig {
            test_fail_bootstrap_at: Some("import_snapshot".into()),
            ..config()
        })
        .await;
        f.producer.catalog().create_table(&f.producer_ns, "a", 1);
        f.manager
            .setup_namespace_replication_with_bootstrap(&request("g"))
            .await
            .unwrap();

        let resp = wait_bootstrap(&f, "g").await;
        assert_eq!(resp.state, SysUniverseBootstrapState::Failed);
        assert!(resp.error.unwrap().contains("injected"));
        let meta = record(&f, "g");
        assert_eq!(meta.failed_on, Some(SysUniverseBootstrapState::ImportSnapshot));
        assert_eq!(meta.table_bootstrap_ids.len(), 1);
        assert_eq!(f.producer.catalog().snapshot_count(), 1);

        assert!(f.manager.clear_failed_bootstrap().await.unwrap());
        assert!(f.producer.stream_ids().is_empty());
        assert_eq!(f.producer.catalog().snapshot_count(), 0);
        assert!(f.consumer.list_tables(&f.consumer_ns).is_empty());
    }

    #[tokio::test]
    async fn test_restore_failure_drops_imported_objects() {
        let f = fixture(config()).await;
        f.producer.catalog().create_table(&f.producer_ns, "a", 1);
        f.consumer.fail_operation(catalog_ops::RESTORE_SNAPSHOT);
        f.manager
            .setup_namespace_replication_with_bootstrap(&request("g"))
            .await
            .unwrap();

        let resp = wait_bootstrap(&f, "g").await;
        assert!(resp.error.is_some());
        assert_eq!(
            record(&f, "g").failed_on,
            Some(SysUniverseBootstrapState::RestoreSnapshot)
        );
        assert_eq!(f.consumer.snapshot_count(), 1);
        assert_eq!(f.consumer.list_tables(&f.consumer_ns).len(), 1);

        assert!(f.manager.clear_failed_bootstrap().await.unwrap());
        assert_eq!(f.consumer.snapshot_count(), 0);
        assert!(f.consumer.list_tables(&f.consumer_ns).is_empty());
        assert!(f.manager.universe(&ReplicationGroupId::new("g")).is_none());
    }

    #[tokio::test]
    async fn test_clear_failed_bootstrap_removes_record() {
        let f = fixture(MasterConfig {
            test_fail_bootstrap_at: Some("create_producer_snapshot".into()),
            ..config()
        })
        .await;
        f.producer.catalog().create_table(&f.producer_ns, "a", 1);
        f.manager
            .setup_namespace_replication_with_bootstrap(&request("g"))
            .await
            .unwrap();
        wait_bootstrap(&f, "g").await;

        assert!(f.manager.clear_failed_bootstrap().await.unwrap());
        assert!(f.manager.bootstrap(&ReplicationGroupId::new("g")).is_none());
        assert!(!f
            .sys_catalog
            .contains(SysEntryType::UniverseReplicationBootstrap, "g"));
        assert!(f.producer.stream_ids().is_empty());
        assert!(!f.manager.clear_failed_bootstrap().await.unwrap());
    }

    #[tokio::test]
    async fn test_pipeline_of_earlier_leader_is_failed_and_cleared() {
        let f = fixture(config()).await;
        let group = ReplicationGroupId::new("old");
        let mut entry = SysUniverseReplicationBootstrapEntry::new(
            vec![PRODUCER_ADDR.into()],
            "db".into(),
            0,
        );
        entry.state = SysUniverseBootstrapState::TransferSnapshot;
        f.manager
            .maps
            .write()
            .universe_bootstrap_map
            .insert(group.clone(), CatalogEntity::new(group.clone(), entry));

        assert!(f.manager.clear_failed_bootstrap().await.unwrap());
        assert!(f.manager.bootstrap(&group).is_none());
    }
}
