//! The xrepl catalog manager.
//!
//! [`XreplCatalogManager`] owns the in-memory maps and the handles to every
//! collaborator. Its operations are spread over the stream, universe, split and
//! background task modules, each adding an `impl XreplCatalogManager` block.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::catalog::{SnapshotCoordinator, TableCatalog};
use crate::cdc_state::CdcStateTable;
use crate::config::MasterConfig;
use crate::error::{MasterError, Result};
use crate::maps::XreplMaps;
use crate::metadata::{
    CdcStreamInfo, CatalogEntity, ClusterConfigInfo, SysClusterConfigEntry, CLUSTER_CONFIG_ID,
    UniverseReplicationBootstrapInfo, UniverseReplicationInfo,
};
use crate::producer::ProducerClientFactory;
use crate::sys_catalog::{SysCatalog, SysCatalogWriter};
use crate::types::{LeaderTerm, ReplicationGroupId, StreamId};

/// External collaborators of the manager.
#[derive(Clone)]
pub struct XreplCollaborators {
    /// Persistent entity store.
    pub sys_catalog: Arc<dyn SysCatalog>,
    /// CDC state table.
    pub cdc_state: Arc<dyn CdcStateTable>,
    /// Table and tablet catalog.
    pub tables: Arc<dyn TableCatalog>,
    /// Local snapshot operations.
    pub snapshots: Arc<dyn SnapshotCoordinator>,
    /// Producer cluster clients.
    pub producers: Arc<dyn ProducerClientFactory>,
}

/// Master-side owner of CDC stream and xCluster replication metadata.
pub struct XreplCatalogManager {
    config: MasterConfig,
    sys_catalog: Arc<dyn SysCatalog>,
    cdc_state: Arc<dyn CdcStateTable>,
    tables: Arc<dyn TableCatalog>,
    snapshots: Arc<dyn SnapshotCoordinator>,
    producers: Arc<dyn ProducerClientFactory>,
    pub(crate) maps: RwLock<XreplMaps>,
    leader_term: AtomicU64,
}

impl XreplCatalogManager {
    /// Creates a manager that is not yet leader.
    pub fn new(config: MasterConfig, collaborators: XreplCollaborators) -> Arc<Self> {
        Arc::new(Self {
            config,
            sys_catalog: collaborators.sys_catalog,
            cdc_state: collaborators.cdc_state,
            tables: collaborators.tables,
            snapshots: collaborators.snapshots,
            producers: collaborators.producers,
            maps: RwLock::new(XreplMaps::default()),
            leader_term: AtomicU64::new(0),
        })
    }

    /// Runtime configuration.
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Persistent entity store.
    pub fn sys_catalog(&self) -> &Arc<dyn SysCatalog> {
        &self.sys_catalog
    }

    /// CDC state table.
    pub fn cdc_state(&self) -> &Arc<dyn CdcStateTable> {
        &self.cdc_state
    }

    /// Table catalog.
    pub fn tables(&self) -> &Arc<dyn TableCatalog> {
        &self.tables
    }

    /// Snapshot operations.
    pub fn snapshots(&self) -> &Arc<dyn SnapshotCoordinator> {
        &self.snapshots
    }

    /// Producer clients.
    pub fn producers(&self) -> &Arc<dyn ProducerClientFactory> {
        &self.producers
    }

    /// Takes over leadership at `term` and rebuilds every map from the sys
    /// catalog. A failed load leaves the manager without leadership.
    pub async fn become_leader(&self, term: LeaderTerm) -> Result<()> {
        self.leader_term.store(0, Ordering::SeqCst);
        self.load_all().await?;
        self.leader_term.store(term.as_u64(), Ordering::SeqCst);
        info!(term = %term, "xrepl catalog manager became leader");
        Ok(())
    }

    /// Drops leadership. Maps are kept until the next load.
    pub fn step_down(&self) {
        self.leader_term.store(0, Ordering::SeqCst);
        info!("xrepl catalog manager stepped down");
    }

    /// Returns true while leader.
    pub fn is_leader(&self) -> bool {
        self.leader_term.load(Ordering::SeqCst) != 0
    }

    /// Current leader term, or an error when not leader.
    pub fn leader_term(&self) -> Result<LeaderTerm> {
        match self.leader_term.load(Ordering::SeqCst) {
            0 => Err(MasterError::IllegalState(
                "xrepl catalog manager is not the leader".into(),
            )),
            term => Ok(LeaderTerm::new(term)),
        }
    }

    /// Writes a batch under the current leader term.
    pub async fn persist(&self, writer: SysCatalogWriter) -> Result<()> {
        let term = self.leader_term()?;
        self.sys_catalog.write(term, writer).await
    }

    /// Looks up a stream, deleting ones included.
    pub fn stream(&self, stream_id: &StreamId) -> Option<Arc<CdcStreamInfo>> {
        self.maps.read().cdc_stream_map.get(stream_id).cloned()
    }

    /// Looks up a stream that is not being deleted.
    pub fn live_stream(&self, stream_id: &StreamId) -> Result<Arc<CdcStreamInfo>> {
        self.stream(stream_id)
            .filter(|s| !s.read().is_deleting())
            .ok_or_else(|| MasterError::NotFound(format!("CDC stream {stream_id}")))
    }

    /// Looks up a replication group.
    pub fn universe(&self, id: &ReplicationGroupId) -> Option<Arc<UniverseReplicationInfo>> {
        self.maps.read().universe_replication_map.get(id).cloned()
    }

    /// Looks up a bootstrap pipeline.
    pub fn bootstrap(&self, id: &ReplicationGroupId) -> Option<Arc<UniverseReplicationBootstrapInfo>> {
        self.maps.read().universe_bootstrap_map.get(id).cloned()
    }

    /// The cluster config, created empty if none was persisted yet.
    pub fn cluster_config(&self) -> Arc<ClusterConfigInfo> {
        if let Some(config) = self.maps.read().cluster_config.clone() {
            return config;
        }
        let mut maps = self.maps.write();
        maps.cluster_config
            .get_or_insert_with(|| {
                CatalogEntity::new(CLUSTER_CONFIG_ID.to_string(), SysClusterConfigEntry::default())
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryTableCatalog;
    use crate::cdc_state::MemoryCdcStateTable;
    use crate::producer::MemoryProducerFactory;
    use crate::sys_catalog::MemorySysCatalog;

    fn manager() -> Arc<XreplCatalogManager> {
        let tables = Arc::new(MemoryTableCatalog::new("c"));
        XreplCatalogManager::new(
            MasterConfig::default(),
            XreplCollaborators {
                sys_catalog: Arc::new(MemorySysCatalog::new()),
                cdc_state: Arc::new(MemoryCdcStateTable::new()),
                tables: tables.clone(),
                snapshots: tables,
                producers: Arc::new(MemoryProducerFactory::new()),
            },
        )
    }

    #[tokio::test]
    async fn test_not_leader_until_loaded() {
        let manager = manager();
        assert!(!manager.is_leader());
        assert!(manager.persist(SysCatalogWriter::new()).await.is_err());
        manager.become_leader(LeaderTerm::new(1)).await.unwrap();
        assert!(manager.is_leader());
        manager.persist(SysCatalogWriter::new()).await.unwrap();
        manager.step_down();
        assert!(manager.leader_term().is_err());
    }

    #[tokio::test]
    async fn test_cluster_config_created_once() {
        let manager = manager();
        let a = manager.cluster_config();
        let b = manager.cluster_config();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.read().version, 0);
    }
}
