//! In-memory consumer and producer clusters shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use xrepl_master::catalog::MemoryTableCatalog;
use xrepl_master::cdc_state::MemoryCdcStateTable;
use xrepl_master::producer::{MemoryProducer, MemoryProducerFactory};
use xrepl_master::rpc::{IsSetupUniverseReplicationDoneRequest, IsOperationDoneResponse, SetupUniverseReplicationRequest};
use xrepl_master::sys_catalog::MemorySysCatalog;
use xrepl_master::types::{Deadline, LeaderTerm, NamespaceId, ReplicationGroupId, TableId};
use xrepl_master::{MasterConfig, ReplicationService, XreplCatalogManager, XreplCollaborators};

pub const PRODUCER_ADDR: &str = "producer-1:7100";

/// A consumer master plus the collaborators it was built from, so a second
/// manager can take over the same state.
pub struct TestCluster {
    pub config: MasterConfig,
    pub manager: Arc<XreplCatalogManager>,
    pub service: ReplicationService,
    pub sys_catalog: Arc<MemorySysCatalog>,
    pub cdc_state: Arc<MemoryCdcStateTable>,
    pub tables: Arc<MemoryTableCatalog>,
    pub factory: Arc<MemoryProducerFactory>,
    pub producer: Arc<MemoryProducer>,
    pub ns: NamespaceId,
    pub producer_ns: NamespaceId,
}

fn build_manager(
    config: MasterConfig,
    sys_catalog: &Arc<MemorySysCatalog>,
    cdc_state: &Arc<MemoryCdcStateTable>,
    tables: &Arc<MemoryTableCatalog>,
    factory: &Arc<MemoryProducerFactory>,
) -> Arc<XreplCatalogManager> {
    XreplCatalogManager::new(
        config,
        XreplCollaborators {
            sys_catalog: sys_catalog.clone(),
            cdc_state: cdc_state.clone(),
            tables: tables.clone(),
            snapshots: tables.clone(),
            producers: factory.clone(),
        },
    )
}

pub fn test_config() -> MasterConfig {
    MasterConfig {
        safe_op_id_poll_interval_ms: 1,
        restore_poll_interval_ms: 1,
        cdcsdk_enable_dynamic_table_addition: false,
        ..MasterConfig::default()
    }
}

impl TestCluster {
    pub async fn start(config: MasterConfig) -> Self {
        let sys_catalog = Arc::new(MemorySysCatalog::new());
        let cdc_state = Arc::new(MemoryCdcStateTable::new());
        let tables = Arc::new(MemoryTableCatalog::new("c"));
        tables.set_auto_populate_safe_op_ids(true);
        let producer = Arc::new(MemoryProducer::new(Arc::new(MemoryTableCatalog::new("p"))));
        let factory = Arc::new(MemoryProducerFactory::new());
        factory.register(PRODUCER_ADDR, producer.clone());

        let manager = build_manager(config.clone(), &sys_catalog, &cdc_state, &tables, &factory);
        manager.become_leader(LeaderTerm::new(1)).await.unwrap();
        let ns = tables.create_namespace("db");
        let producer_ns = producer.catalog().create_namespace("db");
        Self {
            config,
            service: ReplicationService::new(manager.clone()),
            manager,
            sys_catalog,
            cdc_state,
            tables,
            factory,
            producer,
            ns,
            producer_ns,
        }
    }

    /// Fails over to a fresh manager at `term`, reloading from the sys catalog.
    /// The previous manager is fenced by the new term.
    pub async fn fail_over(&mut self, term: u64) -> Arc<XreplCatalogManager> {
        let old = self.manager.clone();
        self.sys_catalog.set_leader_term(LeaderTerm::new(term));
        let manager = build_manager(
            self.config.clone(),
            &self.sys_catalog,
            &self.cdc_state,
            &self.tables,
            &self.factory,
        );
        manager.become_leader(LeaderTerm::new(term)).await.unwrap();
        self.service = ReplicationService::new(manager.clone());
        self.manager = manager;
        old
    }

    /// Same-named tables on the producer and here.
    pub fn table_pair(&self, name: &str, producer_tablets: usize, consumer_tablets: usize) -> (TableId, TableId) {
        (
            self.producer
                .catalog()
                .create_table(&self.producer_ns, name, producer_tablets),
            self.tables.create_table(&self.ns, name, consumer_tablets),
        )
    }

    pub fn setup_request(&self, group: &str, tables: Vec<TableId>) -> SetupUniverseReplicationRequest {
        SetupUniverseReplicationRequest {
            replication_group_id: Some(ReplicationGroupId::new(group)),
            producer_master_addresses: vec![PRODUCER_ADDR.into()],
            producer_table_ids: tables,
            ..Default::default()
        }
    }

    pub async fn wait_setup(&self, group: &str) -> IsOperationDoneResponse {
        let req = IsSetupUniverseReplicationDoneRequest {
            replication_group_id: Some(ReplicationGroupId::new(group)),
        };
        for _ in 0..1_000 {
            let resp = self.service.is_setup_universe_replication_done(&req).unwrap();
            if resp.done {
                return resp;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("setup of {group} did not finish");
    }
}

pub fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}
