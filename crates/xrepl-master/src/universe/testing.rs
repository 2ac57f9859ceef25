//! A consumer manager wired to one in-memory producer.

use std::sync::Arc;
use std::time::Duration;

use crate::catalog::MemoryTableCatalog;
use crate::cdc_state::MemoryCdcStateTable;
use crate::config::MasterConfig;
use crate::manager::{XreplCatalogManager, XreplCollaborators};
use crate::producer::{MemoryProducer, MemoryProducerFactory};
use crate::rpc::{IsOperationDoneResponse, SetupUniverseReplicationRequest};
use crate::sys_catalog::MemorySysCatalog;
use crate::types::{LeaderTerm, NamespaceId, ReplicationGroupId, TableId};

pub(crate) const PRODUCER_ADDR: &str = "p1:7100";

pub(crate) struct Fixture {
    pub manager: Arc<XreplCatalogManager>,
    pub sys_catalog: Arc<MemorySysCatalog>,
    pub consumer: Arc<MemoryTableCatalog>,
    pub producer: Arc<MemoryProducer>,
    pub producer_ns: NamespaceId,
    pub consumer_ns: NamespaceId,
}

pub(crate) async fn fixture(config: MasterConfig) -> Fixture {
    let sys_catalog = Arc::new(MemorySysCatalog::new());
    let consumer = Arc::new(MemoryTableCatalog::new("c"));
    let producer = Arc::new(MemoryProducer::new(Arc::new(MemoryTableCatalog::new("p"))));
    let factory = Arc::new(MemoryProducerFactory::new());
    factory.register(PRODUCER_ADDR, producer.clone());
    let manager = XreplCatalogManager::new(
        config,
        XreplCollaborators {
            sys_catalog: sys_catalog.clone(),
            cdc_state: Arc::new(MemoryCdcStateTable::new()),
            tables: consumer.clone(),
            snapshots: consumer.clone(),
            producers: factory,
        },
    );
    manager.become_leader(LeaderTerm::new(1)).await.unwrap();
    let producer_ns = producer.catalog().create_namespace("db");
    let consumer_ns = consumer.create_namespace("db");
    Fixture {
        manager,
        sys_catalog,
        consumer,
        producer,
        producer_ns,
        consumer_ns,
    }
}

impl Fixture {
    /// Same-named tables on both sides.
    pub fn table_pair(&self, name: &str, producer_tablets: usize, consumer_tablets: usize) -> (TableId, TableId) {
        (
            self.producer
                .catalog()
                .create_table(&self.producer_ns, name, producer_tablets),
            self.consumer
                .create_table(&self.consumer_ns, name, consumer_tablets),
        )
    }

    pub fn request(&self, group: &str, tables: Vec<TableId>) -> SetupUniverseReplicationRequest {
        SetupUniverseReplicationRequest {
            replication_group_id: Some(ReplicationGroupId::new(group)),
            producer_master_addresses: vec![PRODUCER_ADDR.into()],
            producer_table_ids: tables,
            ..Default::default()
        }
    }

    pub async fn wait_done(&self, group: &str) -> IsOperationDoneResponse {
        let group = ReplicationGroupId::new(group);
        for _ in 0..500 {
            let resp = self
                .manager
                .is_setup_universe_replication_done(&group)
                .unwrap();
            if resp.done {
                return resp;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("setup of {group} did not finish");
    }

    /// Sets up `group` over `tables` and waits for it to become active.
    pub async fn active_group(&self, group: &str, tables: Vec<TableId>) {
        self.manager
            .setup_universe_replication(&self.request(group, tables))
            .await
            .unwrap();
        assert_eq!(self.wait_done(group).await.error, None);
    }
}
