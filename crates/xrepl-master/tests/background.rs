//! Background cleanup driven by the periodic loop.

mod common;

use std::time::Duration;

use common::{test_config, TestCluster};
use tokio::sync::watch;
use xrepl_master::metadata::options;
use xrepl_master::producer::ops;
use xrepl_master::rpc::{CreateCdcStreamRequest, DeleteCdcStreamRequest, GetUniverseReplicationRequest};
use xrepl_master::sys_catalog::SysEntryType;
use xrepl_master::types::{IdType, ReplicationGroupId};
use xrepl_master::{spawn_background_loop, MasterConfig, MasterError};

#[tokio::test]
async fn test_failed_group_is_cleared() {
    let cluster = TestCluster::start(test_config()).await;
    let (a, _) = cluster.table_pair("a", 1, 1);
    cluster.producer.fail_operation(ops::CREATE_STREAM);
    cluster
        .service
        .setup_universe_replication(&cluster.setup_request("g", vec![a]))
        .await
        .unwrap();
    assert!(cluster.wait_setup("g").await.error.is_some());
    assert!(cluster.sys_catalog.contains(SysEntryType::UniverseReplication, "g"));

    let stats = cluster.manager.run_background_tasks().await;
    assert_eq!(stats.universes_cleared, 1);
    assert!(!cluster.sys_catalog.contains(SysEntryType::UniverseReplication, "g"));
    assert!(matches!(
        cluster
            .service
            .get_universe_replication(&GetUniverseReplicationRequest {
                replication_group_id: Some(ReplicationGroupId::new("g")),
            }),
        Err(MasterError::NotFound(_))
    ));

    // Nothing left for the next cycle.
    let stats = cluster.manager.run_background_tasks().await;
    assert_eq!(stats.universes_cleared, 0);
}

#[tokio::test]
async fn test_background_loop_removes_deleted_stream() {
    let config = MasterConfig {
        bg_task_interval_ms: 1,
        ..test_config()
    };
    let cluster = TestCluster::start(config).await;
    cluster.tables.create_table(&cluster.ns, "t", 2);
    let mut req = CreateCdcStreamRequest {
        namespace_id: Some(cluster.ns.clone()),
        ..Default::default()
    };
    req.options
        .insert(options::ID_TYPE.into(), IdType::NamespaceId.as_str().into());
    let created = cluster.service.create_cdc_stream(&req).await.unwrap();
    assert_eq!(cluster.cdc_state.rows_for_stream(created.stream_id).len(), 2);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bg = spawn_background_loop(cluster.manager.clone(), shutdown_rx);
    cluster
        .service
        .delete_cdc_stream(&DeleteCdcStreamRequest {
            stream_ids: vec![created.stream_id],
            ..Default::default()
        })
        .await
        .unwrap();

    let mut removed = false;
    for _ in 0..1_000 {
        if cluster.manager.stream(&created.stream_id).is_none() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(removed);
    assert!(cluster.cdc_state.rows_for_stream(created.stream_id).is_empty());
    assert!(!cluster
        .sys_catalog
        .contains(SysEntryType::CdcStream, &created.stream_id.to_string()));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), bg)
        .await
        .expect("background loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_background_loop_idles_after_step_down() {
    let cluster = TestCluster::start(test_config()).await;
    cluster.manager.step_down();
    let stats = cluster.manager.run_background_tasks().await;
    assert_eq!(stats, Default::default());
}
