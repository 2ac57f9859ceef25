//! Consumer registry upkeep for producer tablet splits.
//!
//! The registry maps each consumer tablet to the producer tablet ranges it
//! pulls from. When a producer tablet splits, its range is replaced by the two
//! children and the registry version is bumped so tservers reload it.

use tracing::{debug, info};

use crate::error::{MasterError, Result};
use crate::manager::XreplCatalogManager;
use crate::metadata::{ProducerTabletRange, StreamEntry};
use crate::rpc::{ProducerSplitTabletInfo, UpdateConsumerOnProducerSplitRequest};
use crate::sys_catalog::SysCatalogWriter;

use super::required_group_id;

/// Replaces the parent range by its two children wherever it appears.
/// Returns false if the split was already applied.
fn apply_producer_split(stream: &mut StreamEntry, split: &ProducerSplitTabletInfo) -> Result<bool> {
    let mut applied = false;
    let mut seen_children = false;
    for ranges in stream.consumer_producer_tablet_map.values_mut() {
        seen_children |= ranges
            .iter()
            .any(|r| r.tablet_id == split.new_tablet1_id || r.tablet_id == split.new_tablet2_id);
        let Some(pos) = ranges.iter().position(|r| r.tablet_id == split.tablet_id) else {
            continue;
        };
        let parent = ranges.remove(pos);
        let key = &split.split_partition_key;
        let inside = key.as_slice() > parent.start_key.as_slice()
            && (parent.end_key.is_empty() || key.as_slice() < parent.end_key.as_slice());
        if !inside {
            ranges.insert(pos, parent);
            return Err(MasterError::InvalidArgument(format!(
                "split key of producer tablet {} is outside its range",
                split.tablet_id
            )));
        }
        ranges.insert(
            pos,
            ProducerTabletRange {
                tablet_id: split.new_tablet2_id.clone(),
                start_key: key.clone(),
                end_key: parent.end_key,
            },
        );
        ranges.insert(
            pos,
            ProducerTabletRange {
                tablet_id: split.new_tablet1_id.clone(),
                start_key: parent.start_key,
                end_key: key.clone(),
            },
        );
        applied = true;
    }
    if !applied && !seen_children {
        return Err(MasterError::NotFound(format!(
            "producer tablet {} in consumer registry",
            split.tablet_id
        )));
    }
    Ok(applied)
}

impl XreplCatalogManager {
    /// Applies a producer tablet split to the registry so consumer tservers
    /// start polling the children.
    pub async fn update_consumer_on_producer_split(
        &self,
        req: &UpdateConsumerOnProducerSplitRequest,
    ) -> Result<()> {
        let group = required_group_id(&req.replication_group_id)?;
        let stream_id = req
            .stream_id
            .ok_or_else(|| MasterError::InvalidArgument("stream id is required".into()))?;
        let split = req
            .producer_split_tablet_info
            .as_ref()
            .ok_or_else(|| MasterError::InvalidArgument("producer split tablet info is required".into()))?;

        let config = self.cluster_config();
        let mut l = config.lock_for_write().await;
        let stream = l
            .mutable()
            .consumer_registry
            .producer_map
            .get_mut(group)
            .ok_or_else(|| MasterError::NotFound(format!("replication group {group} in consumer registry")))?
            .stream_map
            .get_mut(&stream_id)
            .ok_or_else(|| MasterError::NotFound(format!("stream {stream_id} of replication group {group}")))?;

        if !apply_producer_split(stream, split)? {
            debug!(stream_id = %stream_id, tablet_id = %split.tablet_id, "producer split already applied");
            return Ok(());
        }
        stream.same_num_producer_consumer_tablets = false;
        l.mutable().version += 1;
        let mut writer = SysCatalogWriter::new();
        writer.upsert(config.id(), l.data())?;
        self.persist(writer).await?;
        l.commit();
        info!(
            replication_group_id = %group,
            stream_id = %stream_id,
            tablet_id = %split.tablet_id,
            "applied producer tablet split to consumer registry"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryTableCatalog;
    use crate::cdc_state::MemoryCdcStateTable;
    use crate::config::MasterConfig;
    use crate::manager::XreplCollaborators;
    use crate::metadata::{ProducerEntry, SchemaVersions};
    use crate::producer::MemoryProducerFactory;
    use crate::rpc::UpdateConsumerOnProducerMetadataRequest;
    use crate::sys_catalog::MemorySysCatalog;
    use crate::types::{LeaderTerm, ReplicationGroupId, StreamId, TableId, TabletId};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn range(tablet: &str, start: &[u8], end: &[u8]) -> ProducerTabletRange {
        ProducerTabletRange {
            tablet_id: TabletId::new(tablet),
            start_key: start.to_vec(),
            end_key: end.to_vec(),
        }
    }

    async fn registry_fixture() -> (Arc<XreplCatalogManager>, ReplicationGroupId, StreamId) {
        let tables = Arc::new(MemoryTableCatalog::new("c"));
        let manager = XreplCatalogManager::new(
            MasterConfig::default(),
            XreplCollaborators {
                sys_catalog: Arc::new(MemorySysCatalog::new()),
                cdc_state: Arc::new(MemoryCdcStateTable::new()),
                tables: tables.clone(),
                snapshots: tables,
                producers: Arc::new(MemoryProducerFactory::new()),
            },
        );
        manager.become_leader(LeaderTerm::new(1)).await.unwrap();

        let group = ReplicationGroupId::new("g");
        let stream_id = StreamId::generate();
        let stream = StreamEntry {
            consumer_table_id: TableId::new("ct"),
            producer_table_id: TableId::new("pt"),
            consumer_producer_tablet_map: BTreeMap::from([(
                TabletId::new("c1"),
                vec![range("p1", b"", b"")],
            )]),
            same_num_producer_consumer_tablets: true,
            local_tserver_optimized: false,
            schema_versions: SchemaVersions::default(),
            colocated_schema_versions: BTreeMap::new(),
        };
        let config = manager.cluster_config();
        let mut l = config.lock_for_write().await;
        l.mutable().consumer_registry.producer_map.insert(
            group.clone(),
            ProducerEntry {
                master_addrs: vec!["p:7100".into()],
                stream_map: BTreeMap::from([(stream_id, stream)]),
                disable_stream: false,
            },
        );
        l.commit();
        (manager, group, stream_id)
    }

    fn split_request(group: &ReplicationGroupId, stream_id: StreamId, key: &[u8]) -> UpdateConsumerOnProducerSplitRequest {
        UpdateConsumerOnProducerSplitRequest {
            replication_group_id: Some(group.clone()),
            stream_id: Some(stream_id),
            producer_split_tablet_info: Some(ProducerSplitTabletInfo {
                tablet_id: TabletId::new("p1"),
                new_tablet1_id: TabletId::new("p1a"),
                new_tablet2_id: TabletId::new("p1b"),
                split_partition_key: key.to_vec(),
            }),
        }
    }

    fn stream_entry(manager: &XreplCatalogManager, group: &ReplicationGroupId, stream_id: &StreamId) -> StreamEntry {
        manager.cluster_config().read().consumer_registry.producer_map[group].stream_map[stream_id].clone()
    }

    #[tokio::test]
    async fn test_split_replaces_parent_range() {
        let (manager, group, stream_id) = registry_fixture().await;
        manager
            .update_consumer_on_producer_split(&split_request(&group, stream_id, b"m"))
            .await
            .unwrap();

        let entry = stream_entry(&manager, &group, &stream_id);
        assert_eq!(
            entry.consumer_producer_tablet_map[&TabletId::new("c1")],
            vec![range("p1a", b"", b"m"), range("p1b", b"m", b"")]
        );
        assert!(!entry.same_num_producer_consumer_tablets);
        assert_eq!(manager.cluster_config().read().version, 1);
    }

    #[tokio::test]
    async fn test_repeated_split_is_noop() {
        let (manager, group, stream_id) = registry_fixture().await;
        let req = split_request(&group, stream_id, b"m");
        manager.update_consumer_on_producer_split(&req).await.unwrap();
        manager.update_consumer_on_producer_split(&req).await.unwrap();
        assert_eq!(manager.cluster_config().read().version, 1);
    }

    #[tokio::test]
    async fn test_split_errors() {
        let (manager, group, stream_id) = registry_fixture().await;
        let mut req = split_request(&group, stream_id, b"m");
        req.producer_split_tablet_info = None;
        assert!(matches!(
            manager.update_consumer_on_producer_split(&req).await,
            Err(MasterError::InvalidArgument(_))
        ));

        let req = split_request(&group, StreamId::generate(), b"m");
        assert!(manager.update_consumer_on_producer_split(&req).await.unwrap_err().is_not_found());

        let req = split_request(&group, stream_id, b"");
        assert!(matches!(
            manager.update_consumer_on_producer_split(&req).await,
            Err(MasterError::InvalidArgument(_))
        ));
        assert_eq!(stream_entry(&manager, &group, &stream_id).consumer_producer_tablet_map[&TabletId::new("c1")].len(), 1);
    }

    fn metadata_request(
        group: &ReplicationGroupId,
        stream_id: StreamId,
        colocation_id: Option<u32>,
        producer: u32,
        consumer: u32,
    ) -> UpdateConsumerOnProducerMetadataRequest {
        UpdateConsumerOnProducerMetadataRequest {
            replication_group_id: Some(group.clone()),
            stream_id: Some(stream_id),
            colocation_id,
            producer_schema_version: producer,
            consumer_schema_version: consumer,
        }
    }

    #[tokio::test]
    async fn test_metadata_updates_and_waits() {
        let (manager, group, stream_id) = registry_fixture().await;
        let resp = manager
            .update_consumer_on_producer_metadata(&metadata_request(&group, stream_id, None, 1, 1))
            .await
            .unwrap();
        assert!(!resp.should_wait);
        assert_eq!(resp.last_compatible_consumer_schema_version, 1);
        assert_eq!(manager.cluster_config().read().version, 1);

        // Producer moved on while the consumer schema did not.
        let resp = manager
            .update_consumer_on_producer_metadata(&metadata_request(&group, stream_id, None, 2, 1))
            .await
            .unwrap();
        assert!(resp.should_wait);
        assert_eq!(resp.last_compatible_consumer_schema_version, 1);
        // The producer bump is recorded even while the tserver waits.
        assert_eq!(manager.cluster_config().read().version, 2);
        let versions = stream_entry(&manager, &group, &stream_id).schema_versions;
        assert_eq!(versions.current_producer_schema_version, 2);
        assert_eq!(versions.current_consumer_schema_version, 1);
        assert_eq!(versions.old_producer_schema_version, 1);

        // Same report again: still waiting, nothing new to persist.
        let resp = manager
            .update_consumer_on_producer_metadata(&metadata_request(&group, stream_id, None, 2, 1))
            .await
            .unwrap();
        assert!(resp.should_wait);
        assert_eq!(manager.cluster_config().read().version, 2);

        let resp = manager
            .update_consumer_on_producer_metadata(&metadata_request(&group, stream_id, None, 2, 2))
            .await
            .unwrap();
        assert!(!resp.should_wait);
        assert_eq!(resp.last_compatible_consumer_schema_version, 2);
        let versions = stream_entry(&manager, &group, &stream_id).schema_versions;
        assert_eq!(versions.current_producer_schema_version, 2);
        assert_eq!(versions.current_consumer_schema_version, 2);
        assert_eq!(versions.old_producer_schema_version, 1);
        assert_eq!(manager.cluster_config().read().version, 3);

        // A repeated report does not bump the registry.
        manager
            .update_consumer_on_producer_metadata(&metadata_request(&group, stream_id, None, 2, 2))
            .await
            .unwrap();
        assert_eq!(manager.cluster_config().read().version, 3);
    }

    #[tokio::test]
    async fn test_metadata_colocated_table() {
        let (manager, group, stream_id) = registry_fixture().await;
        manager
            .update_consumer_on_producer_metadata(&metadata_request(&group, stream_id, Some(16384), 3, 4))
            .await
            .unwrap();
        let entry = stream_entry(&manager, &group, &stream_id);
        assert_eq!(entry.colocated_schema_versions[&16384u32].current_consumer_schema_version, 4);
        assert_eq!(entry.schema_versions, SchemaVersions::default());
    }
}
