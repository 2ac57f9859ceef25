//! In-memory indexes over streams, replication groups and bootstraps.
//!
//! All of them live in one [`XreplMaps`] value behind a single RW lock owned by
//! the catalog manager. The lock is only ever held for in-memory work; no
//! guard crosses an `.await`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{MasterError, Result};
use crate::metadata::{
    CdcStreamInfo, ClusterConfigInfo, SysCdcStreamEntry, SysCdcStreamState,
    UniverseReplicationBootstrapInfo, UniverseReplicationInfo,
};
use crate::types::{
    NamespaceId, ReplicationErrorCode, ReplicationGroupId, StreamId, TableId, TabletId,
};

/// A hidden split parent kept alive for CDCSDK streams.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HiddenTabletInfo {
    /// Table the tablet belongs to.
    pub table_id: TableId,
    /// Tablets produced by the split.
    pub split_children: Vec<TabletId>,
}

/// Replication errors of one stream, by kind.
pub type StreamReplicationErrors = BTreeMap<ReplicationErrorCode, String>;

/// Every index the xrepl subsystems maintain.
#[derive(Default)]
pub struct XreplMaps {
    /// Stream id to stream.
    pub cdc_stream_map: BTreeMap<StreamId, Arc<CdcStreamInfo>>,
    /// Table to the xCluster streams on it.
    pub xcluster_tables_to_stream: BTreeMap<TableId, BTreeSet<StreamId>>,
    /// Table to the CDCSDK streams qualifying it.
    pub cdcsdk_tables_to_stream: BTreeMap<TableId, BTreeSet<StreamId>>,
    /// Tables found in a namespace but missing from some CDCSDK stream.
    pub namespace_to_cdcsdk_unprocessed_tables: BTreeMap<NamespaceId, BTreeSet<TableId>>,
    /// Tables present in CDCSDK streams that are not eligible.
    pub namespace_to_cdcsdk_non_eligible_tables: BTreeMap<NamespaceId, BTreeSet<TableId>>,
    /// Replication slot name to stream.
    pub replication_slot_to_stream: BTreeMap<String, StreamId>,
    /// Replication groups.
    pub universe_replication_map: BTreeMap<ReplicationGroupId, Arc<UniverseReplicationInfo>>,
    /// Bootstrap pipelines.
    pub universe_bootstrap_map: BTreeMap<ReplicationGroupId, Arc<UniverseReplicationBootstrapInfo>>,
    /// Consumer table to the group replicating into it.
    pub xcluster_consumer_tables: BTreeMap<TableId, ReplicationGroupId>,
    /// Ids owned by a live or not yet cleaned up stream.
    pub in_use_stream_ids: BTreeSet<StreamId>,
    /// Ids freed by full cleanup, handed out again before new random ids.
    pub recovered_stream_ids: Vec<StreamId>,
    /// Hidden split parents retained for CDCSDK.
    pub retained_by_cdcsdk: BTreeMap<TabletId, HiddenTabletInfo>,
    /// Errors reported per group and stream.
    pub replication_errors: BTreeMap<ReplicationGroupId, BTreeMap<StreamId, StreamReplicationErrors>>,
    /// The cluster config, once loaded.
    pub cluster_config: Option<Arc<ClusterConfigInfo>>,
}

impl XreplMaps {
    /// Claims `consumer` for `group`. Fails if another group replicates into
    /// the table or is setting it up. Claims of failed groups are released by
    /// [`XreplMaps::release_consumer_tables`].
    pub fn claim_consumer_table(&mut self, consumer: &TableId, group: &ReplicationGroupId) -> Result<()> {
        match self.xcluster_consumer_tables.get(consumer) {
            Some(owner) if owner != group => Err(MasterError::IllegalState(format!(
                "consumer table {consumer} already receives replication group {owner}"
            ))),
            Some(_) => Ok(()),
            None => {
                self.xcluster_consumer_tables
                    .insert(consumer.clone(), group.clone());
                Ok(())
            }
        }
    }

    /// Drops every consumer table claim held by `group`.
    pub fn release_consumer_tables(&mut self, group: &ReplicationGroupId) {
        self.xcluster_consumer_tables.retain(|_, owner| owner != group);
    }

    /// Allocates an id for a new stream and marks it in use.
    pub fn generate_stream_id(&mut self) -> StreamId {
        while let Some(id) = self.recovered_stream_ids.pop() {
            if self.in_use_stream_ids.insert(id) {
                return id;
            }
        }
        loop {
            let id = StreamId::generate();
            if self.in_use_stream_ids.insert(id) {
                return id;
            }
        }
    }

    /// Returns an id to the pool. Only call once every row and the persisted
    /// record of the stream are gone.
    pub fn recover_stream_id(&mut self, id: StreamId) {
        if self.in_use_stream_ids.remove(&id) {
            self.recovered_stream_ids.push(id);
        }
    }

    /// Adds a stream and indexes its committed metadata.
    pub fn insert_stream(&mut self, stream: Arc<CdcStreamInfo>) {
        let id = *stream.id();
        self.in_use_stream_ids.insert(id);
        self.index_stream(id, &stream.read());
        self.cdc_stream_map.insert(id, stream);
    }

    /// Removes a stream from the primary map and every reverse index. The id
    /// stays reserved.
    pub fn remove_stream(&mut self, id: &StreamId) -> Option<Arc<CdcStreamInfo>> {
        self.unindex_stream(id);
        self.cdc_stream_map.remove(id)
    }

    /// Rebuilds the reverse index entries of a stream from its committed metadata.
    pub fn reindex_stream(&mut self, id: &StreamId) {
        self.unindex_stream(id);
        if let Some(stream) = self.cdc_stream_map.get(id).cloned() {
            self.index_stream(*id, &stream.read());
        }
    }

    fn index_stream(&mut self, id: StreamId, entry: &SysCdcStreamEntry) {
        let index = if entry.is_cdcsdk() {
            &mut self.cdcsdk_tables_to_stream
        } else {
            &mut self.xcluster_tables_to_stream
        };
        for table in &entry.table_ids {
            index.entry(table.clone()).or_default().insert(id);
        }
        let released = matches!(
            entry.state,
            SysCdcStreamState::Deleting | SysCdcStreamState::Deleted
        );
        if let Some(slot) = entry.slot_name() {
            if !released {
                self.replication_slot_to_stream.insert(slot.to_string(), id);
            }
        }
    }

    fn unindex_stream(&mut self, id: &StreamId) {
        for index in [
            &mut self.cdcsdk_tables_to_stream,
            &mut self.xcluster_tables_to_stream,
        ] {
            index.retain(|_, streams| {
                streams.remove(id);
                !streams.is_empty()
            });
        }
        self.replication_slot_to_stream.retain(|_, s| s != id);
    }

    /// Looks up a stream by replication slot name.
    pub fn find_stream_by_slot(&self, slot_name: &str) -> Option<Arc<CdcStreamInfo>> {
        self.replication_slot_to_stream
            .get(slot_name)
            .and_then(|id| self.cdc_stream_map.get(id))
            .cloned()
    }

    /// Live streams, xCluster and CDCSDK, covering a table.
    pub fn streams_for_table(&self, table_id: &TableId) -> Vec<Arc<CdcStreamInfo>> {
        let mut ids: BTreeSet<StreamId> = BTreeSet::new();
        if let Some(s) = self.xcluster_tables_to_stream.get(table_id) {
            ids.extend(s.iter().copied());
        }
        if let Some(s) = self.cdcsdk_tables_to_stream.get(table_id) {
            ids.extend(s.iter().copied());
        }
        ids.iter()
            .filter_map(|id| self.cdc_stream_map.get(id))
            .filter(|s| !s.read().is_deleting())
            .cloned()
            .collect()
    }

    /// Live CDCSDK streams of a namespace.
    pub fn cdcsdk_streams_for_namespace(&self, namespace_id: &NamespaceId) -> Vec<Arc<CdcStreamInfo>> {
        self.cdc_stream_map
            .values()
            .filter(|s| {
                let meta = s.read();
                !meta.is_deleting() && meta.namespace_id.as_ref() == Some(namespace_id)
            })
            .cloned()
            .collect()
    }

    /// Number of live streams carrying a slot name.
    pub fn slot_count(&self) -> usize {
        self.replication_slot_to_stream.len()
    }

    /// Streams whose committed state is `state`.
    pub fn streams_in_state(&self, state: SysCdcStreamState) -> Vec<Arc<CdcStreamInfo>> {
        self.cdc_stream_map
            .values()
            .filter(|s| s.read().state == state)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::CatalogEntity;

    fn cdcsdk_stream(maps: &mut XreplMaps, ns: &str, tables: &[&str], slot: Option<&str>) -> StreamId {
        let id = maps.generate_stream_id();
        let mut entry = SysCdcStreamEntry::new(SysCdcStreamState::Active);
        entry.namespace_id = Some(NamespaceId::new(ns));
        entry.table_ids = tables.iter().map(|t| TableId::new(*t)).collect();
        entry.cdcsdk_ysql_replication_slot_name = slot.map(String::from);
        maps.insert_stream(CatalogEntity::new(id, entry));
        id
    }

    #[test]
    fn test_consumer_table_claims() {
        let mut maps = XreplMaps::default();
        let (t, g, h) = (TableId::new("t"), ReplicationGroupId::new("g"), ReplicationGroupId::new("h"));
        maps.claim_consumer_table(&t, &g).unwrap();
        maps.claim_consumer_table(&t, &g).unwrap();
        assert!(matches!(
            maps.claim_consumer_table(&t, &h),
            Err(MasterError::IllegalState(_))
        ));
        assert_eq!(maps.xcluster_consumer_tables[&t], g);

        maps.release_consumer_tables(&h);
        assert_eq!(maps.xcluster_consumer_tables[&t], g);
        maps.release_consumer_tables(&g);
        assert!(maps.xcluster_consumer_tables.is_empty());
        maps.claim_consumer_table(&t, &h).unwrap();
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let mut maps = XreplMaps::default();
        let ids: BTreeSet<StreamId> = (0..200).map(|_| maps.generate_stream_id()).collect();
        assert_eq!(ids.len(), 200);
        assert_eq!(maps.in_use_stream_ids.len(), 200);
    }

    #[test]
    fn test_recovered_id_is_reused_once() {
        let mut maps = XreplMaps::default();
        let id = maps.generate_stream_id();
        maps.recover_stream_id(id);
        assert!(!maps.in_use_stream_ids.contains(&id));
        assert_eq!(maps.generate_stream_id(), id);
        assert_ne!(maps.generate_stream_id(), id);
    }

    #[test]
    fn test_insert_and_remove_indexes() {
        let mut maps = XreplMaps::default();
        let id = cdcsdk_stream(&mut maps, "ns", &["t1", "t2"], Some("slot_a"));
        assert_eq!(maps.streams_for_table(&TableId::new("t1")).len(), 1);
        assert_eq!(maps.find_stream_by_slot("slot_a").map(|s| *s.id()), Some(id));
        assert_eq!(maps.slot_count(), 1);
        maps.remove_stream(&id);
        assert!(maps.cdcsdk_tables_to_stream.is_empty());
        assert!(maps.replication_slot_to_stream.is_empty());
        assert!(maps.in_use_stream_ids.contains(&id));
    }

    #[test]
    fn test_namespace_lookup_skips_other_namespaces() {
        let mut maps = XreplMaps::default();
        cdcsdk_stream(&mut maps, "ns1", &["t1"], None);
        cdcsdk_stream(&mut maps, "ns2", &["t2"], None);
        assert_eq!(
            maps.cdcsdk_streams_for_namespace(&NamespaceId::new("ns1"))
                .len(),
            1
        );
    }
}
