//! Periodic cleanup and reconciliation run by the leader.
//!
//! Each cycle finishes deletions left behind by foreground calls, clears one
//! failed replication group and one failed bootstrap, releases hidden split
//! parents nobody needs any more, and runs the dynamic table passes. A failing
//! step is logged and retried on the next cycle; it never stops the others.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cdc_state::{entries_for_stream, CdcStateTableEntry, CdcStateTableEntrySelector, CdcStateTableKey};
use crate::dynamic_tables::DynamicTableStats;
use crate::error::Result;
use crate::manager::XreplCatalogManager;
use crate::metadata::{CdcStreamInfo, SysCdcStreamEntry, SysCdcStreamState};
use crate::sys_catalog::SysCatalogWriter;
use crate::types::{OpId, StreamId, TableId, TabletId};

/// What one background cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackgroundTaskStats {
    /// Streams whose dropped tables were cleaned up.
    pub metadata_cleaned: usize,
    /// Streams removed for good.
    pub streams_deleted: usize,
    /// Failed replication groups cleared.
    pub universes_cleared: usize,
    /// Failed bootstraps cleared.
    pub bootstraps_cleared: usize,
    /// Hidden split parents released.
    pub tablets_released: usize,
    /// Dynamic table passes.
    pub dynamic: DynamicTableStats,
    /// Steps that failed and will be retried.
    pub failed_steps: usize,
}

fn open_checkpoint(row: &CdcStateTableEntry) -> bool {
    !row.checkpoint.is_some_and(|op| op.is_max())
}

impl XreplCatalogManager {
    /// Runs one cycle. Does nothing unless leader.
    pub async fn run_background_tasks(&self) -> BackgroundTaskStats {
        let mut stats = BackgroundTaskStats::default();
        if !self.is_leader() {
            return stats;
        }

        match self.cleanup_streams_marked_deleting_metadata().await {
            Ok(n) => stats.metadata_cleaned = n,
            Err(e) => {
                warn!(error = %e, "cleanup of streams with dropped tables failed");
                stats.failed_steps += 1;
            }
        }
        match self.cleanup_deleted_streams().await {
            Ok(n) => stats.streams_deleted = n,
            Err(e) => {
                warn!(error = %e, "cleanup of deleted streams failed");
                stats.failed_steps += 1;
            }
        }
        match self.clear_failed_universe().await {
            Ok(cleared) => stats.universes_cleared = usize::from(cleared),
            Err(e) => {
                warn!(error = %e, "clearing failed replication group failed");
                stats.failed_steps += 1;
            }
        }
        match self.clear_failed_bootstrap().await {
            Ok(cleared) => stats.bootstraps_cleared = usize::from(cleared),
            Err(e) => {
                warn!(error = %e, "clearing failed bootstrap failed");
                stats.failed_steps += 1;
            }
        }
        match self.release_hidden_tablets().await {
            Ok(n) => stats.tablets_released = n,
            Err(e) => {
                warn!(error = %e, "releasing hidden tablets failed");
                stats.failed_steps += 1;
            }
        }
        match self.run_dynamic_table_passes().await {
            Ok(dynamic) => stats.dynamic = dynamic,
            Err(e) => {
                warn!(error = %e, "dynamic table pass failed");
                stats.failed_steps += 1;
            }
        }
        stats
    }

    /// Moves streams covering dropped tables into cleanup. CDCSDK streams go to
    /// `DeletingMetadata`; xCluster streams left without a running table go to
    /// `Deleting`.
    pub async fn on_tables_deleted(&self, table_ids: &[TableId]) -> Result<usize> {
        let mut affected: BTreeMap<StreamId, Arc<CdcStreamInfo>> = BTreeMap::new();
        {
            let maps = self.maps.read();
            for table_id in table_ids {
                for stream in maps.streams_for_table(table_id) {
                    affected.insert(*stream.id(), stream);
                }
                if let Some(group) = maps.xcluster_consumer_tables.get(table_id) {
                    debug!(table_id = %table_id, replication_group_id = %group, "dropped table is an xCluster target");
                }
            }
        }
        if affected.is_empty() {
            return Ok(0);
        }

        let dropped = |t: &TableId| {
            table_ids.contains(t) || self.tables().get_table(t).map_or(true, |t| !t.is_running())
        };
        let mut handles = Vec::new();
        let mut writer = SysCatalogWriter::new();
        for (id, stream) in &affected {
            let mut l = stream.lock_for_write().await;
            let next = if l.data().is_cdcsdk() {
                (l.data().state == SysCdcStreamState::Active)
                    .then_some(SysCdcStreamState::DeletingMetadata)
            } else {
                l.data()
                    .table_ids
                    .iter()
                    .all(|t| dropped(t))
                    .then_some(SysCdcStreamState::Deleting)
            };
            let Some(next) = next else {
                continue;
            };
            l.mutable().set_state(next);
            writer.upsert(&id.to_string(), l.data())?;
            handles.push((*id, l));
        }
        if handles.is_empty() {
            return Ok(0);
        }
        self.persist(writer).await?;
        let marked = handles.len();
        let mut ids = Vec::with_capacity(marked);
        for (id, l) in handles {
            info!(stream_id = %id, state = l.data().state.as_str(), "stream covers a dropped table");
            l.commit();
            ids.push(id);
        }
        let mut maps = self.maps.write();
        for id in &ids {
            maps.reindex_stream(id);
        }
        Ok(marked)
    }

    /// Deletes state rows of dropped tables and returns the streams to
    /// `Active`, or to `Deleting` for xCluster streams with no table left.
    pub async fn cleanup_streams_marked_deleting_metadata(&self) -> Result<usize> {
        let streams = self
            .maps
            .read()
            .streams_in_state(SysCdcStreamState::DeletingMetadata);
        let mut cleaned = 0;
        for stream in streams {
            let stream_id = *stream.id();
            let meta = stream.read();
            let dropped: Vec<TableId> = meta
                .table_ids
                .iter()
                .filter(|t| self.tables().get_table(t).map_or(true, |t| !t.is_running()))
                .cloned()
                .collect();
            let remaining: BTreeSet<&TableId> =
                meta.table_ids.iter().filter(|t| !dropped.contains(t)).collect();

            let mut keys: BTreeSet<TabletId> = BTreeSet::new();
            for table_id in &dropped {
                let tablets = match self.tables().get_tablets(table_id) {
                    Ok(tablets) => tablets,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };
                for tablet in tablets {
                    if !tablet.hosted_table_ids.iter().any(|t| remaining.contains(t)) {
                        keys.insert(tablet.id);
                    }
                }
            }
            let rows = keys.len();
            self.cdc_state()
                .delete_entries(
                    keys.into_iter()
                        .map(|tablet| CdcStateTableKey::new(tablet, stream_id))
                        .collect(),
                )
                .await?;

            let mut l = stream.lock_for_write().await;
            if l.data().state != SysCdcStreamState::DeletingMetadata {
                debug!(stream_id = %stream_id, state = l.data().state.as_str(), "stream left DELETING_METADATA, skipping");
                continue;
            }
            let entry = l.mutable();
            entry.table_ids.retain(|t| !dropped.contains(t));
            entry.unqualified_table_ids.retain(|t| !dropped.contains(t));
            for table_id in &dropped {
                entry.replica_identity_map.remove(table_id);
            }
            let next = if entry.is_xcluster() && entry.table_ids.is_empty() {
                SysCdcStreamState::Deleting
            } else {
                SysCdcStreamState::Active
            };
            entry.set_state(next);
            let mut writer = SysCatalogWriter::new();
            writer.upsert(&stream_id.to_string(), l.data())?;
            self.persist(writer).await?;
            l.commit();
            self.maps.write().reindex_stream(&stream_id);
            info!(
                stream_id = %stream_id,
                dropped_tables = dropped.len(),
                rows,
                state = next.as_str(),
                "cleaned up metadata of dropped tables"
            );
            cleaned += 1;
        }
        Ok(cleaned)
    }

    /// Finishes deletion of `Deleting` streams. CDCSDK rows are first closed
    /// with `OpId::MAX` so pollers see the end of the stream; they and the
    /// record are removed on a later cycle.
    pub async fn cleanup_deleted_streams(&self) -> Result<usize> {
        let streams = self.maps.read().streams_in_state(SysCdcStreamState::Deleting);
        let mut deleted = 0;
        for stream in streams {
            let stream_id = *stream.id();
            let rows = entries_for_stream(
                self.cdc_state().as_ref(),
                stream_id,
                CdcStateTableEntrySelector::default().include_checkpoint(),
            )
            .await?;

            if stream.read().is_cdcsdk() {
                let open: Vec<CdcStateTableEntry> = rows
                    .iter()
                    .filter(|r| !r.key.is_slot_entry() && open_checkpoint(r))
                    .map(|r| {
                        CdcStateTableEntry::with_checkpoint(
                            r.key.tablet_id.clone(),
                            stream_id,
                            OpId::MAX,
                        )
                    })
                    .collect();
                if !open.is_empty() {
                    debug!(stream_id = %stream_id, rows = open.len(), "closing rows of deleted stream");
                    self.cdc_state().update_entries(open).await?;
                    continue;
                }
            }

            self.cdc_state()
                .delete_entries(rows.into_iter().map(|r| r.key).collect())
                .await?;
            let mut l = stream.lock_for_write().await;
            l.mutable().set_state(SysCdcStreamState::Deleted);
            let mut writer = SysCatalogWriter::new();
            writer.delete::<SysCdcStreamEntry>(&stream_id.to_string());
            self.persist(writer).await?;
            l.commit();
            {
                let mut maps = self.maps.write();
                maps.remove_stream(&stream_id);
                maps.recover_stream_id(stream_id);
            }
            info!(stream_id = %stream_id, "deleted CDC stream");
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Releases hidden split parents once every CDCSDK stream covering the
    /// table either no longer needs the parent or reads from both children.
    pub async fn release_hidden_tablets(&self) -> Result<usize> {
        let retained: Vec<_> = self
            .maps
            .read()
            .retained_by_cdcsdk
            .iter()
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect();
        let mut released = 0;
        for (tablet_id, info) in retained {
            let streams: Vec<Arc<CdcStreamInfo>> = self
                .maps
                .read()
                .cdc_stream_map
                .values()
                .filter(|s| {
                    let meta = s.read();
                    meta.is_cdcsdk() && meta.covers(&info.table_id)
                })
                .cloned()
                .collect();

            let mut releasable = true;
            for stream in &streams {
                if !self
                    .parent_released_by(&tablet_id, &info.split_children, stream)
                    .await?
                {
                    releasable = false;
                    break;
                }
            }
            if !releasable {
                continue;
            }
            self.tables().delete_hidden_tablet(&tablet_id).await?;
            self.maps.write().retained_by_cdcsdk.remove(&tablet_id);
            info!(tablet_id = %tablet_id, "released hidden split parent");
            released += 1;
        }
        Ok(released)
    }

    async fn parent_released_by(
        &self,
        parent: &TabletId,
        children: &[TabletId],
        stream: &Arc<CdcStreamInfo>,
    ) -> Result<bool> {
        let stream_id = *stream.id();
        if stream.read().state != SysCdcStreamState::Active {
            return Ok(true);
        }
        let parent_row = self
            .cdc_state()
            .try_fetch_entry(
                &CdcStateTableKey::new(parent.clone(), stream_id),
                CdcStateTableEntrySelector::default().include_checkpoint(),
            )
            .await?;
        if parent_row.map_or(true, |r| !open_checkpoint(&r)) {
            return Ok(true);
        }
        // A child counts as polled once a replication time was recorded on it
        // after the split.
        let child_selector = CdcStateTableEntrySelector::default().include_last_replication_time();
        for child in children {
            let row = self
                .cdc_state()
                .try_fetch_entry(&CdcStateTableKey::new(child.clone(), stream_id), child_selector.clone())
                .await?;
            let polled = row.is_some_and(|r| r.last_replication_time.is_some());
            if !polled {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Runs [`XreplCatalogManager::run_background_tasks`] every
/// `bg_task_interval` until `shutdown` flips to true or its sender is dropped.
pub fn spawn_background_loop(
    manager: Arc<XreplCatalogManager>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(manager.config().bg_task_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = manager.run_background_tasks().await;
                    if stats != BackgroundTaskStats::default() {
                        debug!(?stats, "background cycle complete");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("xrepl background loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryTableCatalog, TableCatalog};
    use crate::cdc_state::{CdcStateTable, MemoryCdcStateTable};
    use crate::config::MasterConfig;
    use crate::manager::XreplCollaborators;
    use crate::metadata::CatalogEntity;
    use crate::producer::MemoryProducerFactory;
    use crate::rpc::DeleteCdcStreamRequest;
    use crate::sys_catalog::{MemorySysCatalog, SysEntryType};
    use crate::types::{LeaderTerm, NamespaceId};
    use std::time::Duration;

    struct Fixture {
        manager: Arc<XreplCatalogManager>,
        tables: Arc<MemoryTableCatalog>,
        cdc_state: Arc<MemoryCdcStateTable>,
        sys_catalog: Arc<MemorySysCatalog>,
        ns: NamespaceId,
    }

    async fn fixture() -> Fixture {
        let tables = Arc::new(MemoryTableCatalog::new("c"));
        let cdc_state = Arc::new(MemoryCdcStateTable::new());
        let sys_catalog = Arc::new(MemorySysCatalog::new());
        let ns = tables.create_namespace("db");
        let manager = XreplCatalogManager::new(
            MasterConfig {
                cdcsdk_enable_dynamic_table_addition: false,
                ..MasterConfig::default()
            },
            XreplCollaborators {
                sys_catalog: sys_catalog.clone(),
                cdc_state: cdc_state.clone(),
                tables: tables.clone(),
                snapshots: tables.clone(),
                producers: Arc::new(MemoryProducerFactory::new()),
            },
        );
        manager.become_leader(LeaderTerm::new(1)).await.unwrap();
        Fixture {
            manager,
            tables,
            cdc_state,
            sys_catalog,
            ns,
        }
    }

    async fn add_stream(f: &Fixture, cdcsdk: bool, tables: &[TableId], state: SysCdcStreamState) -> StreamId {
        let id = f.manager.maps.write().generate_stream_id();
        let mut entry = SysCdcStreamEntry::new(state);
        if cdcsdk {
            entry.namespace_id = Some(f.ns.clone());
        }
        entry.table_ids = tables.to_vec();
        entry.backfill_default_options();
        let mut writer = SysCatalogWriter::new();
        writer.upsert(&id.to_string(), &entry).unwrap();
        f.manager.persist(writer).await.unwrap();

        let mut rows = Vec::new();
        for table in tables {
            for tablet in f.tables.get_tablets(table).unwrap() {
                rows.push(CdcStateTableEntry::with_checkpoint(tablet.id, id, OpId::new(1, 1)));
            }
        }
        f.cdc_state.upsert_entries(rows).await.unwrap();
        f.manager.maps.write().insert_stream(CatalogEntity::new(id, entry));
        id
    }

    fn state_of(f: &Fixture, id: &StreamId) -> SysCdcStreamState {
        f.manager.stream(id).unwrap().read().state
    }

    #[tokio::test]
    async fn test_cdcsdk_delete_takes_two_cycles() {
        let f = fixture().await;
        let t = f.tables.create_table(&f.ns, "t", 2);
        let id = add_stream(&f, true, &[t], SysCdcStreamState::Deleting).await;

        assert_eq!(f.manager.cleanup_deleted_streams().await.unwrap(), 0);
        let rows = f.cdc_state.rows_for_stream(id);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.checkpoint == Some(OpId::MAX)));

        assert_eq!(f.manager.cleanup_deleted_streams().await.unwrap(), 1);
        assert!(f.cdc_state.rows_for_stream(id).is_empty());
        assert!(f.manager.stream(&id).is_none());
        assert!(!f.sys_catalog.contains(SysEntryType::CdcStream, &id.to_string()));
        assert_eq!(f.manager.maps.read().recovered_stream_ids, vec![id]);
    }

    #[tokio::test]
    async fn test_xcluster_delete_is_immediate() {
        let f = fixture().await;
        let t = f.tables.create_table(&f.ns, "t", 2);
        let id = add_stream(&f, false, &[t], SysCdcStreamState::Deleting).await;
        assert_eq!(f.manager.cleanup_deleted_streams().await.unwrap(), 1);
        assert!(f.cdc_state.is_empty());
        assert!(f.manager.stream(&id).is_none());
    }

    #[tokio::test]
    async fn test_failed_record_delete_keeps_stream() {
        let f = fixture().await;
        let t = f.tables.create_table(&f.ns, "t", 1);
        let id = add_stream(&f, false, &[t], SysCdcStreamState::Deleting).await;
        f.sys_catalog.fail_next_writes(1);
        assert!(f.manager.cleanup_deleted_streams().await.is_err());
        assert_eq!(state_of(&f, &id), SysCdcStreamState::Deleting);
        assert!(f.manager.maps.read().in_use_stream_ids.contains(&id));
        assert_eq!(f.manager.cleanup_deleted_streams().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_table_metadata_cleanup() {
        let f = fixture().await;
        let keep = f.tables.create_table(&f.ns, "keep", 1);
        let gone = f.tables.create_table(&f.ns, "gone", 2);
        let id = add_stream(&f, true, &[keep.clone(), gone.clone()], SysCdcStreamState::Active).await;

        f.tables.drop_table(&gone).unwrap();
        assert_eq!(f.manager.on_tables_deleted(&[gone.clone()]).await.unwrap(), 1);
        assert_eq!(state_of(&f, &id), SysCdcStreamState::DeletingMetadata);

        assert_eq!(f.manager.cleanup_streams_marked_deleting_metadata().await.unwrap(), 1);
        let meta = f.manager.stream(&id).unwrap().read();
        assert_eq!(meta.state, SysCdcStreamState::Active);
        assert_eq!(meta.table_ids, vec![keep]);
        assert_eq!(f.cdc_state.rows_for_stream(id).len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_cleanup_keeps_concurrent_delete() {
        let f = fixture().await;
        let keep = f.tables.create_table(&f.ns, "keep", 1);
        let gone = f.tables.create_table(&f.ns, "gone", 1);
        let id = add_stream(&f, true, &[keep, gone.clone()], SysCdcStreamState::Active).await;
        f.tables.drop_table(&gone).unwrap();
        f.manager.on_tables_deleted(&[gone]).await.unwrap();
        assert_eq!(state_of(&f, &id), SysCdcStreamState::DeletingMetadata);

        // Queue the user delete ahead of the cleanup on the stream's lock.
        let stream = f.manager.stream(&id).unwrap();
        let held = stream.lock_for_write().await;
        let manager = f.manager.clone();
        let delete = tokio::spawn(async move {
            manager
                .delete_cdc_stream(&DeleteCdcStreamRequest {
                    stream_ids: vec![id],
                    ..Default::default()
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let manager = f.manager.clone();
        let cleanup = tokio::spawn(async move { manager.cleanup_streams_marked_deleting_metadata().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        delete.await.unwrap().unwrap();
        assert_eq!(cleanup.await.unwrap().unwrap(), 0);
        assert_eq!(state_of(&f, &id), SysCdcStreamState::Deleting);
    }

    #[tokio::test]
    async fn test_xcluster_stream_without_tables_goes_deleting() {
        let f = fixture().await;
        let t = f.tables.create_table(&f.ns, "t", 1);
        let id = add_stream(&f, false, &[t.clone()], SysCdcStreamState::Active).await;
        f.tables.drop_table(&t).unwrap();
        f.manager.on_tables_deleted(&[t]).await.unwrap();
        assert_eq!(state_of(&f, &id), SysCdcStreamState::Deleting);

        let stats = f.manager.run_background_tasks().await;
        assert_eq!(stats.streams_deleted, 1);
        assert_eq!(stats.failed_steps, 0);
    }

    #[tokio::test]
    async fn test_hidden_parent_released_after_children_polled() {
        let f = fixture().await;
        let t = f.tables.create_table(&f.ns, "t", 1);
        let id = add_stream(&f, true, &[t.clone()], SysCdcStreamState::Active).await;
        let parent = f.tables.get_tablets(&t).unwrap()[0].id.clone();
        let (a, b) = f.tables.split_tablet(&parent).unwrap();
        let children = [a.clone(), b.clone()];
        f.manager
            .update_cdc_state_on_tablet_split(&t, &parent, &children)
            .await
            .unwrap();

        assert_eq!(f.manager.release_hidden_tablets().await.unwrap(), 0);

        // A moved checkpoint alone is not a poll.
        f.cdc_state
            .upsert_entries(vec![CdcStateTableEntry::with_checkpoint(a.clone(), id, OpId::new(1, 7))])
            .await
            .unwrap();
        assert_eq!(f.manager.release_hidden_tablets().await.unwrap(), 0);

        let mut polled_a = CdcStateTableEntry::new(CdcStateTableKey::new(a, id));
        polled_a.last_replication_time = Some(10);
        f.cdc_state.upsert_entries(vec![polled_a]).await.unwrap();
        assert_eq!(f.manager.release_hidden_tablets().await.unwrap(), 0);
        let mut polled_b = CdcStateTableEntry::new(CdcStateTableKey::new(b, id));
        polled_b.last_replication_time = Some(11);
        f.cdc_state.upsert_entries(vec![polled_b]).await.unwrap();
        assert_eq!(f.manager.release_hidden_tablets().await.unwrap(), 1);
        assert!(f.tables.get_tablet(&parent).is_none());
        assert!(f.manager.maps.read().retained_by_cdcsdk.is_empty());
    }

    #[tokio::test]
    async fn test_follower_does_nothing() {
        let f = fixture().await;
        let t = f.tables.create_table(&f.ns, "t", 1);
        add_stream(&f, false, &[t], SysCdcStreamState::Deleting).await;
        f.manager.step_down();
        assert_eq!(f.manager.run_background_tasks().await, BackgroundTaskStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_shutdown() {
        let f = fixture().await;
        let t = f.tables.create_table(&f.ns, "t", 1);
        let id = add_stream(&f, false, &[t], SysCdcStreamState::Deleting).await;
        let (tx, rx) = watch::channel(false);
        let handle = spawn_background_loop(f.manager.clone(), rx);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(f.manager.stream(&id).is_none());
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
