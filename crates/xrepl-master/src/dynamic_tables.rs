//! Dynamic table reconciliation for CDCSDK streams.
//!
//! Namespace streams track every eligible table of their namespace. Tables
//! created after the stream are found by [`XreplCatalogManager::find_missing_tables`]
//! and absorbed by [`XreplCatalogManager::process_new_tables`]; tables a user
//! asked to remove, or that turn out not to be eligible, are taken out of the
//! qualified list and their state rows are closed with `OpId::MAX`. Each pass
//! handles at most `cdcsdk_table_processing_limit_per_run` tables.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{RelationType, TableCatalog, TableInfo, TableType};
use crate::cdc_state::{CdcStateTableEntry, CdcStateTableEntrySelector, CdcStateTableKey};
use crate::config::MasterConfig;
use crate::error::Result;
use crate::manager::XreplCatalogManager;
use crate::metadata::{CdcStreamInfo, SysCdcStreamEntry};
use crate::sys_catalog::SysCatalogWriter;
use crate::types::{NamespaceId, OpId, TableId, TabletId};

/// Why a table cannot be part of a CDCSDK stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Ineligibility {
    /// Dropped or hidden.
    #[error("table is not running")]
    NotRunning,
    /// Relies on the synthetic row id.
    #[error("table has no user primary key")]
    NoPrimaryKey,
    /// Synthetic parent of a colocation group.
    #[error("table is a colocation parent")]
    ColocationParent,
    /// Secondary index.
    #[error("table is an index")]
    Index,
    /// Materialized view.
    #[error("table is a materialized view")]
    MaterializedView,
    /// Catalog or transaction status table.
    #[error("table is a system table")]
    System,
}

/// Decides whether a table may be streamed by a CDCSDK stream.
pub fn check_table_eligibility(
    table: &TableInfo,
    config: &MasterConfig,
) -> std::result::Result<(), Ineligibility> {
    if !table.is_running() {
        return Err(Ineligibility::NotRunning);
    }
    if table.is_colocation_parent {
        return Err(Ineligibility::ColocationParent);
    }
    if !table.has_user_primary_key {
        return Err(Ineligibility::NoPrimaryKey);
    }
    if !config.cdcsdk_enable_indexes_in_stream {
        match table.relation_type {
            RelationType::Index => return Err(Ineligibility::Index),
            RelationType::MaterializedView => return Err(Ineligibility::MaterializedView),
            RelationType::System => return Err(Ineligibility::System),
            _ if table.table_type == TableType::TransactionStatus => {
                return Err(Ineligibility::System);
            }
            _ => {}
        }
    }
    Ok(())
}

/// Running tables of a namespace that CDCSDK streams may cover.
pub fn eligible_tables(
    catalog: &dyn TableCatalog,
    namespace_id: &NamespaceId,
    config: &MasterConfig,
) -> Vec<TableInfo> {
    catalog
        .list_tables(namespace_id)
        .into_iter()
        .filter(|t| check_table_eligibility(t, config).is_ok())
        .collect()
}

/// Counters of one reconciliation round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicTableStats {
    /// Tables newly queued as unprocessed.
    pub found: usize,
    /// Tables added to every stream needing them.
    pub added: usize,
    /// User-requested removals completed.
    pub removed: usize,
    /// Non-eligible tables taken out of streams.
    pub reclassified: usize,
}

fn accepts_new_tables(entry: &SysCdcStreamEntry) -> bool {
    !entry.is_deleting() && !entry.cdcsdk_disable_dynamic_table_addition
}

fn knows_table(entry: &SysCdcStreamEntry, table_id: &TableId) -> bool {
    entry.table_ids.contains(table_id) || entry.unqualified_table_ids.contains(table_id)
}

impl XreplCatalogManager {
    /// Queues eligible tables some stream of their namespace does not know yet
    /// and indexes ineligible tables found in non-slot streams. Returns the
    /// number of newly queued tables.
    pub async fn find_missing_tables(&self) -> Result<usize> {
        let limit = self.config().cdcsdk_table_processing_limit_per_run;
        let mut by_namespace: BTreeMap<NamespaceId, Vec<Arc<SysCdcStreamEntry>>> = BTreeMap::new();
        for stream in self.maps.read().cdc_stream_map.values() {
            let meta = stream.read();
            if meta.is_deleting() || !meta.is_cdcsdk() {
                continue;
            }
            if let Some(ns) = meta.namespace_id.clone() {
                by_namespace.entry(ns).or_default().push(meta);
            }
        }

        let mut missing: BTreeMap<NamespaceId, BTreeSet<TableId>> = BTreeMap::new();
        let mut non_eligible: BTreeMap<NamespaceId, BTreeSet<TableId>> = BTreeMap::new();
        let mut found = 0;
        for (ns, streams) in &by_namespace {
            if self.config().cdcsdk_enable_dynamic_table_addition {
                for table in eligible_tables(self.tables().as_ref(), ns, self.config()) {
                    if found >= limit {
                        break;
                    }
                    let needed = streams
                        .iter()
                        .any(|s| accepts_new_tables(s) && !knows_table(s, &table.id));
                    if needed && missing.entry(ns.clone()).or_default().insert(table.id) {
                        found += 1;
                    }
                }
            }

            for stream in streams.iter().filter(|s| !s.has_slot()) {
                for table_id in &stream.table_ids {
                    let Some(table) = self.tables().get_table(table_id) else {
                        continue;
                    };
                    if table.is_running() && check_table_eligibility(&table, self.config()).is_err() {
                        non_eligible
                            .entry(ns.clone())
                            .or_default()
                            .insert(table_id.clone());
                    }
                }
            }
        }

        let mut maps = self.maps.write();
        let mut queued = 0;
        for (ns, tables) in missing {
            let set = maps
                .namespace_to_cdcsdk_unprocessed_tables
                .entry(ns)
                .or_default();
            for table in tables {
                if set.insert(table) {
                    queued += 1;
                }
            }
        }
        for (ns, tables) in non_eligible {
            maps.namespace_to_cdcsdk_non_eligible_tables
                .entry(ns)
                .or_default()
                .extend(tables);
        }
        if queued > 0 {
            debug!(queued, "queued new tables for CDCSDK streams");
        }
        Ok(queued)
    }

    /// Adds queued tables to every stream of their namespace that needs them.
    /// Returns the number of tables fully absorbed.
    pub async fn process_new_tables(&self) -> Result<usize> {
        let limit = self.config().cdcsdk_table_processing_limit_per_run;
        let queued: Vec<(NamespaceId, TableId)> = self
            .maps
            .read()
            .namespace_to_cdcsdk_unprocessed_tables
            .iter()
            .flat_map(|(ns, tables)| tables.iter().map(move |t| (ns.clone(), t.clone())))
            .take(limit)
            .collect();

        let mut absorbed = 0;
        for (ns, table_id) in queued {
            let table = self
                .tables()
                .get_table(&table_id)
                .filter(|t| check_table_eligibility(t, self.config()).is_ok());
            let Some(table) = table else {
                debug!(table_id = %table_id, "dropping unprocessed table that is no longer eligible");
                self.unqueue_table(&ns, &table_id);
                continue;
            };

            let streams = self.maps.read().cdcsdk_streams_for_namespace(&ns);
            let mut pending = false;
            for stream in streams {
                let meta = stream.read();
                if !accepts_new_tables(&meta) || knows_table(&meta, &table_id) {
                    continue;
                }
                if let Err(e) = self.add_table_to_stream(&stream, &table).await {
                    warn!(
                        stream_id = %stream.id(),
                        table_id = %table_id,
                        error = %e,
                        "failed to add table to CDCSDK stream"
                    );
                    pending = true;
                }
            }
            if !pending {
                self.unqueue_table(&ns, &table_id);
                absorbed += 1;
            }
        }
        Ok(absorbed)
    }

    fn unqueue_table(&self, namespace_id: &NamespaceId, table_id: &TableId) {
        let mut maps = self.maps.write();
        if let Some(set) = maps.namespace_to_cdcsdk_unprocessed_tables.get_mut(namespace_id) {
            set.remove(table_id);
            if set.is_empty() {
                maps.namespace_to_cdcsdk_unprocessed_tables.remove(namespace_id);
            }
        }
    }

    async fn add_table_to_stream(&self, stream: &Arc<CdcStreamInfo>, table: &TableInfo) -> Result<()> {
        let stream_id = *stream.id();
        if !stream.read().has_slot() {
            self.tables()
                .set_wal_retention(&table.id, self.config().cdc_wal_retention_secs)
                .await?;
            let mut rows = Vec::new();
            for tablet in self.tables().get_tablets(&table.id)? {
                let key = CdcStateTableKey::new(tablet.id.clone(), stream_id);
                let existing = self
                    .cdc_state()
                    .try_fetch_entry(&key, CdcStateTableEntrySelector::default())
                    .await?;
                if existing.is_none() {
                    rows.push(CdcStateTableEntry::with_checkpoint(tablet.id, stream_id, OpId::INVALID));
                }
            }
            self.cdc_state().upsert_entries(rows).await?;
        }

        let mut l = stream.lock_for_write().await;
        if l.data().is_deleting() || knows_table(l.data(), &table.id) {
            return Ok(());
        }
        let has_slot = l.data().has_slot();
        let entry = l.mutable();
        entry.table_ids.push(table.id.clone());
        if has_slot {
            entry.replica_identity_map.insert(
                table.id.clone(),
                table
                    .replica_identity
                    .unwrap_or(self.config().default_replica_identity),
            );
        }
        let mut writer = SysCatalogWriter::new();
        writer.upsert(&stream_id.to_string(), l.data())?;
        self.persist(writer).await?;
        l.commit();
        self.maps.write().reindex_stream(&stream_id);
        info!(stream_id = %stream_id, table_id = %table.id, "added table to CDCSDK stream");
        Ok(())
    }

    /// Completes user-requested removals staged in the unqualified lists.
    /// Returns the number of tables removed.
    pub async fn process_unqualified_tables(&self) -> Result<usize> {
        let limit = self.config().cdcsdk_table_processing_limit_per_run;
        let candidates: Vec<(Arc<CdcStreamInfo>, Vec<TableId>)> = self
            .maps
            .read()
            .cdc_stream_map
            .values()
            .filter_map(|s| {
                let meta = s.read();
                if meta.is_deleting() || !meta.is_cdcsdk() {
                    return None;
                }
                let staged: Vec<TableId> = meta
                    .unqualified_table_ids
                    .iter()
                    .filter(|t| meta.table_ids.contains(t))
                    .cloned()
                    .collect();
                (!staged.is_empty()).then(|| (s.clone(), staged))
            })
            .collect();

        let mut removed = 0;
        for (stream, staged) in candidates {
            if removed >= limit {
                break;
            }
            let batch: Vec<TableId> = staged.into_iter().take(limit - removed).collect();
            match self.remove_tables_from_stream(&stream, &batch).await {
                Ok(n) => removed += n,
                Err(e) => warn!(
                    stream_id = %stream.id(),
                    error = %e,
                    "failed to remove unqualified tables from CDCSDK stream"
                ),
            }
        }
        Ok(removed)
    }

    /// Takes ineligible tables out of non-slot streams and clears them from
    /// the index. Returns the number of tables reclassified.
    pub async fn process_non_eligible_tables(&self) -> Result<usize> {
        let limit = self.config().cdcsdk_table_processing_limit_per_run;
        let indexed: Vec<(NamespaceId, TableId)> = self
            .maps
            .read()
            .namespace_to_cdcsdk_non_eligible_tables
            .iter()
            .flat_map(|(ns, tables)| tables.iter().map(move |t| (ns.clone(), t.clone())))
            .take(limit)
            .collect();

        let mut reclassified = 0;
        for (ns, table_id) in indexed {
            let streams = self.maps.read().cdcsdk_streams_for_namespace(&ns);
            let mut pending = false;
            for stream in streams {
                let meta = stream.read();
                if meta.has_slot() || !meta.covers(&table_id) {
                    continue;
                }
                if let Err(e) = self
                    .remove_tables_from_stream(&stream, std::slice::from_ref(&table_id))
                    .await
                {
                    warn!(
                        stream_id = %stream.id(),
                        table_id = %table_id,
                        error = %e,
                        "failed to remove non-eligible table from CDCSDK stream"
                    );
                    pending = true;
                }
            }
            if !pending {
                let mut maps = self.maps.write();
                if let Some(set) = maps.namespace_to_cdcsdk_non_eligible_tables.get_mut(&ns) {
                    set.remove(&table_id);
                    if set.is_empty() {
                        maps.namespace_to_cdcsdk_non_eligible_tables.remove(&ns);
                    }
                }
                reclassified += 1;
            }
        }
        Ok(reclassified)
    }

    /// Closes the state rows of `tables` and drops them from the qualified
    /// list. Unqualified entries are kept so the tables are not re-added.
    pub(crate) async fn remove_tables_from_stream(
        &self,
        stream: &Arc<CdcStreamInfo>,
        tables: &[TableId],
    ) -> Result<usize> {
        let stream_id = *stream.id();
        let remaining: BTreeSet<TableId> = stream
            .read()
            .table_ids
            .iter()
            .filter(|t| !tables.contains(t))
            .cloned()
            .collect();

        let mut tablets: BTreeSet<TabletId> = BTreeSet::new();
        for table_id in tables {
            let hosted = match self.tables().get_tablets(table_id) {
                Ok(hosted) => hosted,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            for tablet in hosted {
                let shared = tablet.hosted_table_ids.iter().any(|t| remaining.contains(t));
                if !shared {
                    tablets.insert(tablet.id);
                }
            }
        }
        let rows = tablets
            .into_iter()
            .map(|tablet| CdcStateTableEntry::with_checkpoint(tablet, stream_id, OpId::MAX))
            .collect();
        self.cdc_state().update_entries(rows).await?;

        let mut l = stream.lock_for_write().await;
        let before = l.data().table_ids.len();
        let entry = l.mutable();
        entry.table_ids.retain(|t| !tables.contains(t));
        for table_id in tables {
            entry.replica_identity_map.remove(table_id);
        }
        let removed = before - l.data().table_ids.len();
        if removed == 0 {
            return Ok(0);
        }
        let mut writer = SysCatalogWriter::new();
        writer.upsert(&stream_id.to_string(), l.data())?;
        self.persist(writer).await?;
        l.commit();
        self.maps.write().reindex_stream(&stream_id);
        info!(stream_id = %stream_id, removed, "removed tables from CDCSDK stream");
        Ok(removed)
    }

    /// Runs every reconciliation pass once.
    pub async fn run_dynamic_table_passes(&self) -> Result<DynamicTableStats> {
        Ok(DynamicTableStats {
            found: self.find_missing_tables().await?,
            added: self.process_new_tables().await?,
            removed: self.process_unqualified_tables().await?,
            reclassified: self.process_non_eligible_tables().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryTableCatalog, TableSpec};
    use crate::cdc_state::{CdcStateTable, MemoryCdcStateTable};
    use crate::manager::XreplCollaborators;
    use crate::metadata::{CatalogEntity, SysCdcStreamState};
    use crate::producer::MemoryProducerFactory;
    use crate::sys_catalog::MemorySysCatalog;
    use crate::types::{LeaderTerm, PgReplicaIdentity, StreamId};

    struct Fixture {
        manager: Arc<XreplCatalogManager>,
        tables: Arc<MemoryTableCatalog>,
        cdc_state: Arc<MemoryCdcStateTable>,
        ns: NamespaceId,
    }

    async fn fixture(config: MasterConfig) -> Fixture {
        let tables = Arc::new(MemoryTableCatalog::new("c"));
        let cdc_state = Arc::new(MemoryCdcStateTable::new());
        let ns = tables.create_namespace("db");
        let manager = XreplCatalogManager::new(
            config,
            XreplCollaborators {
                sys_catalog: Arc::new(MemorySysCatalog::new()),
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
            ns,
        }
    }

    fn add_stream(f: &Fixture, tables: &[TableId], slot: Option<&str>) -> StreamId {
        let mut maps = f.manager.maps.write();
        let id = maps.generate_stream_id();
        let mut entry = SysCdcStreamEntry::new(SysCdcStreamState::Active);
        entry.namespace_id = Some(f.ns.clone());
        entry.table_ids = tables.to_vec();
        entry.cdcsdk_ysql_replication_slot_name = slot.map(String::from);
        maps.insert_stream(CatalogEntity::new(id, entry));
        id
    }

    fn table(f: &Fixture, id: &TableId) -> TableInfo {
        f.tables.get_table(id).unwrap()
    }

    #[test]
    fn test_eligibility_rules() {
        let catalog = MemoryTableCatalog::new("e");
        let ns = catalog.create_namespace("db");
        let config = MasterConfig::default();

        let user = catalog.create_table(&ns, "t", 1);
        assert!(check_table_eligibility(&catalog.get_table(&user).unwrap(), &config).is_ok());

        let mut spec = TableSpec::user("nopk", 1);
        spec.has_user_primary_key = false;
        let nopk = catalog.create_table_with(&ns, spec);
        assert_eq!(
            check_table_eligibility(&catalog.get_table(&nopk).unwrap(), &config),
            Err(Ineligibility::NoPrimaryKey)
        );

        let mut spec = TableSpec::user("idx", 1);
        spec.relation_type = RelationType::Index;
        let idx = catalog.create_table_with(&ns, spec);
        let idx = catalog.get_table(&idx).unwrap();
        assert_eq!(check_table_eligibility(&idx, &config), Err(Ineligibility::Index));
        let permissive = MasterConfig {
            cdcsdk_enable_indexes_in_stream: true,
            ..MasterConfig::default()
        };
        assert!(check_table_eligibility(&idx, &permissive).is_ok());

        let mut spec = TableSpec::user("mv", 1);
        spec.relation_type = RelationType::MaterializedView;
        let mv = catalog.create_table_with(&ns, spec);
        let mv = catalog.get_table(&mv).unwrap();
        assert_eq!(check_table_eligibility(&mv, &config), Err(Ineligibility::MaterializedView));
        assert!(check_table_eligibility(&mv, &permissive).is_ok());

        // A missing primary key wins over every relation kind.
        let mut spec = TableSpec::user("idx_nopk", 1);
        spec.relation_type = RelationType::Index;
        spec.has_user_primary_key = false;
        let idx_nopk = catalog.create_table_with(&ns, spec);
        let idx_nopk = catalog.get_table(&idx_nopk).unwrap();
        assert_eq!(check_table_eligibility(&idx_nopk, &config), Err(Ineligibility::NoPrimaryKey));
        assert_eq!(
            check_table_eligibility(&idx_nopk, &permissive),
            Err(Ineligibility::NoPrimaryKey)
        );

        let parent = catalog.create_colocation_parent(&ns, "tg");
        assert_eq!(
            check_table_eligibility(&catalog.get_table(&parent).unwrap(), &config),
            Err(Ineligibility::ColocationParent)
        );

        catalog.drop_table(&user).unwrap();
        assert_eq!(
            check_table_eligibility(&catalog.get_table(&user).unwrap(), &config),
            Err(Ineligibility::NotRunning)
        );
    }

    #[tokio::test]
    async fn test_new_table_reaches_fixpoint() {
        let f = fixture(MasterConfig::default()).await;
        let t1 = f.tables.create_table(&f.ns, "t1", 2);
        let stream_id = add_stream(&f, &[t1.clone()], None);

        let t2 = f.tables.create_table(&f.ns, "t2", 3);
        let stats = f.manager.run_dynamic_table_passes().await.unwrap();
        assert_eq!(stats.found, 1);
        assert_eq!(stats.added, 1);

        let meta = f.manager.stream(&stream_id).unwrap().read();
        assert_eq!(meta.table_ids, vec![t1, t2.clone()]);
        assert_eq!(f.cdc_state.rows_for_stream(stream_id).len(), 3);
        assert_eq!(
            f.tables.wal_retention(&t2),
            Some(f.manager.config().cdc_wal_retention_secs)
        );
        assert!(f
            .manager
            .maps
            .read()
            .namespace_to_cdcsdk_unprocessed_tables
            .is_empty());

        let again = f.manager.run_dynamic_table_passes().await.unwrap();
        assert_eq!(again, DynamicTableStats::default());
    }

    #[tokio::test]
    async fn test_slot_stream_skips_rows_and_records_identity() {
        let f = fixture(MasterConfig::default()).await;
        let stream_id = add_stream(&f, &[], Some("slot_a"));
        let t = f.tables.create_table(&f.ns, "t", 2);
        f.manager.run_dynamic_table_passes().await.unwrap();

        let meta = f.manager.stream(&stream_id).unwrap().read();
        assert!(meta.covers(&t));
        assert_eq!(meta.replica_identity_map.get(&t), Some(&PgReplicaIdentity::Change));
        assert!(f.cdc_state.rows_for_stream(stream_id).is_empty());
        assert_eq!(f.tables.wal_retention(&t), None);
    }

    #[tokio::test]
    async fn test_limit_bounds_each_pass() {
        let f = fixture(MasterConfig {
            cdcsdk_table_processing_limit_per_run: 1,
            ..MasterConfig::default()
        })
        .await;
        let stream_id = add_stream(&f, &[], None);
        f.tables.create_table(&f.ns, "a", 1);
        f.tables.create_table(&f.ns, "b", 1);

        f.manager.run_dynamic_table_passes().await.unwrap();
        assert_eq!(f.manager.stream(&stream_id).unwrap().read().table_ids.len(), 1);
        f.manager.run_dynamic_table_passes().await.unwrap();
        assert_eq!(f.manager.stream(&stream_id).unwrap().read().table_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_stream_is_not_extended() {
        let f = fixture(MasterConfig::default()).await;
        let stream_id = add_stream(&f, &[], None);
        {
            let stream = f.manager.stream(&stream_id).unwrap();
            let mut l = stream.lock_for_write().await;
            l.mutable().cdcsdk_disable_dynamic_table_addition = true;
            l.commit();
        }
        f.tables.create_table(&f.ns, "t", 1);
        let stats = f.manager.run_dynamic_table_passes().await.unwrap();
        assert_eq!(stats.found, 0);
        assert!(f.manager.stream(&stream_id).unwrap().read().table_ids.is_empty());
    }

    #[tokio::test]
    async fn test_failed_addition_keeps_table_queued() {
        let f = fixture(MasterConfig::default()).await;
        add_stream(&f, &[], None);
        let t = f.tables.create_table(&f.ns, "t", 1);
        f.tables.fail_operation(crate::catalog::ops::SET_WAL_RETENTION);
        f.manager.run_dynamic_table_passes().await.unwrap();
        assert!(f
            .manager
            .maps
            .read()
            .namespace_to_cdcsdk_unprocessed_tables
            .get(&f.ns)
            .is_some_and(|s| s.contains(&t)));

        f.tables.clear_failures();
        let stats = f.manager.run_dynamic_table_passes().await.unwrap();
        assert_eq!(stats.added, 1);
    }

    #[tokio::test]
    async fn test_unqualified_table_is_closed() {
        let f = fixture(MasterConfig::default()).await;
        let t1 = f.tables.create_table(&f.ns, "t1", 1);
        let t2 = f.tables.create_table(&f.ns, "t2", 2);
        let stream_id = add_stream(&f, &[t1.clone(), t2.clone()], None);
        for tablet in f.tables.get_tablets(&t2).unwrap() {
            f.cdc_state
                .insert_entries(vec![CdcStateTableEntry::with_checkpoint(
                    tablet.id,
                    stream_id,
                    OpId::new(1, 5),
                )])
                .await
                .unwrap();
        }
        {
            let stream = f.manager.stream(&stream_id).unwrap();
            let mut l = stream.lock_for_write().await;
            l.mutable().unqualified_table_ids.push(t2.clone());
            l.commit();
        }

        let removed = f.manager.process_unqualified_tables().await.unwrap();
        assert_eq!(removed, 1);
        let meta = f.manager.stream(&stream_id).unwrap().read();
        assert_eq!(meta.table_ids, vec![t1]);
        assert_eq!(meta.unqualified_table_ids, vec![t2.clone()]);
        for row in f.cdc_state.rows_for_stream(stream_id) {
            assert_eq!(row.checkpoint, Some(OpId::MAX));
        }
        assert!(f.manager.maps.read().streams_for_table(&t2).is_empty());

        assert_eq!(f.manager.find_missing_tables().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_eligible_table_removed_from_legacy_stream_only() {
        let f = fixture(MasterConfig::default()).await;
        let mut spec = TableSpec::user("idx", 1);
        spec.relation_type = RelationType::Index;
        let idx = f.tables.create_table_with(&f.ns, spec);
        let legacy = add_stream(&f, &[idx.clone()], None);
        let slot = add_stream(&f, &[idx.clone()], Some("slot_b"));
        assert!(check_table_eligibility(&table(&f, &idx), f.manager.config()).is_err());

        f.manager.find_missing_tables().await.unwrap();
        let reclassified = f.manager.process_non_eligible_tables().await.unwrap();
        assert_eq!(reclassified, 1);
        assert!(f.manager.stream(&legacy).unwrap().read().table_ids.is_empty());
        assert_eq!(f.manager.stream(&slot).unwrap().read().table_ids, vec![idx]);
        assert!(f
            .manager
            .maps
            .read()
            .namespace_to_cdcsdk_non_eligible_tables
            .is_empty());
    }
}
