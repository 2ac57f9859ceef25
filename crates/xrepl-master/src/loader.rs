//! Rebuilds the in-memory maps from the sys catalog.
//!
//! Each record type has a visitor that sees every persisted row exactly once.
//! Rows that reference dropped tables or namespaces are skipped with a
//! warning; read or decode failures abort the whole load.

use tracing::{debug, info, warn};

use crate::catalog::TableCatalog;
use crate::config::MasterConfig;
use crate::dynamic_tables::check_table_eligibility;
use crate::error::Result;
use crate::manager::XreplCatalogManager;
use crate::maps::{HiddenTabletInfo, XreplMaps};
use crate::metadata::{
    CatalogEntity, SysCdcStreamEntry, SysClusterConfigEntry, SysUniverseReplicationBootstrapEntry,
    SysUniverseReplicationEntry,
};
use crate::sys_catalog::{visit, SysCatalogEntry};
use crate::types::{ReplicationGroupId, StreamId};

/// Counters reported after a load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Streams loaded.
    pub streams: usize,
    /// Streams skipped because their table or namespace is gone.
    pub skipped_streams: usize,
    /// Replication groups loaded.
    pub universes: usize,
    /// Bootstrap pipelines loaded.
    pub bootstraps: usize,
    /// Tables queued for addition to CDCSDK streams.
    pub unprocessed_tables: usize,
    /// Hidden tablets retained for CDCSDK.
    pub retained_tablets: usize,
}

trait Visitor<T: SysCatalogEntry> {
    fn visit(&mut self, id: &str, entry: T) -> Result<()>;
}

struct Loader<'a> {
    tables: &'a dyn TableCatalog,
    config: &'a MasterConfig,
    maps: XreplMaps,
    stats: LoadStats,
}

impl Visitor<SysCdcStreamEntry> for Loader<'_> {
    fn visit(&mut self, id: &str, mut entry: SysCdcStreamEntry) -> Result<()> {
        let stream_id: StreamId = id.parse()?;

        if !entry.is_deleting() {
            let missing = match &entry.namespace_id {
                Some(ns) => self.tables.get_namespace(ns).is_none(),
                None => entry
                    .table_ids
                    .first()
                    .and_then(|t| self.tables.get_table(t))
                    .map_or(true, |t| !t.is_running()),
            };
            if missing {
                warn!(
                    stream_id = %stream_id,
                    "skipping CDC stream whose table or namespace no longer exists"
                );
                self.stats.skipped_streams += 1;
                return Ok(());
            }
        }

        if entry.backfill_default_options() {
            debug!(stream_id = %stream_id, "backfilled default stream options");
        }

        if entry.is_cdcsdk() && !entry.is_deleting() {
            self.index_cdcsdk_tables(&entry);
        }

        self.maps.insert_stream(CatalogEntity::new(stream_id, entry));
        self.stats.streams += 1;
        Ok(())
    }
}

impl Loader<'_> {
    fn index_cdcsdk_tables(&mut self, entry: &SysCdcStreamEntry) {
        let Some(ns) = entry.namespace_id.clone() else {
            return;
        };

        if self.config.cdcsdk_enable_dynamic_table_addition
            && !entry.cdcsdk_disable_dynamic_table_addition
        {
            for table in self.tables.list_tables(&ns) {
                if check_table_eligibility(&table, self.config).is_err() {
                    continue;
                }
                if entry.table_ids.contains(&table.id)
                    || entry.unqualified_table_ids.contains(&table.id)
                {
                    continue;
                }
                let inserted = self
                    .maps
                    .namespace_to_cdcsdk_unprocessed_tables
                    .entry(ns.clone())
                    .or_default()
                    .insert(table.id);
                if inserted {
                    self.stats.unprocessed_tables += 1;
                }
            }
        }

        if !entry.has_slot() {
            for table_id in &entry.table_ids {
                let Some(table) = self.tables.get_table(table_id) else {
                    continue;
                };
                if table.is_running() && check_table_eligibility(&table, self.config).is_err() {
                    self.maps
                        .namespace_to_cdcsdk_non_eligible_tables
                        .entry(ns.clone())
                        .or_default()
                        .insert(table_id.clone());
                }
            }
        }
    }

    fn index_retained_tablets(&mut self) {
        for tablet in self.tables.hidden_tablets() {
            let covered = tablet.hosted_table_ids.iter().any(|t| {
                self.maps
                    .cdcsdk_tables_to_stream
                    .get(t)
                    .is_some_and(|streams| !streams.is_empty())
            });
            if covered {
                self.maps.retained_by_cdcsdk.insert(
                    tablet.id.clone(),
                    HiddenTabletInfo {
                        table_id: tablet.table_id.clone(),
                        split_children: tablet.split_children.clone(),
                    },
                );
                self.stats.retained_tablets += 1;
            }
        }
    }
}

impl Visitor<SysUniverseReplicationEntry> for Loader<'_> {
    fn visit(&mut self, id: &str, entry: SysUniverseReplicationEntry) -> Result<()> {
        let group = ReplicationGroupId::new(id);
        if !entry.is_deleted_or_failed() {
            for consumer_table in entry.validated_tables.values() {
                self.maps
                    .xcluster_consumer_tables
                    .insert(consumer_table.clone(), group.clone());
            }
        }
        self.maps
            .universe_replication_map
            .insert(group.clone(), CatalogEntity::new(group, entry));
        self.stats.universes += 1;
        Ok(())
    }
}

impl Visitor<SysUniverseReplicationBootstrapEntry> for Loader<'_> {
    fn visit(&mut self, id: &str, entry: SysUniverseReplicationBootstrapEntry) -> Result<()> {
        let group = ReplicationGroupId::new(id);
        self.maps
            .universe_bootstrap_map
            .insert(group.clone(), CatalogEntity::new(group, entry));
        self.stats.bootstraps += 1;
        Ok(())
    }
}

impl Visitor<SysClusterConfigEntry> for Loader<'_> {
    fn visit(&mut self, id: &str, entry: SysClusterConfigEntry) -> Result<()> {
        self.maps.cluster_config = Some(CatalogEntity::new(id.to_string(), entry));
        Ok(())
    }
}

fn apply<T: SysCatalogEntry, V: Visitor<T>>(visitor: &mut V, rows: Vec<(String, T)>) -> Result<()> {
    for (id, entry) in rows {
        visitor.visit(&id, entry)?;
    }
    Ok(())
}

impl XreplCatalogManager {
    /// Replaces every map with the persisted state.
    pub(crate) async fn load_all(&self) -> Result<LoadStats> {
        let catalog = self.sys_catalog().as_ref();
        let streams = visit::<SysCdcStreamEntry>(catalog).await?;
        let universes = visit::<SysUniverseReplicationEntry>(catalog).await?;
        let bootstraps = visit::<SysUniverseReplicationBootstrapEntry>(catalog).await?;
        let configs = visit::<SysClusterConfigEntry>(catalog).await?;

        let mut loader = Loader {
            tables: self.tables().as_ref(),
            config: self.config(),
            maps: XreplMaps::default(),
            stats: LoadStats::default(),
        };
        apply(&mut loader, streams)?;
        loader.index_retained_tablets();
        apply(&mut loader, universes)?;
        apply(&mut loader, bootstraps)?;
        apply(&mut loader, configs)?;

        let Loader { maps, stats, .. } = loader;
        *self.maps.write() = maps;
        info!(
            streams = stats.streams,
            skipped = stats.skipped_streams,
            universes = stats.universes,
            bootstraps = stats.bootstraps,
            "loaded xrepl metadata"
        );
        Ok(stats)
    }
}
