//! Changes to a running replication group.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{MasterError, Result};
use crate::manager::XreplCatalogManager;
use crate::metadata::{
    CatalogEntity, SysUniverseReplicationEntry, SysUniverseReplicationState, UniverseReplicationInfo,
};
use crate::rpc::{AlterUniverseReplicationRequest, SetupUniverseReplicationRequest};
use crate::sys_catalog::SysCatalogWriter;
use crate::types::{NamespaceId, ReplicationGroupId, StreamId, TableId};

use super::{alter_replication_group_id, is_alter_replication_group_id, required_group_id};

impl XreplCatalogManager {
    /// Applies exactly one change to an active replication group: new producer
    /// addresses, removal of a namespace or of tables, addition of tables, or
    /// a new group id. Adding tables runs asynchronously through the shadow
    /// group and is polled with `is_setup_universe_replication_done` on the
    /// shadow id.
    pub async fn alter_universe_replication(
        self: &Arc<Self>,
        req: &AlterUniverseReplicationRequest,
    ) -> Result<()> {
        self.leader_term()?;
        let group = required_group_id(&req.replication_group_id)?;
        let changes = [
            !req.producer_master_addresses.is_empty(),
            req.producer_namespace_id_to_remove.is_some(),
            !req.producer_table_ids_to_remove.is_empty(),
            !req.producer_table_ids_to_add.is_empty(),
            req.new_replication_group_id.is_some(),
        ]
        .iter()
        .filter(|c| **c)
        .count();
        if changes != 1 {
            return Err(MasterError::InvalidArgument(format!(
                "exactly one alteration per request is supported, got {changes}"
            )));
        }
        if !req.producer_bootstrap_ids_to_add.is_empty()
            && req.producer_bootstrap_ids_to_add.len() != req.producer_table_ids_to_add.len()
        {
            return Err(MasterError::InvalidArgument(
                "bootstrap ids must match the tables being added".into(),
            ));
        }

        let universe = self.universe_or_not_found(group)?;
        let state = universe.read().state;
        if state != SysUniverseReplicationState::Active {
            return Err(MasterError::IllegalState(format!(
                "replication group {group} is {state:?}, not active"
            )));
        }

        if !req.producer_master_addresses.is_empty() {
            self.alter_producer_addresses(&universe, &req.producer_master_addresses)
                .await
        } else if let Some(namespace_id) = &req.producer_namespace_id_to_remove {
            self.remove_namespace_from_universe(&universe, namespace_id)
                .await
        } else if !req.producer_table_ids_to_remove.is_empty() {
            self.remove_tables_from_universe(&universe, &req.producer_table_ids_to_remove, None)
                .await
        } else if !req.producer_table_ids_to_add.is_empty() {
            self.add_tables_to_universe(
                &universe,
                &req.producer_table_ids_to_add,
                &req.producer_bootstrap_ids_to_add,
            )
            .await
        } else if let Some(new_id) = &req.new_replication_group_id {
            self.rename_universe(&universe, new_id).await
        } else {
            Err(MasterError::Internal("unhandled alteration".into()))
        }
    }

    async fn alter_producer_addresses(
        &self,
        universe: &Arc<UniverseReplicationInfo>,
        addresses: &[String],
    ) -> Result<()> {
        let group = universe.id();
        if let Some(addr) = addresses
            .iter()
            .find(|a| self.config().master_addresses.contains(a))
        {
            return Err(MasterError::InvalidArgument(format!(
                "producer master address {addr} belongs to this cluster"
            )));
        }
        let config = self.cluster_config();
        let mut ul = universe.lock_for_write().await;
        let mut cl = config.lock_for_write().await;
        ul.mutable().producer_master_addresses = addresses.to_vec();
        if let Some(entry) = cl.mutable().consumer_registry.producer_map.get_mut(group) {
            entry.master_addrs = addresses.to_vec();
        }
        cl.mutable().version += 1;

        let mut writer = SysCatalogWriter::new();
        writer.upsert(group.as_str(), ul.data())?;
        writer.upsert(config.id(), cl.data())?;
        self.persist(writer).await?;
        ul.commit();
        cl.commit();
        info!(replication_group_id = %group, addresses = ?addresses, "updated producer master addresses");
        Ok(())
    }

    async fn remove_namespace_from_universe(
        &self,
        universe: &Arc<UniverseReplicationInfo>,
        namespace_id: &NamespaceId,
    ) -> Result<()> {
        let group = universe.id();
        let meta = universe.read();
        let Some(info) = &meta.db_scoped_info else {
            return Err(MasterError::InvalidArgument(format!(
                "replication group {group} is not namespace scoped"
            )));
        };
        if !info
            .namespace_infos
            .iter()
            .any(|p| &p.producer_namespace_id == namespace_id)
        {
            return Err(MasterError::NotFound(format!(
                "producer namespace {namespace_id} in replication group {group}"
            )));
        }
        let client = self
            .producers()
            .connect(group, &meta.producer_master_addresses)?;
        let in_namespace: BTreeSet<TableId> = client
            .list_namespace_tables(namespace_id)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let tables: Vec<TableId> = meta
            .tables
            .iter()
            .filter(|t| in_namespace.contains(*t))
            .cloned()
            .collect();
        self.remove_tables_from_universe(universe, &tables, Some(namespace_id))
            .await
    }

    /// Drops tables from the group and the registry in one write, then
    /// deletes their producer streams best-effort.
    async fn remove_tables_from_universe(
        &self,
        universe: &Arc<UniverseReplicationInfo>,
        tables: &[TableId],
        namespace_id: Option<&NamespaceId>,
    ) -> Result<()> {
        let group = universe.id();
        let meta = universe.read();
        if let Some(missing) = tables.iter().find(|t| !meta.tables.contains(t)) {
            return Err(MasterError::InvalidArgument(format!(
                "table {missing} is not part of replication group {group}"
            )));
        }
        let remaining = meta.tables.iter().filter(|t| !tables.contains(t)).count();
        if remaining == 0 && !meta.is_db_scoped() {
            return Err(MasterError::InvalidArgument(format!(
                "cannot remove every table of replication group {group}; delete it instead"
            )));
        }
        let streams: Vec<StreamId> = tables
            .iter()
            .filter_map(|t| meta.table_streams.get(t).copied())
            .collect();
        let consumers: Vec<TableId> = tables
            .iter()
            .filter_map(|t| meta.validated_tables.get(t).cloned())
            .collect();

        let config = self.cluster_config();
        let mut ul = universe.lock_for_write().await;
        let mut cl = config.lock_for_write().await;
        let entry = ul.mutable();
        entry.tables.retain(|t| !tables.contains(t));
        for table in tables {
            entry.table_streams.remove(table);
            entry.validated_tables.remove(table);
            entry.schema_version_mappings.remove(table);
            entry.colocated_schema_version_mappings.remove(table);
            entry.producer_bootstrap_ids.remove(table);
        }
        if let (Some(namespace_id), Some(info)) = (namespace_id, entry.db_scoped_info.as_mut()) {
            info.namespace_infos
                .retain(|p| &p.producer_namespace_id != namespace_id);
        }
        if let Some(producer) = cl.mutable().consumer_registry.producer_map.get_mut(group) {
            producer.stream_map.retain(|id, _| !streams.contains(id));
        }
        cl.mutable().version += 1;

        let mut writer = SysCatalogWriter::new();
        writer.upsert(group.as_str(), ul.data())?;
        writer.upsert(config.id(), cl.data())?;
        self.persist(writer).await?;
        ul.commit();
        cl.commit();
        {
            let mut maps = self.maps.write();
            for consumer in &consumers {
                maps.xcluster_consumer_tables.remove(consumer);
            }
            if let Some(errors) = maps.replication_errors.get_mut(group) {
                errors.retain(|id, _| !streams.contains(id));
            }
        }
        info!(replication_group_id = %group, tables = tables.len(), "removed tables from replication group");

        if !streams.is_empty() {
            let deleted = match self
                .producers()
                .connect(group, &meta.producer_master_addresses)
            {
                Ok(client) => client.delete_cdc_streams(&streams).await,
                Err(e) => Err(e),
            };
            if let Err(e) = deleted {
                warn!(replication_group_id = %group, error = %e, "failed to delete producer streams of removed tables");
            }
        }
        Ok(())
    }

    async fn add_tables_to_universe(
        self: &Arc<Self>,
        universe: &Arc<UniverseReplicationInfo>,
        tables: &[TableId],
        bootstrap_ids: &[StreamId],
    ) -> Result<()> {
        let group = universe.id();
        let meta = universe.read();
        if let Some(present) = tables.iter().find(|t| meta.tables.contains(t)) {
            return Err(MasterError::InvalidArgument(format!(
                "table {present} is already part of replication group {group}"
            )));
        }
        let shadow = alter_replication_group_id(group);
        if self.universe(&shadow).is_some() {
            return Err(MasterError::AlreadyPresent(format!(
                "tables are already being added to replication group {group}"
            )));
        }
        info!(replication_group_id = %group, tables = tables.len(), "adding tables to replication group");
        self.setup_universe_replication_internal(
            &SetupUniverseReplicationRequest {
                replication_group_id: Some(shadow),
                producer_master_addresses: meta.producer_master_addresses.clone(),
                producer_table_ids: tables.to_vec(),
                producer_bootstrap_ids: bootstrap_ids.to_vec(),
                producer_namespaces: Vec::new(),
                transactional: meta.transactional,
            },
            true,
        )
        .await
    }

    async fn rename_universe(
        &self,
        universe: &Arc<UniverseReplicationInfo>,
        new_id: &ReplicationGroupId,
    ) -> Result<()> {
        let old_id = universe.id().clone();
        if new_id.is_empty() || is_alter_replication_group_id(new_id) || *new_id == old_id {
            return Err(MasterError::InvalidArgument(format!(
                "invalid new replication group id {new_id}"
            )));
        }
        if self.universe(new_id).is_some() {
            return Err(MasterError::AlreadyPresent(format!("replication group {new_id}")));
        }
        if self.universe(&alter_replication_group_id(&old_id)).is_some() {
            return Err(MasterError::IllegalState(format!(
                "replication group {old_id} has an alteration in progress"
            )));
        }

        let config = self.cluster_config();
        let mut ul = universe.lock_for_write().await;
        let mut cl = config.lock_for_write().await;
        let renamed = ul.data().clone();
        let registry = &mut cl.mutable().consumer_registry;
        if let Some(entry) = registry.producer_map.remove(&old_id) {
            registry.producer_map.insert(new_id.clone(), entry);
        }
        cl.mutable().version += 1;
        ul.mutable().state = SysUniverseReplicationState::Deleted;

        let mut writer = SysCatalogWriter::new();
        writer.delete::<SysUniverseReplicationEntry>(old_id.as_str());
        writer.upsert(new_id.as_str(), &renamed)?;
        writer.upsert(config.id(), cl.data())?;
        self.persist(writer).await?;
        ul.commit();
        cl.commit();

        let mut maps = self.maps.write();
        maps.universe_replication_map.remove(&old_id);
        maps.universe_replication_map
            .insert(new_id.clone(), CatalogEntity::new(new_id.clone(), renamed));
        for owner in maps.xcluster_consumer_tables.values_mut() {
            if *owner == old_id {
                *owner = new_id.clone();
            }
        }
        if let Some(errors) = maps.replication_errors.remove(&old_id) {
            maps.replication_errors.insert(new_id.clone(), errors);
        }
        info!(replication_group_id = %old_id, new_replication_group_id = %new_id, "renamed replication group");
        Ok(())
    }

    /// Folds a completed shadow group into its original: tables, streams and
    /// registry entries move over, the shadow record is deleted, all in one
    /// write.
    pub(crate) async fn merge_universe_replication(
        &self,
        original_id: &ReplicationGroupId,
        shadow_id: &ReplicationGroupId,
    ) -> Result<()> {
        let original = self.universe_or_not_found(original_id)?;
        let shadow = self.universe_or_not_found(shadow_id)?;
        let config = self.cluster_config();

        let mut ol = original.lock_for_write().await;
        let mut cl = config.lock_for_write().await;
        let mut sl = shadow.lock_for_write().await;
        if ol.data().state != SysUniverseReplicationState::Active {
            return Err(MasterError::IllegalState(format!(
                "replication group {original_id} is {:?}, cannot merge {shadow_id}",
                ol.data().state
            )));
        }

        let added = sl.data().clone();
        let o = ol.mutable();
        for table in &added.tables {
            if !o.tables.contains(table) {
                o.tables.push(table.clone());
            }
        }
        o.table_streams.extend(added.table_streams.clone());
        o.validated_tables.extend(added.validated_tables.clone());
        o.schema_version_mappings
            .extend(added.schema_version_mappings.clone());
        o.colocated_schema_version_mappings
            .extend(added.colocated_schema_version_mappings.clone());
        o.producer_bootstrap_ids
            .extend(added.producer_bootstrap_ids.clone());

        let registry = &mut cl.mutable().consumer_registry;
        if let Some(shadow_entry) = registry.producer_map.remove(shadow_id) {
            let target = registry.producer_map.get_mut(original_id).ok_or_else(|| {
                MasterError::IllegalState(format!(
                    "replication group {original_id} missing from consumer registry"
                ))
            })?;
            target.stream_map.extend(shadow_entry.stream_map);
        }
        cl.mutable().version += 1;
        sl.mutable().state = SysUniverseReplicationState::Deleted;

        let mut writer = SysCatalogWriter::new();
        writer.upsert(original_id.as_str(), ol.data())?;
        writer.upsert(config.id(), cl.data())?;
        writer.delete::<SysUniverseReplicationEntry>(shadow_id.as_str());
        self.persist(writer).await?;
        ol.commit();
        cl.commit();
        sl.commit();

        let mut maps = self.maps.write();
        maps.universe_replication_map.remove(shadow_id);
        for owner in maps.xcluster_consumer_tables.values_mut() {
            if owner == shadow_id {
                *owner = original_id.clone();
            }
        }
        if let Some(errors) = maps.replication_errors.remove(shadow_id) {
            maps.replication_errors
                .entry(original_id.clone())
                .or_default()
                .extend(errors);
        }
        info!(
            replication_group_id = %original_id,
            shadow = %shadow_id,
            tables = added.tables.len(),
            "merged added tables into replication group"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::producer::ops;
    use crate::rpc::NamespaceIdentifier;
    use crate::sys_catalog::SysEntryType;
    use crate::universe::testing::{fixture, Fixture, PRODUCER_ADDR};

    fn alter(group: &str) -> AlterUniverseReplicationRequest {
        AlterUniverseReplicationRequest {
            replication_group_id: Some(ReplicationGroupId::new(group)),
            ..Default::default()
        }
    }

    fn group_meta(f: &Fixture, group: &str) -> Arc<SysUniverseReplicationEntry> {
        f.manager
            .universe(&ReplicationGroupId::new(group))
            .unwrap()
            .read()
    }

    #[tokio::test]
    async fn test_exactly_one_change() {
        let f = fixture(MasterConfig::default()).await;
        let (p, _) = f.table_pair("a", 1, 1);
        f.active_group("g", vec![p.clone()]).await;

        let req = alter("g");
        assert!(matches!(
            f.manager.alter_universe_replication(&req).await,
            Err(MasterError::InvalidArgument(_))
        ));
        let mut req = alter("g");
        req.producer_master_addresses = vec!["x:1".into()];
        req.new_replication_group_id = Some(ReplicationGroupId::new("h"));
        assert!(matches!(
            f.manager.alter_universe_replication(&req).await,
            Err(MasterError::InvalidArgument(_))
        ));
        let mut req = alter("missing");
        req.producer_table_ids_to_remove = vec![p];
        assert!(f.manager.alter_universe_replication(&req).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_change_producer_addresses() {
        let f = fixture(MasterConfig::default()).await;
        let (p, _) = f.table_pair("a", 1, 1);
        f.active_group("g", vec![p]).await;
        let before = f.manager.cluster_config().read().version;

        let mut req = alter("g");
        req.producer_master_addresses = vec!["p2:7100".into(), PRODUCER_ADDR.into()];
        f.manager.alter_universe_replication(&req).await.unwrap();

        assert_eq!(group_meta(&f, "g").producer_master_addresses.len(), 2);
        let config = f.manager.cluster_config().read();
        assert_eq!(config.version, before + 1);
        assert_eq!(
            config.consumer_registry.producer_map[&ReplicationGroupId::new("g")].master_addrs,
            vec!["p2:7100".to_string(), PRODUCER_ADDR.to_string()]
        );
    }

    #[tokio::test]
    async fn test_remove_tables() {
        let f = fixture(MasterConfig::default()).await;
        let (a, ca) = f.table_pair("a", 1, 1);
        let (b, _) = f.table_pair("b", 1, 1);
        f.active_group("g", vec![a.clone(), b.clone()]).await;

        let mut req = alter("g");
        req.producer_table_ids_to_remove = vec![a.clone(), b.clone()];
        assert!(matches!(
            f.manager.alter_universe_replication(&req).await,
            Err(MasterError::InvalidArgument(_))
        ));

        let stream_a = group_meta(&f, "g").table_streams[&a];
        req.producer_table_ids_to_remove = vec![a.clone()];
        f.manager.alter_universe_replication(&req).await.unwrap();

        let meta = group_meta(&f, "g");
        assert_eq!(meta.tables, vec![b]);
        assert!(!meta.table_streams.contains_key(&a));
        let config = f.manager.cluster_config().read();
        let entry = &config.consumer_registry.producer_map[&ReplicationGroupId::new("g")];
        assert_eq!(entry.stream_map.len(), 1);
        assert!(!entry.stream_map.contains_key(&stream_a));
        assert!(!f.manager.maps.read().xcluster_consumer_tables.contains_key(&ca));
        assert!(f.producer.stream_table(&stream_a).is_none());
    }

    #[tokio::test]
    async fn test_remove_namespace_requires_db_scoped() {
        let f = fixture(MasterConfig::default()).await;
        let (a, _) = f.table_pair("a", 1, 1);
        f.active_group("g", vec![a]).await;
        let mut req = alter("g");
        req.producer_namespace_id_to_remove = Some(f.producer_ns.clone());
        assert!(matches!(
            f.manager.alter_universe_replication(&req).await,
            Err(MasterError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_namespace_from_db_scoped_group() {
        let f = fixture(MasterConfig::default()).await;
        f.table_pair("a", 1, 1);
        let mut setup = f.request("g", Vec::new());
        setup.transactional = true;
        setup.producer_namespaces = vec![NamespaceIdentifier {
            id: f.producer_ns.clone(),
            name: "db".into(),
        }];
        f.manager.setup_universe_replication(&setup).await.unwrap();
        assert_eq!(f.wait_done("g").await.error, None);

        let mut req = alter("g");
        req.producer_namespace_id_to_remove = Some(f.producer_ns.clone());
        f.manager.alter_universe_replication(&req).await.unwrap();
        let meta = group_meta(&f, "g");
        assert!(meta.tables.is_empty());
        assert!(meta.db_scoped_info.as_ref().unwrap().namespace_infos.is_empty());
    }

    #[tokio::test]
    async fn test_add_tables_through_shadow_group() {
        let f = fixture(MasterConfig::default()).await;
        let (a, _) = f.table_pair("a", 1, 1);
        let (b, cb) = f.table_pair("b", 2, 2);
        f.active_group("g", vec![a.clone()]).await;

        let mut req = alter("g");
        req.producer_table_ids_to_add = vec![b.clone()];
        f.manager.alter_universe_replication(&req).await.unwrap();
        assert_eq!(f.wait_done("g.ALTER").await.error, None);

        let meta = group_meta(&f, "g");
        assert_eq!(meta.tables, vec![a, b.clone()]);
        assert_eq!(meta.table_streams.len(), 2);
        assert_eq!(meta.validated_tables[&b], cb);
        assert!(f.manager.universe(&ReplicationGroupId::new("g.ALTER")).is_none());

        let config = f.manager.cluster_config().read();
        assert_eq!(config.consumer_registry.producer_map.len(), 1);
        assert_eq!(
            config.consumer_registry.producer_map[&ReplicationGroupId::new("g")]
                .stream_map
                .len(),
            2
        );
        assert_eq!(
            f.manager.maps.read().xcluster_consumer_tables[&cb],
            ReplicationGroupId::new("g")
        );
        assert!(!f.sys_catalog.contains(SysEntryType::UniverseReplication, "g.ALTER"));
    }

    #[tokio::test]
    async fn test_failed_add_leaves_original_untouched() {
        let f = fixture(MasterConfig::default()).await;
        let (a, _) = f.table_pair("a", 1, 1);
        let (b, _) = f.table_pair("b", 1, 1);
        f.active_group("g", vec![a.clone()]).await;
        let version = f.manager.cluster_config().read().version;

        f.producer.fail_operation(ops::CREATE_STREAM);
        let mut req = alter("g");
        req.producer_table_ids_to_add = vec![b];
        f.manager.alter_universe_replication(&req).await.unwrap();
        assert!(f.wait_done("g.ALTER").await.error.is_some());

        assert_eq!(group_meta(&f, "g").tables, vec![a]);
        assert_eq!(f.manager.cluster_config().read().version, version);
    }

    #[tokio::test]
    async fn test_rename_group() {
        let f = fixture(MasterConfig::default()).await;
        let (a, ca) = f.table_pair("a", 1, 1);
        f.active_group("g", vec![a]).await;

        let mut req = alter("g");
        req.new_replication_group_id = Some(ReplicationGroupId::new("g.ALTER"));
        assert!(matches!(
            f.manager.alter_universe_replication(&req).await,
            Err(MasterError::InvalidArgument(_))
        ));

        req.new_replication_group_id = Some(ReplicationGroupId::new("h"));
        f.manager.alter_universe_replication(&req).await.unwrap();
        let h = ReplicationGroupId::new("h");
        assert!(f.manager.universe(&ReplicationGroupId::new("g")).is_none());
        assert_eq!(group_meta(&f, "h").state, SysUniverseReplicationState::Active);
        assert_eq!(f.manager.maps.read().xcluster_consumer_tables[&ca], h);
        let config = f.manager.cluster_config().read();
        assert!(config.consumer_registry.producer_map.contains_key(&h));
        assert!(!f.sys_catalog.contains(SysEntryType::UniverseReplication, "g"));
        assert!(f.sys_catalog.contains(SysEntryType::UniverseReplication, "h"));
    }
}
