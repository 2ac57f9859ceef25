//! xCluster replication groups on the consumer side.
//!
//! A group is created by [`XreplCatalogManager::setup_universe_replication`],
//! which persists it in `Initializing` and hands it to a [`SetupWorkflow`]
//! task. Adding tables to a running group goes through a shadow group named
//! `<id>.ALTER` that runs the same workflow and is then merged into the
//! original. Everything that fails after the kickoff call is recorded on the
//! group and surfaced by the polling calls.

mod alter;
mod bootstrap;
mod consumer_registry;
mod schema_version;
mod setup;
mod status;
#[cfg(test)]
pub(crate) mod testing;

pub use schema_version::{reconcile_schema_versions, SchemaVersionOutcome};
pub use setup::{SetupEvent, SetupStage, SetupStep, SetupWorkflow, ValidatedTable};

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{MasterError, Result};
use crate::manager::XreplCatalogManager;
use crate::metadata::{
    SysUniverseReplicationEntry, SysUniverseReplicationState, UniverseReplicationInfo,
};
use crate::rpc::{DeleteUniverseReplicationRequest, GetUniverseReplicationResponse};
use crate::sys_catalog::SysCatalogWriter;
use crate::types::{ReplicationGroupId, StreamId};

/// Suffix of the shadow group used to add tables to a running group.
pub const ALTER_SUFFIX: &str = ".ALTER";

/// Id of the shadow group that adds tables to `id`.
pub fn alter_replication_group_id(id: &ReplicationGroupId) -> ReplicationGroupId {
    ReplicationGroupId::new(format!("{id}{ALTER_SUFFIX}"))
}

/// Returns true for shadow group ids.
pub fn is_alter_replication_group_id(id: &ReplicationGroupId) -> bool {
    id.as_str().ends_with(ALTER_SUFFIX)
}

/// The group a shadow id belongs to; other ids are returned unchanged.
pub fn original_replication_group_id(id: &ReplicationGroupId) -> ReplicationGroupId {
    match id.as_str().strip_suffix(ALTER_SUFFIX) {
        Some(original) => ReplicationGroupId::new(original),
        None => id.clone(),
    }
}

pub(crate) fn required_group_id(id: &Option<ReplicationGroupId>) -> Result<&ReplicationGroupId> {
    id.as_ref().filter(|id| !id.is_empty()).ok_or_else(|| {
        MasterError::InvalidArgument("replication group id is required".into())
    })
}

impl XreplCatalogManager {
    pub(crate) fn universe_or_not_found(
        &self,
        id: &ReplicationGroupId,
    ) -> Result<Arc<UniverseReplicationInfo>> {
        self.universe(id)
            .ok_or_else(|| MasterError::NotFound(format!("replication group {id}")))
    }

    /// Reads a replication group.
    pub fn get_universe_replication(
        &self,
        id: &ReplicationGroupId,
    ) -> Result<GetUniverseReplicationResponse> {
        let universe = self.universe_or_not_found(id)?;
        Ok(GetUniverseReplicationResponse {
            replication_group_id: id.clone(),
            entry: (*universe.read()).clone(),
        })
    }

    /// Records a workflow failure on the group. A group already being deleted
    /// moves to `DeletedError` instead of `Failed`.
    pub(crate) async fn mark_universe_failed(
        &self,
        universe: &Arc<UniverseReplicationInfo>,
        error: &MasterError,
    ) {
        let group = universe.id().clone();
        let mut l = universe.lock_for_write().await;
        let entry = l.mutable();
        entry.state = match entry.state {
            SysUniverseReplicationState::Deleting | SysUniverseReplicationState::Deleted => {
                SysUniverseReplicationState::DeletedError
            }
            _ => SysUniverseReplicationState::Failed,
        };
        entry.error = Some(error.to_string());
        let state = entry.state;
        let mut writer = SysCatalogWriter::new();
        let persisted = match writer.upsert(group.as_str(), l.data()) {
            Ok(()) => self.persist(writer).await,
            Err(e) => Err(e),
        };
        match persisted {
            Ok(()) => {
                l.commit();
                self.maps.write().release_consumer_tables(&group);
                warn!(replication_group_id = %group, state = ?state, error = %error, "replication group failed");
            }
            Err(e) => {
                warn!(replication_group_id = %group, error = %e, "failed to persist replication group failure");
            }
        }
    }

    /// Tears down a replication group: removes it from the consumer registry,
    /// deletes its producer streams and then the record itself.
    pub async fn delete_universe_replication(&self, req: &DeleteUniverseReplicationRequest) -> Result<()> {
        self.leader_term()?;
        let group = required_group_id(&req.replication_group_id)?;
        let universe = self.universe_or_not_found(group)?;

        {
            let mut l = universe.lock_for_write().await;
            l.mutable().state = SysUniverseReplicationState::Deleting;
            let mut writer = SysCatalogWriter::new();
            writer.upsert(group.as_str(), l.data())?;
            self.persist(writer).await?;
            l.commit();
        }

        let config = self.cluster_config();
        {
            let mut l = config.lock_for_write().await;
            if l.mutable().consumer_registry.producer_map.remove(group).is_some() {
                l.mutable().version += 1;
                let mut writer = SysCatalogWriter::new();
                writer.upsert(config.id(), l.data())?;
                self.persist(writer).await?;
                l.commit();
            }
        }

        let meta = universe.read();
        let streams: Vec<StreamId> = meta.table_streams.values().copied().collect();
        if !req.skip_producer_stream_deletion && !streams.is_empty() {
            let deleted = match self
                .producers()
                .connect(group, &meta.producer_master_addresses)
            {
                Ok(client) => client.delete_cdc_streams(&streams).await,
                Err(e) => Err(e),
            };
            if let Err(e) = deleted {
                if !req.ignore_errors {
                    self.mark_universe_failed(&universe, &e).await;
                    return Err(e);
                }
                warn!(replication_group_id = %group, error = %e, "ignoring failure to delete producer streams");
            }
        }

        let mut l = universe.lock_for_write().await;
        l.mutable().state = SysUniverseReplicationState::Deleted;
        let mut writer = SysCatalogWriter::new();
        writer.delete::<SysUniverseReplicationEntry>(group.as_str());
        self.persist(writer).await?;
        l.commit();
        {
            let mut maps = self.maps.write();
            maps.universe_replication_map.remove(group);
            maps.release_consumer_tables(group);
            maps.replication_errors.remove(group);
        }
        info!(replication_group_id = %group, streams = streams.len(), "deleted replication group");
        Ok(())
    }

    /// Deletes the first failed replication group, ignoring producer errors.
    /// Returns true if one was cleared.
    pub(crate) async fn clear_failed_universe(&self) -> Result<bool> {
        let failed = self
            .maps
            .read()
            .universe_replication_map
            .iter()
            .find(|(_, u)| {
                matches!(
                    u.read().state,
                    SysUniverseReplicationState::Failed | SysUniverseReplicationState::DeletedError
                )
            })
            .map(|(id, _)| id.clone());
        let Some(group) = failed else {
            return Ok(false);
        };
        self.delete_universe_replication(&DeleteUniverseReplicationRequest {
            replication_group_id: Some(group),
            ignore_errors: true,
            skip_producer_stream_deletion: false,
        })
        .await?;
        Ok(true)
    }
}
