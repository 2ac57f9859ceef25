use tracing::debug;

use crate::error::{MasterError, Result};
use crate::manager::XreplCatalogManager;
use crate::rpc::{GetReplicationStatusResponse, ReplicationStatus};
use crate::types::{ReplicationErrorCode, ReplicationGroupId, StreamId};

impl XreplCatalogManager {
    /// Lists every replicated stream with the errors reported for it, for
    /// one group or all of them.
    pub fn get_replication_status(
        &self,
        group: Option<&ReplicationGroupId>,
    ) -> Result<GetReplicationStatusResponse> {
        let maps = self.maps.read();
        let groups: Vec<_> = match group {
            Some(id) => {
                let universe = maps
                    .universe_replication_map
                    .get(id)
                    .ok_or_else(|| MasterError::NotFound(format!("replication group {id}")))?;
                vec![(id.clone(), universe.clone())]
            }
            None => maps
                .universe_replication_map
                .iter()
                .map(|(id, u)| (id.clone(), u.clone()))
                .collect(),
        };

        let mut statuses = Vec::new();
        for (group_id, universe) in groups {
            let reported = maps.replication_errors.get(&group_id);
            for stream_id in universe.read().table_streams.values() {
                let errors = reported
                    .and_then(|streams| streams.get(stream_id))
                    .map(|errors| {
                        errors
                            .iter()
                            .map(|(code, detail)| (*code, detail.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                statuses.push(ReplicationStatus {
                    replication_group_id: group_id.clone(),
                    stream_id: *stream_id,
                    errors,
                });
            }
        }
        Ok(GetReplicationStatusResponse { statuses })
    }

    /// Records an error a consumer tserver reported for a stream. A later
    /// report of the same kind replaces the detail.
    pub fn store_replication_error(
        &self,
        group: &ReplicationGroupId,
        stream_id: StreamId,
        code: ReplicationErrorCode,
        detail: impl Into<String>,
    ) -> Result<()> {
        let mut maps = self.maps.write();
        if !maps.universe_replication_map.contains_key(group) {
            return Err(MasterError::NotFound(format!("replication group {group}")));
        }
        let detail = detail.into();
        debug!(replication_group_id = %group, stream_id = %stream_id, code = %code, detail = %detail, "replication error reported");
        maps.replication_errors
            .entry(group.clone())
            .or_default()
            .entry(stream_id)
            .or_default()
            .insert(code, detail);
        Ok(())
    }

    /// Clears one error kind of a stream, or all of them when `code` is unset.
    pub fn clear_replication_errors(
        &self,
        group: &ReplicationGroupId,
        stream_id: StreamId,
        code: Option<ReplicationErrorCode>,
    ) {
        let mut maps = self.maps.write();
        let Some(streams) = maps.replication_errors.get_mut(group) else {
            return;
        };
        if let Some(errors) = streams.get_mut(&stream_id) {
            match code {
                Some(code) => {
                    errors.remove(&code);
                }
                None => errors.clear(),
            }
            if errors.is_empty() {
                streams.remove(&stream_id);
            }
        }
        if streams.is_empty() {
            maps.replication_errors.remove(group);
        }
    }
}
