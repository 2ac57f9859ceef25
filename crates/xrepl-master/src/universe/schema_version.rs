//! Producer/consumer schema version tracking in the consumer registry.
//!
//! Each registry stream keeps the current and the previous producer schema
//! version together with the consumer version that applies them. Tservers
//! report versions out of order, so an update is only taken when it moves the
//! cached pair forward.

use tracing::{debug, info};

use crate::error::{MasterError, Result};
use crate::manager::XreplCatalogManager;
use crate::metadata::SchemaVersions;
use crate::rpc::{UpdateConsumerOnProducerMetadataRequest, UpdateConsumerOnProducerMetadataResponse};
use crate::sys_catalog::SysCatalogWriter;

use super::required_group_id;

/// Effect of a reported version pair on the cached one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchemaVersionOutcome {
    /// The cache changed and must be persisted.
    Updated,
    /// Nothing to record.
    Unchanged,
    /// An older producer version arrived with a consumer version behind the
    /// one already recorded for the old slot.
    RejectedStale,
}

/// Folds a reported `(producer, consumer)` pair into `versions`.
pub fn reconcile_schema_versions(
    versions: &mut SchemaVersions,
    producer: u32,
    consumer: u32,
) -> SchemaVersionOutcome {
    if producer > versions.current_producer_schema_version {
        versions.old_producer_schema_version = versions.current_producer_schema_version;
        versions.old_consumer_schema_version = versions.current_consumer_schema_version;
        versions.current_producer_schema_version = producer;
        versions.current_consumer_schema_version = consumer;
        return SchemaVersionOutcome::Updated;
    }
    if producer == versions.current_producer_schema_version {
        if versions.current_consumer_schema_version == consumer {
            return SchemaVersionOutcome::Unchanged;
        }
        versions.current_consumer_schema_version = consumer;
        return SchemaVersionOutcome::Updated;
    }
    if producer > versions.old_producer_schema_version {
        if consumer < versions.old_consumer_schema_version {
            return SchemaVersionOutcome::RejectedStale;
        }
        versions.old_producer_schema_version = producer;
        versions.old_consumer_schema_version = consumer;
        return SchemaVersionOutcome::Updated;
    }
    SchemaVersionOutcome::Unchanged
}

fn compatible_consumer_version(versions: &SchemaVersions, producer: u32, reported: u32) -> u32 {
    if producer == versions.current_producer_schema_version {
        versions.current_consumer_schema_version
    } else if producer == versions.old_producer_schema_version {
        versions.old_consumer_schema_version
    } else {
        reported
    }
}

/// True when `producer` is the newest known producer version but the
/// consumer version it maps to has not moved past the one of the previous
/// producer version.
fn waits_for_consumer_schema(
    prev: &SchemaVersions,
    versions: &SchemaVersions,
    producer: u32,
    compatible: u32,
) -> bool {
    *prev != SchemaVersions::default()
        && producer == versions.current_producer_schema_version
        && producer > versions.old_producer_schema_version
        && compatible <= versions.old_consumer_schema_version
}

impl XreplCatalogManager {
    /// Records the schema versions a consumer tserver applies a producer
    /// stream with, and tells it whether to wait for a newer consumer schema.
    pub async fn update_consumer_on_producer_metadata(
        &self,
        req: &UpdateConsumerOnProducerMetadataRequest,
    ) -> Result<UpdateConsumerOnProducerMetadataResponse> {
        let group = required_group_id(&req.replication_group_id)?;
        let stream_id = req
            .stream_id
            .ok_or_else(|| MasterError::InvalidArgument("stream id is required".into()))?;
        let producer = req.producer_schema_version;
        let consumer = req.consumer_schema_version;

        let config = self.cluster_config();
        let mut l = config.lock_for_write().await;
        let registry = &mut l.mutable().consumer_registry;
        let stream = registry
            .producer_map
            .get_mut(group)
            .ok_or_else(|| MasterError::NotFound(format!("replication group {group} in consumer registry")))?
            .stream_map
            .get_mut(&stream_id)
            .ok_or_else(|| MasterError::NotFound(format!("stream {stream_id} of replication group {group}")))?;
        let versions = match req.colocation_id {
            Some(colocation_id) => stream.colocated_schema_versions.entry(colocation_id).or_default(),
            None => &mut stream.schema_versions,
        };

        let prev = *versions;
        let outcome = reconcile_schema_versions(versions, producer, consumer);
        let last_compatible = compatible_consumer_version(versions, producer, consumer);
        let should_wait = waits_for_consumer_schema(&prev, versions, producer, last_compatible);
        if outcome == SchemaVersionOutcome::Updated {
            let updated = *versions;
            l.mutable().version += 1;
            let mut writer = SysCatalogWriter::new();
            writer.upsert(config.id(), l.data())?;
            self.persist(writer).await?;
            l.commit();
            info!(
                replication_group_id = %group,
                stream_id = %stream_id,
                colocation_id = ?req.colocation_id,
                current_producer = updated.current_producer_schema_version,
                current_consumer = updated.current_consumer_schema_version,
                old_producer = updated.old_producer_schema_version,
                old_consumer = updated.old_consumer_schema_version,
                "updated schema versions"
            );
        } else {
            debug!(stream_id = %stream_id, outcome = ?outcome, "schema versions unchanged");
        }
        if should_wait {
            debug!(
                replication_group_id = %group,
                stream_id = %stream_id,
                producer_schema_version = producer,
                consumer_schema_version = consumer,
                "producer schema ahead of consumer, tserver should wait"
            );
        }
        Ok(UpdateConsumerOnProducerMetadataResponse {
            should_wait,
            last_compatible_consumer_schema_version: last_compatible,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cached() -> SchemaVersions {
        SchemaVersions {
            current_producer_schema_version: 7,
            current_consumer_schema_version: 12,
            old_producer_schema_version: 3,
            old_consumer_schema_version: 10,
        }
    }

    #[test]
    fn test_newer_producer_shifts_current_into_old() {
        let mut v = cached();
        assert_eq!(reconcile_schema_versions(&mut v, 8, 13), SchemaVersionOutcome::Updated);
        assert_eq!(v.current_producer_schema_version, 8);
        assert_eq!(v.current_consumer_schema_version, 13);
        assert_eq!(v.old_producer_schema_version, 7);
        assert_eq!(v.old_consumer_schema_version, 12);
    }

    #[test]
    fn test_same_producer_updates_consumer_only_on_change() {
        let mut v = cached();
        assert_eq!(reconcile_schema_versions(&mut v, 7, 12), SchemaVersionOutcome::Unchanged);
        assert_eq!(reconcile_schema_versions(&mut v, 7, 14), SchemaVersionOutcome::Updated);
        assert_eq!(v.current_consumer_schema_version, 14);
    }

    #[test]
    fn test_between_versions_with_newer_consumer_fills_old_slot() {
        let mut v = cached();
        assert_eq!(reconcile_schema_versions(&mut v, 5, 11), SchemaVersionOutcome::Updated);
        assert_eq!(v.old_producer_schema_version, 5);
        assert_eq!(v.old_consumer_schema_version, 11);
        assert_eq!(v.current_producer_schema_version, 7);
    }

    #[test]
    fn test_between_versions_with_older_consumer_is_stale() {
        let mut v = cached();
        assert_eq!(
            reconcile_schema_versions(&mut v, 5, 9),
            SchemaVersionOutcome::RejectedStale
        );
        assert_eq!(v, cached());
    }

    #[test]
    fn test_older_than_old_is_ignored() {
        let mut v = cached();
        assert_eq!(reconcile_schema_versions(&mut v, 2, 20), SchemaVersionOutcome::Unchanged);
        assert_eq!(v, cached());
    }

    #[test]
    fn test_wait_until_consumer_schema_advances() {
        let prev = SchemaVersions {
            current_producer_schema_version: 1,
            current_consumer_schema_version: 1,
            ..Default::default()
        };
        let mut v = prev;
        assert_eq!(reconcile_schema_versions(&mut v, 2, 1), SchemaVersionOutcome::Updated);
        let compatible = compatible_consumer_version(&v, 2, 1);
        assert_eq!(compatible, 1);
        assert!(waits_for_consumer_schema(&prev, &v, 2, compatible));

        let prev = v;
        assert_eq!(reconcile_schema_versions(&mut v, 2, 2), SchemaVersionOutcome::Updated);
        let compatible = compatible_consumer_version(&v, 2, 2);
        assert!(!waits_for_consumer_schema(&prev, &v, 2, compatible));
    }

    #[test]
    fn test_first_report_never_waits() {
        let prev = SchemaVersions::default();
        let mut v = prev;
        reconcile_schema_versions(&mut v, 4, 0);
        assert!(!waits_for_consumer_schema(&prev, &v, 4, 0));
    }

    #[test]
    fn test_old_producer_report_does_not_wait() {
        let prev = cached();
        let mut v = prev;
        reconcile_schema_versions(&mut v, 3, 10);
        let compatible = compatible_consumer_version(&v, 3, 10);
        assert_eq!(compatible, 10);
        assert!(!waits_for_consumer_schema(&prev, &v, 3, compatible));
    }

    proptest! {
        #[test]
        fn prop_producer_versions_never_go_back(
            reports in prop::collection::vec((0u32..50, 0u32..50), 1..40)
        ) {
            let mut v = SchemaVersions::default();
            for (producer, consumer) in reports {
                let before = v;
                reconcile_schema_versions(&mut v, producer, consumer);
                prop_assert!(v.current_producer_schema_version >= before.current_producer_schema_version);
                prop_assert!(v.old_producer_schema_version >= before.old_producer_schema_version);
                prop_assert!(v.old_producer_schema_version <= v.current_producer_schema_version);
            }
        }
    }
}
