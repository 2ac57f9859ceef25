//! Propagates tablet splits into the CDC state table.

use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::cdc_state::{CdcStateTableEntry, CdcStateTableEntrySelector, CdcStateTableKey};
use crate::error::Result;
use crate::manager::XreplCatalogManager;
use crate::maps::HiddenTabletInfo;
use crate::types::{OpId, StreamId, TableId, TabletId};

impl XreplCatalogManager {
    /// Adds child rows for every stream covering `table_id` after `parent`
    /// split into `children`. Returns the number of rows written.
    ///
    /// xCluster streams always get `OpId::MIN` children. CDCSDK streams only
    /// get children while the parent row is open; the children inherit its
    /// active and safe times. Existing child rows are left alone, so the call
    /// may be replayed.
    pub async fn update_cdc_state_on_tablet_split(
        &self,
        table_id: &TableId,
        parent: &TabletId,
        children: &[TabletId; 2],
    ) -> Result<usize> {
        let streams = self.maps.read().streams_for_table(table_id);
        if streams.is_empty() {
            return Ok(0);
        }

        let parent_selector = CdcStateTableEntrySelector::default()
            .include_checkpoint()
            .include_active_time()
            .include_cdc_sdk_safe_time();
        let mut rows = Vec::new();
        let mut written: BTreeSet<StreamId> = BTreeSet::new();
        let mut retain_parent = false;
        for stream in &streams {
            let stream_id = *stream.id();
            let cdcsdk = stream.read().is_cdcsdk();
            let inherited = if cdcsdk {
                let parent_row = self
                    .cdc_state()
                    .try_fetch_entry(
                        &CdcStateTableKey::new(parent.clone(), stream_id),
                        parent_selector.clone(),
                    )
                    .await?;
                match parent_row {
                    Some(row) if !row.checkpoint.is_some_and(|op| op.is_max()) => Some(row),
                    _ => {
                        debug!(stream_id = %stream_id, tablet_id = %parent, "no open parent row, skipping split");
                        continue;
                    }
                }
            } else {
                None
            };

            for child in children {
                let key = CdcStateTableKey::new(child.clone(), stream_id);
                if self
                    .cdc_state()
                    .try_fetch_entry(&key, CdcStateTableEntrySelector::default())
                    .await?
                    .is_some()
                {
                    continue;
                }
                let mut row = CdcStateTableEntry::with_checkpoint(child.clone(), stream_id, OpId::MIN);
                if let Some(parent_row) = &inherited {
                    row.active_time = parent_row.active_time;
                    row.cdc_sdk_safe_time = parent_row.cdc_sdk_safe_time;
                }
                rows.push(row);
            }
            written.insert(stream_id);
            retain_parent |= cdcsdk;
        }

        let count = rows.len();
        self.cdc_state().upsert_entries(rows).await?;
        self.reverify_split_children(table_id, children, &written)
            .await?;

        if retain_parent {
            self.maps.write().retained_by_cdcsdk.insert(
                parent.clone(),
                HiddenTabletInfo {
                    table_id: table_id.clone(),
                    split_children: children.to_vec(),
                },
            );
        }
        info!(
            table_id = %table_id,
            tablet_id = %parent,
            streams = written.len(),
            rows = count,
            "propagated tablet split to CDC state"
        );
        Ok(count)
    }

    /// Closes child rows of streams that stopped covering the table while the
    /// children were written. A stream removed after this check is caught by
    /// the background sweep instead.
    async fn reverify_split_children(
        &self,
        table_id: &TableId,
        children: &[TabletId; 2],
        written: &BTreeSet<StreamId>,
    ) -> Result<()> {
        let current: BTreeSet<StreamId> = self
            .maps
            .read()
            .streams_for_table(table_id)
            .iter()
            .map(|s| *s.id())
            .collect();
        let closed: Vec<CdcStateTableEntry> = written
            .difference(&current)
            .flat_map(|stream_id| {
                children.iter().map(move |child| {
                    CdcStateTableEntry::with_checkpoint(child.clone(), *stream_id, OpId::MAX)
                })
            })
            .collect();
        if closed.is_empty() {
            return Ok(());
        }
        debug!(table_id = %table_id, rows = closed.len(), "closing split children of removed streams");
        self.cdc_state().update_entries(closed).await
    }
}
