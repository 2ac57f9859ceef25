//! CDC state table accessor.
//!
//! Each row tracks the replication progress of one stream on one tablet,
//! optionally narrowed to a colocated table. Writes are keyed, so replaying
//! them is harmless.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::error::{MasterError, Result};
use crate::types::{OpId, StreamId, TableId, TabletId};

/// Tablet id of the row holding a replication slot's LSN bookkeeping.
pub const SLOT_ENTRY_TABLET_ID: &str = "dummy_id_for_replication_slot";

/// Primary key of a state row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CdcStateTableKey {
    /// Tablet the row tracks.
    pub tablet_id: TabletId,
    /// Stream the row belongs to.
    pub stream_id: StreamId,
    /// Colocated table the row is narrowed to.
    pub colocated_table_id: Option<TableId>,
}

impl CdcStateTableKey {
    /// Key of a whole-tablet row.
    pub fn new(tablet_id: TabletId, stream_id: StreamId) -> Self {
        Self {
            tablet_id,
            stream_id,
            colocated_table_id: None,
        }
    }

    /// Key of the slot metadata row of `stream_id`.
    pub fn slot_entry(stream_id: StreamId) -> Self {
        Self::new(TabletId::new(SLOT_ENTRY_TABLET_ID), stream_id)
    }

    /// Returns true for the slot metadata row.
    pub fn is_slot_entry(&self) -> bool {
        self.tablet_id.as_str() == SLOT_ENTRY_TABLET_ID
    }
}

/// A state row. Unset columns are left untouched by merging writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdcStateTableEntry {
    /// Row key.
    pub key: CdcStateTableKey,
    /// Last streamed position.
    pub checkpoint: Option<OpId>,
    /// Last time a client polled, microseconds.
    pub active_time: Option<u64>,
    /// Hybrid time below which every change has been streamed.
    pub cdc_sdk_safe_time: Option<u64>,
    /// Physical time of the last applied record, microseconds.
    pub last_replication_time: Option<u64>,
    /// Snapshot bootstrap key.
    pub snapshot_key: Option<String>,
    /// Slot row: last LSN confirmed by the client.
    pub confirmed_flush_lsn: Option<u64>,
    /// Slot row: oldest LSN the client may request.
    pub restart_lsn: Option<u64>,
    /// Slot row: transaction id horizon.
    pub xmin: Option<u32>,
    /// Slot row: commit time of the record at `restart_lsn`.
    pub record_id_commit_time: Option<u64>,
    /// Slot row: last publication refresh time.
    pub last_pub_refresh_time: Option<u64>,
}

impl CdcStateTableEntry {
    /// A row with only its key set.
    pub fn new(key: CdcStateTableKey) -> Self {
        Self {
            key,
            checkpoint: None,
            active_time: None,
            cdc_sdk_safe_time: None,
            last_replication_time: None,
            snapshot_key: None,
            confirmed_flush_lsn: None,
            restart_lsn: None,
            xmin: None,
            record_id_commit_time: None,
            last_pub_refresh_time: None,
        }
    }

    /// A whole-tablet row with a checkpoint.
    pub fn with_checkpoint(tablet_id: TabletId, stream_id: StreamId, checkpoint: OpId) -> Self {
        let mut entry = Self::new(CdcStateTableKey::new(tablet_id, stream_id));
        entry.checkpoint = Some(checkpoint);
        entry
    }

    /// Copies every set column of `other` over this row.
    pub fn merge_from(&mut self, other: &CdcStateTableEntry) {
        macro_rules! merge {
            ($($field:ident),+) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field.clone();
                })+
            };
        }
        merge!(
            checkpoint,
            active_time,
            cdc_sdk_safe_time,
            last_replication_time,
            snapshot_key,
            confirmed_flush_lsn,
            restart_lsn,
            xmin,
            record_id_commit_time,
            last_pub_refresh_time
        );
    }

    fn project(&self, selector: &CdcStateTableEntrySelector) -> CdcStateTableEntry {
        if selector.all {
            return self.clone();
        }
        let mut out = CdcStateTableEntry::new(self.key.clone());
        if selector.checkpoint {
            out.checkpoint = self.checkpoint;
        }
        if selector.active_time {
            out.active_time = self.active_time;
        }
        if selector.cdc_sdk_safe_time {
            out.cdc_sdk_safe_time = self.cdc_sdk_safe_time;
        }
        if selector.last_replication_time {
            out.last_replication_time = self.last_replication_time;
        }
        if selector.snapshot_key {
            out.snapshot_key = self.snapshot_key.clone();
        }
        if selector.slot_fields {
            out.confirmed_flush_lsn = self.confirmed_flush_lsn;
            out.restart_lsn = self.restart_lsn;
            out.xmin = self.xmin;
            out.record_id_commit_time = self.record_id_commit_time;
            out.last_pub_refresh_time = self.last_pub_refresh_time;
        }
        out
    }
}

/// Columns to read. The key is always returned.
#[derive(Clone, Debug, Default)]
pub struct CdcStateTableEntrySelector {
    all: bool,
    checkpoint: bool,
    active_time: bool,
    cdc_sdk_safe_time: bool,
    last_replication_time: bool,
    snapshot_key: bool,
    slot_fields: bool,
}

impl CdcStateTableEntrySelector {
    /// Selects every column.
    pub fn all() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }

    /// Adds the checkpoint column.
    pub fn include_checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self
    }

    /// Adds the active time column.
    pub fn include_active_time(mut self) -> Self {
        self.active_time = true;
        self
    }

    /// Adds the safe time column.
    pub fn include_cdc_sdk_safe_time(mut self) -> Self {
        self.cdc_sdk_safe_time = true;
        self
    }

    /// Adds the last replication time column.
    pub fn include_last_replication_time(mut self) -> Self {
        self.last_replication_time = true;
        self
    }

    /// Adds the snapshot key column.
    pub fn include_snapshot_key(mut self) -> Self {
        self.snapshot_key = true;
        self
    }

    /// Adds the slot bookkeeping columns.
    pub fn include_slot_fields(mut self) -> Self {
        self.slot_fields = true;
        self
    }
}

/// Lazily produced rows of a full table scan.
pub type CdcStateTableRange = Box<dyn Iterator<Item = Result<CdcStateTableEntry>> + Send>;

/// The CDC state table.
#[async_trait]
pub trait CdcStateTable: Send + Sync {
    /// Writes rows, replacing any existing row with the same key.
    async fn insert_entries(&self, entries: Vec<CdcStateTableEntry>) -> Result<()>;

    /// Merges set columns into existing rows, creating missing ones.
    async fn upsert_entries(&self, entries: Vec<CdcStateTableEntry>) -> Result<()>;

    /// Merges set columns into existing rows; missing rows are skipped.
    async fn update_entries(&self, entries: Vec<CdcStateTableEntry>) -> Result<()>;

    /// Removes rows; missing keys are ignored.
    async fn delete_entries(&self, keys: Vec<CdcStateTableKey>) -> Result<()>;

    /// Scans the whole table.
    async fn get_table_range(
        &self,
        selector: CdcStateTableEntrySelector,
    ) -> Result<CdcStateTableRange>;

    /// Reads one row.
    async fn try_fetch_entry(
        &self,
        key: &CdcStateTableKey,
        selector: CdcStateTableEntrySelector,
    ) -> Result<Option<CdcStateTableEntry>>;
}

/// Collects every row of `stream_id` from a range scan.
pub async fn entries_for_stream(
    table: &dyn CdcStateTable,
    stream_id: StreamId,
    selector: CdcStateTableEntrySelector,
) -> Result<Vec<CdcStateTableEntry>> {
    let mut out = Vec::new();
    for entry in table.get_table_range(selector).await? {
        let entry = entry?;
        if entry.key.stream_id == stream_id {
            out.push(entry);
        }
    }
    Ok(out)
}

/// In-memory state table backed by a BTreeMap.
pub struct MemoryCdcStateTable {
    rows: RwLock<BTreeMap<CdcStateTableKey, CdcStateTableEntry>>,
    fail_writes: AtomicUsize,
}

impl MemoryCdcStateTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            fail_writes: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` writes fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Returns true if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every row.
    pub fn rows(&self) -> Vec<CdcStateTableEntry> {
        self.rows
            .read()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of one stream's rows.
    pub fn rows_for_stream(&self, stream_id: StreamId) -> Vec<CdcStateTableEntry> {
        self.rows()
            .into_iter()
            .filter(|e| e.key.stream_id == stream_id)
            .collect()
    }

    /// Reads one row synchronously.
    pub fn get(&self, key: &CdcStateTableKey) -> Option<CdcStateTableEntry> {
        self.rows.read().ok().and_then(|r| r.get(key).cloned())
    }

    fn check_write(&self) -> Result<()> {
        let failed = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(MasterError::Internal(
                "injected cdc state write failure".into(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryCdcStateTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CdcStateTable for MemoryCdcStateTable {
    async fn insert_entries(&self, entries: Vec<CdcStateTableEntry>) -> Result<()> {
        self.check_write()?;
        let mut rows = self
            .rows
            .write()
            .map_err(|e| MasterError::Internal(e.to_string()))?;
        for entry in entries {
            rows.insert(entry.key.clone(), entry);
        }
        Ok(())
    }

    async fn upsert_entries(&self, entries: Vec<CdcStateTableEntry>) -> Result<()> {
        self.check_write()?;
        let mut rows = self
            .rows
            .write()
            .map_err(|e| MasterError::Internal(e.to_string()))?;
        for entry in entries {
            rows.entry(entry.key.clone())
                .and_modify(|existing| existing.merge_from(&entry))
                .or_insert(entry);
        }
        Ok(())
    }

    async fn update_entries(&self, entries: Vec<CdcStateTableEntry>) -> Result<()> {
        self.check_write()?;
        let mut rows = self
            .rows
            .write()
            .map_err(|e| MasterError::Internal(e.to_string()))?;
        for entry in entries {
            if let Some(existing) = rows.get_mut(&entry.key) {
                existing.merge_from(&entry);
            }
        }
        Ok(())
    }

    async fn delete_entries(&self, keys: Vec<CdcStateTableKey>) -> Result<()> {
        self.check_write()?;
        let mut rows = self
            .rows
            .write()
            .map_err(|e| MasterError::Internal(e.to_string()))?;
        for key in keys {
            rows.remove(&key);
        }
        Ok(())
    }

    async fn get_table_range(
        &self,
        selector: CdcStateTableEntrySelector,
    ) -> Result<CdcStateTableRange> {
        let rows = self
            .rows
            .read()
            .map_err(|e| MasterError::Internal(e.to_string()))?;
        let snapshot: Vec<CdcStateTableEntry> =
            rows.values().map(|e| e.project(&selector)).collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }

    async fn try_fetch_entry(
        &self,
        key: &CdcStateTableKey,
        selector: CdcStateTableEntrySelector,
    ) -> Result<Option<CdcStateTableEntry>> {
        let rows = self
            .rows
            .read()
            .map_err(|e| MasterError::Internal(e.to_string()))?;
        Ok(rows.get(key).map(|e| e.project(&selector)))
    }
}
