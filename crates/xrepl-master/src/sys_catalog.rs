//! Persistent entity store.
//!
//! The sys catalog is the replicated table holding every stream, replication
//! group, bootstrap and cluster config record. Writes are atomic multi-row
//! batches fenced by the leader term. The in-memory implementation keeps the
//! rows in a BTreeMap and is used by tests and by the standalone binary.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::error::{MasterError, Result};
use crate::types::LeaderTerm;

/// Kind of record stored in the sys catalog.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SysEntryType {
    /// A CDC stream.
    CdcStream,
    /// An xCluster replication group.
    UniverseReplication,
    /// A replication bootstrap pipeline.
    UniverseReplicationBootstrap,
    /// The cluster-wide config holding the consumer registry.
    ClusterConfig,
}

/// A persisted record type.
pub trait SysCatalogEntry: Serialize + DeserializeOwned {
    /// Row kind the record is stored under.
    const ENTRY_TYPE: SysEntryType;
}

/// One mutation inside a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SysCatalogOp {
    /// Insert or overwrite the row.
    Upsert {
        /// Row kind.
        entry_type: SysEntryType,
        /// Row id.
        id: String,
        /// Encoded record.
        data: Vec<u8>,
    },
    /// Remove the row if present.
    Delete {
        /// Row kind.
        entry_type: SysEntryType,
        /// Row id.
        id: String,
    },
}

/// Accumulates mutations of any record types into one atomic write.
#[derive(Clone, Debug, Default)]
pub struct SysCatalogWriter {
    ops: Vec<SysCatalogOp>,
}

impl SysCatalogWriter {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an upsert of `record` under `id`.
    pub fn upsert<T: SysCatalogEntry>(&mut self, id: &str, record: &T) -> Result<()> {
        let data = bincode::serialize(record)?;
        self.ops.push(SysCatalogOp::Upsert {
            entry_type: T::ENTRY_TYPE,
            id: id.to_string(),
            data,
        });
        Ok(())
    }

    /// Adds a delete of the `T` row with `id`.
    pub fn delete<T: SysCatalogEntry>(&mut self, id: &str) {
        self.ops.push(SysCatalogOp::Delete {
            entry_type: T::ENTRY_TYPE,
            id: id.to_string(),
        });
    }

    /// Number of queued mutations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch.
    pub fn into_ops(self) -> Vec<SysCatalogOp> {
        self.ops
    }
}

/// The replicated system catalog.
#[async_trait]
pub trait SysCatalog: Send + Sync {
    /// Applies every mutation of `writer` atomically. Fails with
    /// [`MasterError::NotLeader`] if `term` is not the current leader term.
    async fn write(&self, term: LeaderTerm, writer: SysCatalogWriter) -> Result<()>;

    /// Returns every `(id, encoded record)` row of a kind, ordered by id.
    async fn scan(&self, entry_type: SysEntryType) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Decodes every row of kind `T`.
pub async fn visit<T: SysCatalogEntry>(catalog: &dyn SysCatalog) -> Result<Vec<(String, T)>> {
    let rows = catalog.scan(T::ENTRY_TYPE).await?;
    rows.into_iter()
        .map(|(id, data)| Ok((id, bincode::deserialize::<T>(&data)?)))
        .collect()
}

/// Upserts a single record.
pub async fn upsert<T: SysCatalogEntry>(
    catalog: &dyn SysCatalog,
    term: LeaderTerm,
    id: &str,
    record: &T,
) -> Result<()> {
    let mut writer = SysCatalogWriter::new();
    writer.upsert(id, record)?;
    catalog.write(term, writer).await
}

/// Deletes a single record.
pub async fn delete<T: SysCatalogEntry>(
    catalog: &dyn SysCatalog,
    term: LeaderTerm,
    id: &str,
) -> Result<()> {
    let mut writer = SysCatalogWriter::new();
    writer.delete::<T>(id);
    catalog.write(term, writer).await
}

/// In-memory sys catalog backed by a BTreeMap.
pub struct MemorySysCatalog {
    rows: RwLock<BTreeMap<(SysEntryType, String), Vec<u8>>>,
    term: AtomicU64,
    fail_writes: AtomicUsize,
    fail_scans: AtomicUsize,
    writes: AtomicU64,
}

impl MemorySysCatalog {
    /// Creates an empty catalog led by term 1.
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            term: AtomicU64::new(1),
            fail_writes: AtomicUsize::new(0),
            fail_scans: AtomicUsize::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Moves leadership to `term`; writes with older terms are fenced.
    pub fn set_leader_term(&self, term: LeaderTerm) {
        self.term.store(term.as_u64(), Ordering::SeqCst);
    }

    /// The current leader term.
    pub fn leader_term(&self) -> LeaderTerm {
        LeaderTerm::new(self.term.load(Ordering::SeqCst))
    }

    /// Makes the next `n` writes fail with an internal error.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` scans fail with an internal error.
    pub fn fail_next_scans(&self, n: usize) {
        self.fail_scans.store(n, Ordering::SeqCst);
    }

    /// Number of successful batch writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of rows of a kind.
    pub fn count(&self, entry_type: SysEntryType) -> usize {
        self.rows
            .read()
            .map(|rows| rows.keys().filter(|(t, _)| *t == entry_type).count())
            .unwrap_or(0)
    }

    /// Returns true if the row exists.
    pub fn contains(&self, entry_type: SysEntryType, id: &str) -> bool {
        self.rows
            .read()
            .map(|rows| rows.contains_key(&(entry_type, id.to_string())))
            .unwrap_or(false)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemorySysCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SysCatalog for MemorySysCatalog {
    async fn write(&self, term: LeaderTerm, writer: SysCatalogWriter) -> Result<()> {
        let current = self.leader_term();
        if term != current {
            return Err(MasterError::NotLeader {
                current,
                requested: term,
            });
        }
        if Self::take_failure(&self.fail_writes) {
            return Err(MasterError::Internal("injected sys catalog write failure".into()));
        }
        let mut rows = self
            .rows
            .write()
            .map_err(|e| MasterError::Internal(e.to_string()))?;
        for op in writer.into_ops() {
            match op {
                SysCatalogOp::Upsert {
                    entry_type,
                    id,
                    data,
                } => {
                    rows.insert((entry_type, id), data);
                }
                SysCatalogOp::Delete { entry_type, id } => {
                    rows.remove(&(entry_type, id));
                }
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn scan(&self, entry_type: SysEntryType) -> Result<Vec<(String, Vec<u8>)>> {
        if Self::take_failure(&self.fail_scans) {
            return Err(MasterError::Internal("injected sys catalog scan failure".into()));
        }
        let rows = self
            .rows
            .read()
            .map_err(|e| MasterError::Internal(e.to_string()))?;
        Ok(rows
            .iter()
            .filter(|((t, _), _)| *t == entry_type)
            .map(|((_, id), data)| (id.clone(), data.clone()))
            .collect())
    }
}
