//! Copy-on-write metadata cells.
//!
//! Readers always see the last committed value. A writer takes the per-object
//! write lock, mutates a private dirty copy, persists it, and then publishes it
//! with [`WriteHandle::commit`]. Dropping a handle without committing discards
//! the dirty copy.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// A metadata value with committed and staged versions.
#[derive(Debug)]
pub struct CowObject<T> {
    committed: Arc<RwLock<Arc<T>>>,
    writer: Arc<Mutex<()>>,
}

impl<T: Clone> CowObject<T> {
    /// Wraps an initial committed value.
    pub fn new(value: T) -> Self {
        Self {
            committed: Arc::new(RwLock::new(Arc::new(value))),
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the last committed value.
    pub fn read(&self) -> Arc<T> {
        self.committed.read().clone()
    }

    /// Waits for exclusive write access and returns a handle holding a dirty
    /// copy of the committed value.
    pub async fn lock_for_write(&self) -> WriteHandle<T> {
        let guard = self.writer.clone().lock_owned().await;
        let dirty = (**self.committed.read()).clone();
        WriteHandle {
            committed: self.committed.clone(),
            dirty,
            published: false,
            _guard: guard,
        }
    }

    /// Returns a write handle if no other writer holds the lock.
    pub fn try_lock_for_write(&self) -> Option<WriteHandle<T>> {
        let guard = self.writer.clone().try_lock_owned().ok()?;
        let dirty = (**self.committed.read()).clone();
        Some(WriteHandle {
            committed: self.committed.clone(),
            dirty,
            published: false,
            _guard: guard,
        })
    }
}

/// Exclusive staged access to a [`CowObject`].
#[must_use = "a write handle is discarded unless committed"]
pub struct WriteHandle<T> {
    committed: Arc<RwLock<Arc<T>>>,
    dirty: T,
    published: bool,
    _guard: OwnedMutexGuard<()>,
}

impl<T: Clone> WriteHandle<T> {
    /// The staged value.
    pub fn data(&self) -> &T {
        &self.dirty
    }

    /// Mutable access to the staged value.
    pub fn mutable(&mut self) -> &mut T {
        &mut self.dirty
    }

    /// The value readers currently see.
    pub fn committed(&self) -> Arc<T> {
        self.committed.read().clone()
    }

    /// Publishes the staged value and releases the write lock.
    pub fn commit(mut self) {
        *self.committed.write() = Arc::new(self.dirty.clone());
        self.published = true;
    }
}

impl<T> Drop for WriteHandle<T> {
    fn drop(&mut self) {
        if !self.published {
            debug!("discarding uncommitted metadata write");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Record {
        state: &'static str,
        tables: Vec<u32>,
    }

    fn record() -> CowObject<Record> {
        CowObject::new(Record {
            state: "initiated",
            tables: vec![1],
        })
    }

    #[tokio::test]
    async fn test_commit_publishes() {
        let obj = record();
        let mut handle = obj.lock_for_write().await;
        handle.mutable().state = "active";
        handle.mutable().tables.push(2);
        assert_eq!(obj.read().state, "initiated");
        handle.commit();
        assert_eq!(obj.read().state, "active");
        assert_eq!(obj.read().tables, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_drop_discards() {
        let obj = record();
        {
            let mut handle = obj.lock_for_write().await;
            handle.mutable().state = "deleting";
        }
        assert_eq!(obj.read().state, "initiated");
    }

    #[tokio::test]
    async fn test_writers_serialize() {
        let obj = record();
        let handle = obj.lock_for_write().await;
        assert!(obj.try_lock_for_write().is_none());
        drop(handle);
        assert!(obj.try_lock_for_write().is_some());
    }

    #[tokio::test]
    async fn test_readers_keep_old_snapshot() {
        let obj = record();
        let before = obj.read();
        let mut handle = obj.lock_for_write().await;
        handle.mutable().tables.clear();
        handle.commit();
        assert_eq!(before.tables, vec![1]);
        assert!(obj.read().tables.is_empty());
    }
}
