//! Per-instance FIFO of in-flight batches (spec §4.4). Releases permits
//! and advances the durable offset strictly in submission order: a
//! stalled batch holds up later checkpoints but can never corrupt one
//! (invariant 2 of spec §3).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;
use crate::error::Result;
use crate::internal_events::{InternalEvent, OffsetCheckpoint};
use crate::memory_budget::MemoryBudget;
use crate::model::OffsetRecord;
use crate::offset_store::OffsetStore;

/// Opaque handle returned by `enqueue`, passed back to `mark_acked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHandle(u64);

struct Entry {
    id: u64,
    offset: String,
    length: u64,
    has_ack: bool,
}

struct Inner {
    entries: VecDeque<Entry>,
}

pub struct AckTracker {
    task_id: String,
    instance_id: String,
    inode: i64,
    pool: &'static str,
    memory: MemoryBudget,
    offset_store: OffsetStore,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl AckTracker {
    pub fn new(
        task_id: impl Into<String>,
        instance_id: impl Into<String>,
        inode: i64,
        pool: &'static str,
        memory: MemoryBudget,
        offset_store: OffsetStore,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            instance_id: instance_id.into(),
            inode,
            pool,
            memory,
            offset_store,
            next_id: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
            }),
        }
    }

    pub async fn enqueue(&self, offset: String, length: u64) -> AckHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        inner.entries.push_back(Entry {
            id,
            offset,
            length,
            has_ack: false,
        });
        AckHandle(id)
    }

    /// Idempotent: flipping an already-acked (or already-drained) handle
    /// is a no-op.
    pub async fn mark_acked(&self, handle: AckHandle) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.id == handle.0) {
            entry.has_ack = true;
        }
    }

    /// Pops a prefix of acked entries, releasing permits for each and
    /// persisting only the last popped entry's offset.
    pub async fn drain(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut last_released: Option<Entry> = None;
        while let Some(front) = inner.entries.front() {
            if !front.has_ack {
                break;
            }
            let entry = inner.entries.pop_front().expect("front just peeked");
            self.memory.release(self.pool, entry.length);
            last_released = Some(entry);
        }
        drop(inner);

        if let Some(entry) = last_released {
            OffsetCheckpoint {
                task_id: &self.task_id,
                instance_id: &self.instance_id,
                offset: &entry.offset,
            }
            .emit();
            self.offset_store.put(OffsetRecord {
                task_id: self.task_id.clone(),
                instance_id: self.instance_id.clone(),
                offset: entry.offset,
                inode: self.inode,
                last_update_time: Utc::now(),
            })?;
        }
        Ok(())
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Releases permits for all remaining entries without persisting;
    /// used on shutdown.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        for entry in inner.entries.drain(..) {
            self.memory.release(self.pool, entry.length);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp_store() -> (tempfile::TempDir, OffsetStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (dir, OffsetStore::open(&db).unwrap())
    }

    #[tokio::test]
    async fn drain_stops_at_first_unacked() {
        let (_dir, store) = open_temp_store();
        let memory = MemoryBudget::new();
        memory.register_pool("p", 1000);
        let tracker = AckTracker::new("t1", "i1", 0, "p", memory.clone(), store.clone());

        memory.try_acquire("p", 10);
        let h1 = tracker.enqueue("10".into(), 10).await;
        memory.try_acquire("p", 10);
        let h2 = tracker.enqueue("20".into(), 10).await;
        memory.try_acquire("p", 10);
        let _h3 = tracker.enqueue("30".into(), 10).await;

        tracker.mark_acked(h2).await; // out of order ack, should not release yet
        tracker.drain().await.unwrap();
        assert_eq!(memory.used("p"), 30); // nothing released, h1 not acked
        assert!(store.get("t1", "i1").unwrap().is_none());

        tracker.mark_acked(h1).await;
        tracker.drain().await.unwrap();
        assert_eq!(memory.used("p"), 10); // h1 and h2 released
        assert_eq!(store.get("t1", "i1").unwrap().unwrap().offset, "20");
    }

    #[tokio::test]
    async fn clear_releases_all_without_persisting() {
        let (_dir, store) = open_temp_store();
        let memory = MemoryBudget::new();
        memory.register_pool("p", 1000);
        let tracker = AckTracker::new("t1", "i1", 0, "p", memory.clone(), store.clone());
        memory.try_acquire("p", 10);
        tracker.enqueue("10".into(), 10).await;
        tracker.clear().await;
        assert_eq!(memory.used("p"), 0);
        assert!(store.get("t1", "i1").unwrap().is_none());
        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn mark_acked_is_idempotent() {
        let (_dir, store) = open_temp_store();
        let memory = MemoryBudget::new();
        memory.register_pool("p", 1000);
        let tracker = AckTracker::new("t1", "i1", 0, "p", memory.clone(), store.clone());
        memory.try_acquire("p", 10);
        let h = tracker.enqueue("10".into(), 10).await;
        tracker.mark_acked(h).await;
        tracker.mark_acked(h).await;
        tracker.drain().await.unwrap();
        assert_eq!(memory.used("p"), 0);
    }
}
