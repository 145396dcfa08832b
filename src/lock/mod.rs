//! Per-sector mutual exclusion.
//!
//! Each operation holds at most one sector lock at a time, so no lock
//! ordering is needed.

mod row_lock;

use crate::hash::SectorID;
use dashmap::DashMap;
use row_lock::RowLock;
use std::sync::Arc;

pub struct SectorLockTable {
    lock_map: DashMap<SectorID, Arc<RowLock>>,
}

impl SectorLockTable {
    pub fn new() -> SectorLockTable {
        SectorLockTable {
            lock_map: DashMap::with_capacity(16),
        }
    }

    /// Block until the caller has exclusive access to `id`.
    pub fn lock(&self, id: SectorID) -> SectorLockGuard<'_> {
        let row_lock = {
            // the shard stays write-locked while the reference is taken
            let entry = self
                .lock_map
                .entry(id)
                .or_insert_with(|| Arc::new(RowLock::default()));
            entry.acquire_ref();
            entry.value().clone()
        };
        row_lock.lock();
        SectorLockGuard {
            table: self,
            id,
            row_lock,
        }
    }

    fn unlock(&self, id: &SectorID, row_lock: &RowLock) {
        row_lock.unlock();
        self.lock_map
            .remove_if(id, |_, row_lock| row_lock.release_ref());
    }

    /// Number of sectors locked or waited for.
    pub fn len(&self) -> usize {
        self.lock_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_map.is_empty()
    }
}

impl Default for SectorLockTable {
    fn default() -> Self {
        SectorLockTable::new()
    }
}

pub struct SectorLockGuard<'a> {
    table: &'a SectorLockTable,
    id: SectorID,
    row_lock: Arc<RowLock>,
}

impl Drop for SectorLockGuard<'_> {
    fn drop(&mut self) {
        self.table.unlock(&self.id, &self.row_lock);
    }
}

#[cfg(test)]
mod tests {
    use crate::hash::{Salt, SectorID};
    use crate::lock::SectorLockTable;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn test_exclusive() {
        let _ = env_logger::try_init();
        let salt = Salt::generate();
        let id = SectorID::derive(&salt, &[1u8; 32]);
        let table = Arc::new(SectorLockTable::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let thread_cnt = 8;
        let barrier = Arc::new(Barrier::new(thread_cnt));

        let mut handles = vec![];
        for _ in 0..thread_cnt {
            let table = table.clone();
            let inside = inside.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let _guard = table.lock(id);
                    assert_eq!(0, inside.fetch_add(1, Ordering::SeqCst));
                    std::thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_distinct_sectors() {
        let salt = Salt::generate();
        let id1 = SectorID::derive(&salt, &[1u8; 32]);
        let id2 = SectorID::derive(&salt, &[2u8; 32]);
        let table = Arc::new(SectorLockTable::new());

        let guard1 = table.lock(id1);
        let table2 = table.clone();
        // a different sector is not blocked by `guard1`
        std::thread::spawn(move || {
            let _guard2 = table2.lock(id2);
        })
        .join()
        .unwrap();
        assert_eq!(1, table.len());

        let (sender, receiver) = crossbeam_channel::bounded(1);
        let table3 = table.clone();
        let handle = std::thread::spawn(move || {
            let _guard = table3.lock(id1);
            sender.send(()).unwrap();
        });
        assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());
        drop(guard1);
        receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert!(table.is_empty());
    }
}
