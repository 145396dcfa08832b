use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Exclusive lock of one sector.
#[derive(Default)]
pub struct RowLock {
    locked: Mutex<bool>,
    cond: Condvar,
    /// Holders and waiters. Only changed while the owning table entry is locked.
    refs: AtomicUsize,
}

impl RowLock {
    pub(super) fn acquire_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` when the last reference is gone.
    pub(super) fn release_ref(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(super) fn lock(&self) {
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            locked = self.cond.wait(locked).unwrap();
        }
        *locked = true;
    }

    pub(super) fn unlock(&self) {
        let mut locked = self.locked.lock().unwrap();
        debug_assert!(*locked);
        *locked = false;
        drop(locked);
        self.cond.notify_one();
    }
}
