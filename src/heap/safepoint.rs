use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Stop-the-world synchronization.
///
/// Every mutator heap access holds the read side of a lock for its
/// duration; a safepoint holds the write side. While a [`SafepointGuard`]
/// lives no mutator is inside the heap, and mutators arriving at the heap
/// block until the guard is dropped.
pub struct SafepointSynchronize {
    lock: RwLock<()>,
    at_safepoint: AtomicBool,
}

impl SafepointSynchronize {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            at_safepoint: AtomicBool::new(false),
        }
    }

    /// Stops the world. Must not be called from inside a mutator heap access.
    pub fn begin(&self) -> SafepointGuard<'_> {
        let start = Instant::now();
        let guard = self.lock.write();
        self.at_safepoint.store(true, Ordering::Release);
        log::debug!(target: "gc-safepoint", "stopped the world in {} ms", start.elapsed().as_micros() as f64 / 1000.0);
        SafepointGuard {
            sync: self,
            start: Instant::now(),
            _guard: guard,
        }
    }

    pub fn is_at_safepoint(&self) -> bool {
        self.at_safepoint.load(Ordering::Acquire)
    }

    pub(crate) fn enter_mutator(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }
}

impl Default for SafepointSynchronize {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SafepointGuard<'a> {
    sync: &'a SafepointSynchronize,
    start: Instant,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        self.sync.at_safepoint.store(false, Ordering::Release);
        log::debug!(target: "gc-safepoint", "resumed the world after {} ms", self.start.elapsed().as_micros() as f64 / 1000.0);
    }
}
