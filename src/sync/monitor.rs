use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};

/// A mutex paired with a condition variable, in the style of a HotSpot
/// `Monitor`.
pub struct Monitor<T> {
    lock: Mutex<T>,
    condvar: Condvar,
}

impl<T> Monitor<T> {
    pub fn new(val: T) -> Self {
        Self {
            lock: Mutex::new(val),
            condvar: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MonitorLock<'_, T> {
        MonitorLock::new(self)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.lock.get_mut()
    }
}

pub struct MonitorLock<'a, T> {
    lock: MutexGuard<'a, T>,
    condvar: &'a Condvar,
}

impl<'a, T> MonitorLock<'a, T> {
    pub fn new(monitor: &'a Monitor<T>) -> Self {
        Self {
            lock: monitor.lock.lock(),
            condvar: &monitor.condvar,
        }
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> WaitTimeoutResult {
        self.condvar.wait_for(&mut self.lock, timeout)
    }

    /// Temporarily releases the lock while `f` runs.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        MutexGuard::unlocked(&mut self.lock, f)
    }

    pub fn notify_one(&self) -> bool {
        self.condvar.notify_one()
    }

    pub fn notify_all(&self) -> usize {
        self.condvar.notify_all()
    }
}

impl<'a, T> Deref for MonitorLock<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.lock
    }
}

impl<'a, T> DerefMut for MonitorLock<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.lock
    }
}
