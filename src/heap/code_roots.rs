//! Compiled-code roots and their entry barriers.
//!
//! An [`NMethod`] embeds object references. Arming the code cache makes
//! every method run its entry barrier on the next call; during concurrent
//! marking the barrier logs the embedded references so they survive the
//! cycle, then disarms the method.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::RwLock;

use super::object::ObjectRef;

pub struct NMethod {
    oops: Box<[ObjectRef]>,
    guard: AtomicUsize,
}

impl NMethod {
    pub fn oops(&self) -> &[ObjectRef] {
        &self.oops
    }

    pub fn oops_do(&self, mut f: impl FnMut(ObjectRef)) {
        for obj in self.oops.iter() {
            f(*obj);
        }
    }
}

pub struct CodeCache {
    nmethods: RwLock<Vec<Arc<NMethod>>>,
    disarmed_value: AtomicUsize,
}

impl CodeCache {
    pub fn new() -> Self {
        Self {
            nmethods: RwLock::new(Vec::new()),
            disarmed_value: AtomicUsize::new(0),
        }
    }

    pub fn register(&self, oops: Vec<ObjectRef>) -> Arc<NMethod> {
        let nm = Arc::new(NMethod {
            oops: oops.into_boxed_slice(),
            guard: AtomicUsize::new(self.disarmed_value.load(Ordering::Acquire)),
        });
        self.nmethods.write().push(nm.clone());
        nm
    }

    pub fn unregister(&self, nm: &Arc<NMethod>) -> bool {
        let mut nmethods = self.nmethods.write();
        match nmethods.iter().position(|m| Arc::ptr_eq(m, nm)) {
            Some(position) => {
                nmethods.swap_remove(position);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nmethods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nmethods.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<NMethod>> {
        self.nmethods.read().clone()
    }

    /// Arms the entry barrier of every registered method.
    pub fn arm_nmethods(&self) {
        self.disarmed_value.fetch_add(1, Ordering::AcqRel);
    }

    pub fn disarm_nmethods(&self) {
        let disarmed = self.disarmed_value.load(Ordering::Acquire);
        for nm in self.nmethods.read().iter() {
            nm.guard.store(disarmed, Ordering::Release);
        }
    }

    pub fn is_armed(&self, nm: &NMethod) -> bool {
        nm.guard.load(Ordering::Acquire) != self.disarmed_value.load(Ordering::Acquire)
    }

    pub fn disarm(&self, nm: &NMethod) {
        nm.guard
            .store(self.disarmed_value.load(Ordering::Acquire), Ordering::Release);
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}
