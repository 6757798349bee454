//! Soft and weak reference discovery.
//!
//! While discovery is enabled the markers hand every reference object they
//! trace to [`ReferenceProcessor::discover_reference`]. A discovered
//! reference does not keep its referent alive; after marking,
//! [`ReferenceProcessor::process_references`] clears the referents that
//! stayed unmarked.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{
    heap::Heap,
    marking_context::MarkingContext,
    object::{HeapObject, ObjectKind, ObjectRef},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ReferenceProcessingStats {
    pub discovered: usize,
    pub cleared: usize,
    pub kept: usize,
}

pub struct ReferenceProcessor {
    discovery_enabled: AtomicBool,
    clear_all_soft_refs: AtomicBool,
    discovered: Mutex<Vec<ObjectRef>>,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self {
            discovery_enabled: AtomicBool::new(false),
            clear_all_soft_refs: AtomicBool::new(false),
            discovered: Mutex::new(Vec::new()),
        }
    }

    pub fn enable_discovery(&self) {
        self.discovery_enabled.store(true, Ordering::Release);
    }

    pub fn disable_discovery(&self) {
        self.discovery_enabled.store(false, Ordering::Release);
    }

    pub fn discovery_enabled(&self) -> bool {
        self.discovery_enabled.load(Ordering::Acquire)
    }

    /// Soft references are treated as strong unless `clear_all` is set.
    pub fn set_soft_reference_policy(&self, clear_all: bool) {
        self.clear_all_soft_refs.store(clear_all, Ordering::Release);
    }

    pub fn clears_all_soft_refs(&self) -> bool {
        self.clear_all_soft_refs.load(Ordering::Acquire)
    }

    /// Records `obj` for processing after marking. Returns false if the
    /// reference must be traced like an ordinary object, including its
    /// referent.
    pub fn discover_reference(&self, ctx: &MarkingContext, obj: ObjectRef, object: &HeapObject) -> bool {
        if !self.discovery_enabled() {
            return false;
        }

        match object.kind() {
            ObjectKind::WeakReference => {}
            ObjectKind::SoftReference if self.clears_all_soft_refs() => {}
            _ => return false,
        }

        match object.referent() {
            Some(referent) if !ctx.is_marked(referent) => {}
            _ => return false,
        }

        self.discovered.lock().push(obj);
        true
    }

    pub fn discovered_count(&self) -> usize {
        self.discovered.lock().len()
    }

    /// Drops everything discovered so far. Used when a marking cycle is
    /// abandoned.
    pub fn abandon_partial_discovery(&self) {
        let mut discovered = self.discovered.lock();
        log::debug!(target: "gc", "Abandoning {} discovered reference(s)", discovered.len());
        discovered.clear();
        self.disable_discovery();
    }

    /// Clears the referents that marking did not reach. Must run after
    /// marking completed.
    pub fn process_references(&self, heap: &Heap) -> ReferenceProcessingStats {
        debug_assert!(heap.marking_context().is_complete());
        self.disable_discovery();

        let discovered = std::mem::take(&mut *self.discovered.lock());
        let ctx = heap.marking_context();
        let mut stats = ReferenceProcessingStats {
            discovered: discovered.len(),
            ..Default::default()
        };

        for obj in discovered {
            let Some(object) = heap.object(obj) else {
                continue;
            };
            match object.referent() {
                Some(referent) if !ctx.is_marked(referent) => {
                    object.clear_referent();
                    stats.cleared += 1;
                }
                _ => stats.kept += 1,
            }
        }

        log::debug!(
            target: "gc",
            "Reference processing: {} discovered, {} cleared",
            stats.discovered,
            stats.cleared
        );
        stats
    }
}

impl Default for ReferenceProcessor {
    fn default() -> Self {
        Self::new()
    }
}
