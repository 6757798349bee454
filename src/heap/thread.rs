use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::{
    code_roots::NMethod,
    heap::Heap,
    object::{Affiliation, HeapObject, ObjectKind, ObjectRef},
    satb_mark_queue::SatbMarkQueue,
};
use crate::error::{GcError, GcResult};

/// Per-thread state the collector needs from a mutator: its SATB log and
/// its local roots (handles).
pub struct MutatorThread {
    id: usize,
    satb_mark_queue: Mutex<SatbMarkQueue>,
    roots: Mutex<Vec<ObjectRef>>,
    claimed: AtomicUsize,
}

impl MutatorThread {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn satb_mark_queue(&self) -> MutexGuard<'_, SatbMarkQueue> {
        self.satb_mark_queue.lock()
    }

    pub fn roots(&self) -> Vec<ObjectRef> {
        self.roots.lock().clone()
    }

    /// Claims this thread for the parallel iteration identified by `token`.
    /// Returns true for exactly one caller per token.
    pub fn claim_threads_do(&self, token: usize) -> bool {
        let claimed = self.claimed.load(Ordering::Relaxed);
        if claimed == token {
            return false;
        }
        self.claimed
            .compare_exchange(claimed, token, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// Registry of attached mutator threads.
pub struct Threads {
    threads: RwLock<Vec<Arc<MutatorThread>>>,
    next_id: AtomicUsize,
    thread_claim_token: AtomicUsize,
}

impl Threads {
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            thread_claim_token: AtomicUsize::new(0),
        }
    }

    pub fn register(&self, satb_mark_queue: SatbMarkQueue) -> Arc<MutatorThread> {
        let thread = Arc::new(MutatorThread {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            satb_mark_queue: Mutex::new(satb_mark_queue),
            roots: Mutex::new(Vec::new()),
            claimed: AtomicUsize::new(self.thread_claim_token.load(Ordering::Relaxed)),
        });
        self.threads.write().push(thread.clone());
        log::trace!(target: "gc", "Registered mutator thread {}", thread.id);
        thread
    }

    pub fn unregister(&self, thread: &MutatorThread) -> GcResult<()> {
        let mut threads = self.threads.write();
        let position = threads
            .iter()
            .position(|t| t.id == thread.id)
            .ok_or(GcError::ThreadNotRegistered)?;
        threads.swap_remove(position);
        log::trace!(target: "gc", "Unregistered mutator thread {}", thread.id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }

    pub fn for_each(&self, mut f: impl FnMut(&MutatorThread)) {
        for thread in self.threads.read().iter() {
            f(thread);
        }
    }

    /// Runs `op` against every thread while holding that thread's SATB
    /// queue lock, so the thread cannot log concurrently.
    pub fn handshake(&self, mut op: impl FnMut(&MutatorThread, &mut SatbMarkQueue)) {
        let threads = self.threads.read();
        for thread in threads.iter() {
            let mut queue = thread.satb_mark_queue();
            op(thread, &mut queue);
        }
        log::trace!(target: "gc", "Handshake with {} thread(s)", threads.len());
    }

    /// Starts a new parallel iteration; see [`possibly_parallel_threads_do`](Self::possibly_parallel_threads_do).
    pub fn change_thread_claim_token(&self) -> usize {
        self.thread_claim_token.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Applies `f` to every thread not yet claimed under `token`. Several
    /// workers may call this concurrently; each thread is visited once.
    pub fn possibly_parallel_threads_do(&self, token: usize, mut f: impl FnMut(&MutatorThread)) {
        for thread in self.threads.read().iter() {
            if thread.claim_threads_do(token) {
                f(thread);
            }
        }
    }
}

impl Default for Threads {
    fn default() -> Self {
        Self::new()
    }
}

/// GC Mutator.
///
/// Handle of an attached thread. Allocation, field access and root
/// registration go through it, so the collector can insert its barriers and
/// stop the thread at safepoints. Dropping the handle detaches the thread.
pub struct Mutator<'h> {
    heap: &'h Heap,
    thread: Arc<MutatorThread>,
}

impl<'h> Mutator<'h> {
    pub(crate) fn attach(heap: &'h Heap) -> Self {
        let _sp = heap.safepoint().enter_mutator();
        let queue = heap.satb_mark_queue_set().new_queue();
        let thread = heap.threads().register(queue);
        Self { heap, thread }
    }

    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    pub fn thread(&self) -> &MutatorThread {
        &self.thread
    }

    pub fn allocate(&self, kind: ObjectKind, nfields: usize) -> GcResult<ObjectRef> {
        self.allocate_in(kind, nfields, Affiliation::Young)
    }

    pub fn allocate_old(&self, kind: ObjectKind, nfields: usize) -> GcResult<ObjectRef> {
        self.allocate_in(kind, nfields, Affiliation::Old)
    }

    fn allocate_in(&self, kind: ObjectKind, nfields: usize, affiliation: Affiliation) -> GcResult<ObjectRef> {
        if kind.is_reference() && nfields == 0 {
            return Err(GcError::InvalidArgument {
                name: "nfields",
                value: nfields.to_string(),
            });
        }
        let _sp = self.heap.safepoint().enter_mutator();
        // Objects above top-at-mark-start are implicitly marked, so new
        // objects are allocated black while marking is in progress.
        self.heap
            .arena()
            .allocate(HeapObject::new(kind, affiliation, nfields))
    }

    fn object(&self, obj: ObjectRef) -> GcResult<&'h HeapObject> {
        self.heap.object(obj).ok_or(GcError::InvalidReference)
    }

    pub fn load(&self, obj: ObjectRef, field: usize) -> GcResult<Option<ObjectRef>> {
        let _sp = self.heap.safepoint().enter_mutator();
        let object = self.object(obj)?;
        let value = object.load_field(field)?;

        // Keep-alive barrier: a referent that escapes into the mutator must
        // survive the current marking cycle.
        if field == 0 && object.kind().is_reference() && self.heap.is_concurrent_mark_in_progress() {
            if let Some(referent) = value {
                self.satb_enqueue(referent);
            }
        }
        Ok(value)
    }

    pub fn store(&self, obj: ObjectRef, field: usize, value: Option<ObjectRef>) -> GcResult<()> {
        let _sp = self.heap.safepoint().enter_mutator();
        let object = self.object(obj)?;
        if let Some(value) = value {
            self.object(value)?;
        }

        let previous = object.swap_field(field, value)?;

        // SATB pre-write barrier.
        if self.heap.is_concurrent_mark_in_progress() {
            if let Some(previous) = previous {
                self.satb_enqueue(previous);
            }
        }
        Ok(())
    }

    pub fn promote(&self, obj: ObjectRef) -> GcResult<()> {
        let _sp = self.heap.safepoint().enter_mutator();
        self.object(obj)?.promote();
        Ok(())
    }

    pub fn add_root(&self, obj: ObjectRef) -> GcResult<()> {
        let _sp = self.heap.safepoint().enter_mutator();
        self.object(obj)?;
        self.thread.roots.lock().push(obj);
        Ok(())
    }

    /// Removes the most recently added occurrence of `obj`. Returns false if
    /// it was not a root of this thread.
    pub fn remove_root(&self, obj: ObjectRef) -> bool {
        let _sp = self.heap.safepoint().enter_mutator();
        let mut roots = self.thread.roots.lock();
        match roots.iter().rposition(|root| *root == obj) {
            Some(position) => {
                roots.remove(position);
                true
            }
            None => false,
        }
    }

    /// Enters compiled code: runs the entry barrier of an armed method.
    pub fn call_nmethod(&self, nm: &NMethod) {
        let _sp = self.heap.safepoint().enter_mutator();
        if !self.heap.code_cache().is_armed(nm) {
            return;
        }
        if self.heap.is_concurrent_mark_in_progress() {
            nm.oops_do(|obj| self.satb_enqueue(obj));
        }
        self.heap.code_cache().disarm(nm);
    }

    fn satb_enqueue(&self, obj: ObjectRef) {
        let mut queue = self.thread.satb_mark_queue();
        self.heap
            .satb_mark_queue_set()
            .enqueue(&mut queue, obj, self.heap.marking_context());
    }
}

impl Drop for Mutator<'_> {
    fn drop(&mut self) {
        let _sp = self.heap.safepoint().enter_mutator();
        {
            // Entries logged by this thread must still reach the markers.
            let mut queue = self.thread.satb_mark_queue();
            self.heap
                .satb_mark_queue_set()
                .flush_queue(&mut queue, self.heap.marking_context());
        }
        if let Err(err) = self.heap.threads().unregister(&self.thread) {
            log::warn!(target: "gc", "Failed to detach mutator thread {}: {}", self.thread.id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::heap::arguments::HeapArguments;

    fn heap() -> Heap {
        Heap::new(HeapArguments {
            parallel_gc_threads: 2,
            conc_gc_threads: 1,
            max_objects: 64,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_possibly_parallel_threads_do_claims_once() {
        let threads = Threads::new();
        for _ in 0..8 {
            threads.register(SatbMarkQueue::new(4));
        }

        let token = threads.change_thread_claim_token();
        let visited = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    threads.possibly_parallel_threads_do(token, |_| {
                        visited.fetch_add(1, Ordering::Relaxed);
                    })
                });
            }
        });
        assert_eq!(visited.load(Ordering::Relaxed), 8);

        let token = threads.change_thread_claim_token();
        let mut again = 0;
        threads.possibly_parallel_threads_do(token, |_| again += 1);
        assert_eq!(again, 8);
    }

    #[test]
    fn test_attach_and_detach() {
        let heap = heap();
        {
            let mutator = heap.attach_thread();
            assert_eq!(heap.threads().len(), 1);
            let obj = mutator.allocate(ObjectKind::Regular, 2).unwrap();
            mutator.add_root(obj).unwrap();
            assert_eq!(mutator.thread().roots(), vec![obj]);
            assert!(mutator.remove_root(obj));
            assert!(!mutator.remove_root(obj));
        }
        assert!(heap.threads().is_empty());
    }

    #[test]
    fn test_store_validates_references() {
        let heap = heap();
        let mutator = heap.attach_thread();
        let obj = mutator.allocate(ObjectKind::Regular, 1).unwrap();
        let bogus = ObjectRef::from_index(40);

        assert_eq!(mutator.store(obj, 0, Some(bogus)), Err(GcError::InvalidReference));
        assert_eq!(mutator.store(obj, 3, None), Err(GcError::InvalidReference));
        assert_eq!(mutator.load(bogus, 0), Err(GcError::InvalidReference));
        assert!(matches!(
            mutator.allocate(ObjectKind::WeakReference, 0),
            Err(GcError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_pre_write_barrier_logs_old_value() {
        let heap = heap();
        let mutator = heap.attach_thread();
        let a = mutator.allocate(ObjectKind::Regular, 1).unwrap();
        let b = mutator.allocate(ObjectKind::Regular, 0).unwrap();
        mutator.store(a, 0, Some(b)).unwrap();
        assert!(mutator.thread().satb_mark_queue().is_empty());

        {
            let _sp = heap.safepoint().begin();
            heap.prepare_gc();
            heap.set_concurrent_mark_in_progress(true);
        }

        mutator.store(a, 0, None).unwrap();
        assert_eq!(mutator.thread().satb_mark_queue().buffer(), &[b]);

        {
            let _sp = heap.safepoint().begin();
            heap.set_concurrent_mark_in_progress(false);
        }
        assert!(mutator.thread().satb_mark_queue().is_empty());
    }

    #[test]
    fn test_keep_alive_on_referent_load() {
        let heap = heap();
        let mutator = heap.attach_thread();
        let weak = mutator.allocate(ObjectKind::WeakReference, 1).unwrap();
        let referent = mutator.allocate(ObjectKind::Regular, 0).unwrap();
        mutator.store(weak, 0, Some(referent)).unwrap();

        {
            let _sp = heap.safepoint().begin();
            heap.prepare_gc();
            heap.set_concurrent_mark_in_progress(true);
        }
        assert_eq!(mutator.load(weak, 0).unwrap(), Some(referent));
        assert_eq!(mutator.thread().satb_mark_queue().buffer(), &[referent]);

        {
            let _sp = heap.safepoint().begin();
            heap.set_concurrent_mark_in_progress(false);
        }
    }
}
