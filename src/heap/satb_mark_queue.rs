//! Snapshot-at-the-beginning logging.
//!
//! While concurrent marking is active, mutators record the previous value
//! of every overwritten reference (and every referent they load) in a
//! thread-local [`SatbMarkQueue`]. Full buffers are filtered and then handed
//! to the markers through the [`SatbMarkQueueSet`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use super::{marking_context::MarkingContext, object::ObjectRef, thread::Threads};

pub struct SatbMarkQueue {
    buf: Vec<ObjectRef>,
    capacity: usize,
    is_active: bool,
}

impl SatbMarkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            is_active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn set_active(&mut self, value: bool) {
        self.is_active = value;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    pub fn buffer(&self) -> &[ObjectRef] {
        &self.buf
    }

    fn push(&mut self, obj: ObjectRef) {
        debug_assert!(!self.is_full(), "SATB buffer overflow");
        self.buf.push(obj);
    }

    fn take_buffer(&mut self) -> Vec<ObjectRef> {
        std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity))
    }

    /// Applies `f` to every entry and empties the buffer.
    pub fn apply_closure_and_empty(&mut self, mut f: impl FnMut(ObjectRef)) {
        for obj in self.buf.drain(..) {
            f(obj);
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

pub struct SatbMarkQueueSet {
    list: SegQueue<Vec<ObjectRef>>,
    count: AtomicUsize,
    buffer_size: usize,
    buffer_enqueue_threshold: usize,
    all_active: AtomicBool,
}

impl SatbMarkQueueSet {
    pub fn new(buffer_size: usize, enqueue_threshold_percent: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        let enqueue_qty = buffer_size * enqueue_threshold_percent.min(100) / 100;
        Self {
            list: SegQueue::new(),
            count: AtomicUsize::new(0),
            buffer_size,
            buffer_enqueue_threshold: enqueue_qty.min(buffer_size - 1),
            all_active: AtomicBool::new(false),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// A filtered full buffer with more live entries than this is enqueued
    /// as completed; otherwise the thread keeps filling it.
    pub fn buffer_enqueue_threshold(&self) -> usize {
        self.buffer_enqueue_threshold
    }

    pub fn is_active(&self) -> bool {
        self.all_active.load(Ordering::Acquire)
    }

    /// The number of buffers in the list. Racy and not updated atomically
    /// with the set of completed buffers.
    pub fn completed_buffers_num(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn new_queue(&self) -> SatbMarkQueue {
        let mut queue = SatbMarkQueue::new(self.buffer_size);
        queue.set_active(self.is_active());
        queue
    }

    pub fn filter(&self, queue: &mut SatbMarkQueue, filter_out: impl Fn(ObjectRef) -> bool) {
        queue.buf.retain(|obj| !filter_out(*obj));
    }

    /// Drops entries that need no further processing: already marked
    /// objects and objects allocated after mark start.
    pub fn filter_marked(&self, queue: &mut SatbMarkQueue, ctx: &MarkingContext) {
        self.filter(queue, |obj| ctx.is_marked(obj));
    }

    pub fn enqueue(&self, queue: &mut SatbMarkQueue, obj: ObjectRef, ctx: &MarkingContext) {
        if !queue.is_active() {
            return;
        }
        if queue.is_full() {
            self.handle_full_buffer(queue, ctx);
        }
        queue.push(obj);
    }

    #[cold]
    #[inline(never)]
    fn handle_full_buffer(&self, queue: &mut SatbMarkQueue, ctx: &MarkingContext) {
        self.filter_marked(queue, ctx);
        if queue.len() > self.buffer_enqueue_threshold {
            self.enqueue_completed_buffer(queue.take_buffer());
        }
        debug_assert!(!queue.is_full());
    }

    pub fn flush_queue(&self, queue: &mut SatbMarkQueue, ctx: &MarkingContext) {
        // Filter now to possibly save work later.
        self.filter_marked(queue, ctx);
        if !queue.is_empty() {
            self.enqueue_completed_buffer(queue.take_buffer());
        }
    }

    pub fn enqueue_completed_buffer(&self, buffer: Vec<ObjectRef>) {
        self.list.push(buffer);
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn get_completed_buffer(&self) -> Option<Vec<ObjectRef>> {
        let buffer = self.list.pop()?;
        self.count.fetch_sub(1, Ordering::AcqRel);
        Some(buffer)
    }

    /// Applies `cl` to one completed buffer. Returns false if there was
    /// none.
    pub fn apply_closure_to_completed_buffer(&self, cl: impl FnOnce(&[ObjectRef])) -> bool {
        match self.get_completed_buffer() {
            Some(buffer) => {
                cl(&buffer);
                true
            }
            None => false,
        }
    }

    /// Must be called at a safepoint.
    pub fn set_active_all_threads(&self, threads: &Threads, active: bool, expected_active: bool) {
        debug_assert_eq!(
            self.is_active(),
            expected_active,
            "SATB queue set activation state mismatch"
        );
        self.all_active.store(active, Ordering::Release);

        threads.for_each(|thread| {
            let mut queue = thread.satb_mark_queue();
            debug_assert!(
                !active || queue.is_empty(),
                "queues should be empty when activated"
            );
            queue.reset();
            queue.set_active(active);
        });
    }

    pub fn abandon_completed_buffers(&self) {
        while self.get_completed_buffer().is_some() {}
    }

    /// Must be called at a safepoint.
    pub fn abandon_partial_marking(&self, threads: &Threads) {
        self.abandon_completed_buffers();
        threads.for_each(|thread| thread.satb_mark_queue().reset());
    }
}
