use super::{
    heap::Heap,
    object::{Affiliation, HeapObject, ObjectKind, ObjectRef},
};

const REQUESTS_BUFFER_SIZE: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StringDedupMode {
    NoDedup,
    /// Only young strings are candidates. Old strings were offered when
    /// they were young.
    EnqueueCandidate,
    AlwaysDedup,
}

impl StringDedupMode {
    pub fn for_heap(heap: &Heap) -> Self {
        if heap.args().string_dedup {
            StringDedupMode::EnqueueCandidate
        } else {
            StringDedupMode::NoDedup
        }
    }

    /// Full collections offer every reachable string, old ones included.
    pub fn for_full_gc(heap: &Heap) -> Self {
        if heap.args().string_dedup {
            StringDedupMode::AlwaysDedup
        } else {
            StringDedupMode::NoDedup
        }
    }

    fn is_candidate(self, object: &HeapObject) -> bool {
        if object.kind() != ObjectKind::String {
            return false;
        }
        match self {
            StringDedupMode::NoDedup => false,
            StringDedupMode::EnqueueCandidate => object.affiliation() == Affiliation::Young,
            StringDedupMode::AlwaysDedup => true,
        }
    }
}

/// Per-worker buffer of deduplication requests, published to the heap in
/// batches and when dropped.
pub struct StringDedupRequests<'a> {
    heap: &'a Heap,
    buffer: Vec<ObjectRef>,
}

impl<'a> StringDedupRequests<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self {
            heap,
            buffer: Vec::new(),
        }
    }

    /// Requests deduplication of a marked string. Each string is requested
    /// at most once over its lifetime.
    pub fn add(&mut self, mode: StringDedupMode, obj: ObjectRef, object: &HeapObject) {
        if !mode.is_candidate(object) || !object.try_request_dedup() {
            return;
        }
        self.buffer.push(obj);
        if self.buffer.len() >= REQUESTS_BUFFER_SIZE {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if !self.buffer.is_empty() {
            self.heap.enqueue_string_dedup_requests(self.buffer.drain(..));
        }
    }
}

impl Drop for StringDedupRequests<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}
