use std::sync::atomic::{AtomicUsize, Ordering};

use super::{heap::Heap, object::ObjectRef};

const GLOBAL_ROOTS_CHUNK: usize = 256;

/// Snapshot of the root set split into chunks that parallel workers claim.
///
/// Created at a safepoint: thread handles, global roots and the references
/// embedded in compiled code are copied, so scanning does not race with
/// mutators that resume afterwards.
pub struct RootScanner {
    chunks: Vec<Vec<ObjectRef>>,
    claimed: AtomicUsize,
}

impl RootScanner {
    pub fn new(heap: &Heap) -> Self {
        let mut chunks = Vec::new();

        heap.threads().for_each(|thread| {
            let roots = thread.roots();
            if !roots.is_empty() {
                chunks.push(roots);
            }
        });

        chunks.extend(
            heap.global_roots()
                .chunks(GLOBAL_ROOTS_CHUNK)
                .map(<[ObjectRef]>::to_vec),
        );

        for nm in heap.code_cache().snapshot() {
            if !nm.oops().is_empty() {
                chunks.push(nm.oops().to_vec());
            }
        }

        log::trace!(target: "gc-roots", "{} root chunk(s)", chunks.len());
        Self {
            chunks,
            claimed: AtomicUsize::new(0),
        }
    }

    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn roots(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.chunks.iter().flatten().copied()
    }

    /// Claims chunks until none are left and applies `f` to every root in
    /// them. Safe to call from several workers at once; each root is seen
    /// by exactly one of them.
    pub fn roots_do(&self, worker_id: usize, mut f: impl FnMut(ObjectRef)) {
        let mut scanned = 0;
        loop {
            let index = self.claimed.fetch_add(1, Ordering::AcqRel);
            let Some(chunk) = self.chunks.get(index) else {
                break;
            };
            for root in chunk.iter() {
                f(*root);
            }
            scanned += chunk.len();
        }
        log::trace!(target: "gc-roots", "worker {} scanned {} root(s)", worker_id, scanned);
    }
}
