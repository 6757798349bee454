use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::{object::ObjectRef, shared_vars::SharedFlag};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Mark bitmap over the object arena together with the top-at-mark-start
/// snapshot.
///
/// Objects at or above TAMS were allocated after marking started. They are
/// implicitly live and never traced.
pub struct MarkingContext {
    mark_bit_map: Box<[AtomicU64]>,
    top_at_mark_start: AtomicUsize,
    marked: AtomicUsize,
    is_complete: SharedFlag,
}

impl MarkingContext {
    pub fn new(capacity: usize) -> Self {
        let words = (capacity + BITS_PER_WORD - 1) / BITS_PER_WORD;
        Self {
            mark_bit_map: (0..words).map(|_| AtomicU64::new(0)).collect(),
            top_at_mark_start: AtomicUsize::new(0),
            marked: AtomicUsize::new(0),
            is_complete: SharedFlag::new(),
        }
    }

    fn bit(index: usize) -> (usize, u64) {
        (index / BITS_PER_WORD, 1u64 << (index % BITS_PER_WORD))
    }

    pub fn top_at_mark_start(&self) -> usize {
        self.top_at_mark_start.load(Ordering::Acquire)
    }

    pub fn capture_top_at_mark_start(&self, top: usize) {
        self.top_at_mark_start.store(top, Ordering::Release);
    }

    pub fn allocated_after_mark_start(&self, obj: ObjectRef) -> bool {
        obj.index() >= self.top_at_mark_start()
    }

    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        if self.allocated_after_mark_start(obj) {
            return true;
        }
        let (word, mask) = Self::bit(obj.index());
        self.mark_bit_map
            .get(word)
            .map_or(false, |w| w.load(Ordering::Acquire) & mask != 0)
    }

    /// Marks the object. Returns true if the object has not been marked before and has
    /// been marked by this thread. Returns false if the object has already been marked,
    /// if a competing thread succeeded in marking this object, or if the object was
    /// allocated after mark start.
    pub fn mark(&self, obj: ObjectRef) -> bool {
        if self.allocated_after_mark_start(obj) {
            return false;
        }
        let (word, mask) = Self::bit(obj.index());
        let Some(word) = self.mark_bit_map.get(word) else {
            return false;
        };
        let marked = word.fetch_or(mask, Ordering::AcqRel) & mask == 0;
        if marked {
            self.marked.fetch_add(1, Ordering::Relaxed);
        }
        marked
    }

    /// Number of objects marked explicitly since the bitmap was last cleared.
    pub fn marked_count(&self) -> usize {
        self.marked.load(Ordering::Relaxed)
    }

    pub fn clear_bitmap(&self) {
        for word in self.mark_bit_map.iter() {
            word.store(0, Ordering::Relaxed);
        }
        self.marked.store(0, Ordering::Relaxed);
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete.is_set()
    }

    pub fn mark_complete(&self) {
        self.is_complete.set();
    }

    pub fn mark_incomplete(&self) {
        self.is_complete.unset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_once() {
        let ctx = MarkingContext::new(130);
        ctx.capture_top_at_mark_start(100);
        let obj = ObjectRef::from_index(70);

        assert!(!ctx.is_marked(obj));
        assert!(ctx.mark(obj));
        assert!(!ctx.mark(obj));
        assert!(ctx.is_marked(obj));
        assert_eq!(ctx.marked_count(), 1);

        ctx.clear_bitmap();
        assert!(!ctx.is_marked(obj));
        assert_eq!(ctx.marked_count(), 0);
    }

    #[test]
    fn test_allocated_black() {
        let ctx = MarkingContext::new(130);
        ctx.capture_top_at_mark_start(100);
        let young = ObjectRef::from_index(120);
        assert!(ctx.is_marked(young));
        assert!(!ctx.mark(young));
        assert_eq!(ctx.marked_count(), 0);
    }
}
