//! Object model: a fixed-capacity arena of heap objects addressed by index.

use std::{
    fmt,
    num::NonZeroUsize,
    sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
};

use once_cell::sync::OnceCell;

use crate::error::{GcError, GcResult};

/// Reference to an object in the arena. Field slots store `index + 1`, so
/// that zero can stand for null.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    pub(crate) fn from_index(index: usize) -> Self {
        match NonZeroUsize::new(index.wrapping_add(1)) {
            Some(raw) => Self(raw),
            None => unreachable!("arena index overflow"),
        }
    }

    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    pub fn to_raw(self) -> usize {
        self.0.get()
    }

    /// Position of the object in the arena.
    pub fn index(self) -> usize {
        self.0.get() - 1
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index())
    }
}

fn encode(value: Option<ObjectRef>) -> usize {
    value.map_or(0, ObjectRef::to_raw)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectKind {
    Regular,
    String,
    /// Reference object cleared only when soft references are being
    /// cleared. The referent lives in field 0.
    SoftReference,
    /// Reference object whose referent (field 0) does not keep its target
    /// alive.
    WeakReference,
}

impl ObjectKind {
    pub fn is_reference(self) -> bool {
        matches!(self, ObjectKind::SoftReference | ObjectKind::WeakReference)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Affiliation {
    Young = 0,
    Old = 1,
}

impl Affiliation {
    fn from_u8(value: u8) -> Self {
        if value == Affiliation::Old as u8 {
            Affiliation::Old
        } else {
            Affiliation::Young
        }
    }
}

pub struct HeapObject {
    kind: ObjectKind,
    affiliation: AtomicU8,
    dedup_requested: AtomicBool,
    fields: Box<[AtomicUsize]>,
}

impl HeapObject {
    pub fn new(kind: ObjectKind, affiliation: Affiliation, nfields: usize) -> Self {
        Self {
            kind,
            affiliation: AtomicU8::new(affiliation as u8),
            dedup_requested: AtomicBool::new(false),
            fields: (0..nfields).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn affiliation(&self) -> Affiliation {
        Affiliation::from_u8(self.affiliation.load(Ordering::Relaxed))
    }

    pub fn promote(&self) {
        self.affiliation
            .store(Affiliation::Old as u8, Ordering::Relaxed);
    }

    /// Number of reference fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Reads a field; out-of-range indices read as null.
    pub fn field(&self, index: usize) -> Option<ObjectRef> {
        self.fields
            .get(index)
            .and_then(|slot| ObjectRef::from_raw(slot.load(Ordering::Acquire)))
    }

    pub fn load_field(&self, index: usize) -> GcResult<Option<ObjectRef>> {
        let slot = self.fields.get(index).ok_or(GcError::InvalidReference)?;
        Ok(ObjectRef::from_raw(slot.load(Ordering::Acquire)))
    }

    /// Stores `value` and returns the previous content of the field.
    pub fn swap_field(&self, index: usize, value: Option<ObjectRef>) -> GcResult<Option<ObjectRef>> {
        let slot = self.fields.get(index).ok_or(GcError::InvalidReference)?;
        Ok(ObjectRef::from_raw(slot.swap(encode(value), Ordering::AcqRel)))
    }

    pub fn referent(&self) -> Option<ObjectRef> {
        debug_assert!(self.kind.is_reference());
        self.field(0)
    }

    pub fn clear_referent(&self) {
        debug_assert!(self.kind.is_reference());
        if let Some(slot) = self.fields.first() {
            slot.store(0, Ordering::Release);
        }
    }

    /// Returns true exactly once per object: for the first deduplication
    /// request.
    pub fn try_request_dedup(&self) -> bool {
        !self.dedup_requested.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapObject")
            .field("kind", &self.kind)
            .field("affiliation", &self.affiliation())
            .field("fields", &self.fields.len())
            .finish()
    }
}

/// Bump-allocated object storage. Objects are never freed; liveness is
/// reported by the marking context.
pub struct ObjectArena {
    slots: Box<[OnceCell<HeapObject>]>,
    top: AtomicUsize,
}

impl ObjectArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| OnceCell::new()).collect(),
            top: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index of the next object to be allocated.
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    pub fn allocate(&self, object: HeapObject) -> GcResult<ObjectRef> {
        let capacity = self.capacity();
        let index = self
            .top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| {
                (top < capacity).then(|| top + 1)
            })
            .map_err(|_| GcError::OutOfMemory)?;

        if self.slots[index].set(object).is_err() {
            unreachable!("arena slot {} claimed twice", index);
        }
        Ok(ObjectRef::from_index(index))
    }

    pub fn get(&self, obj: ObjectRef) -> Option<&HeapObject> {
        self.slots.get(obj.index()).and_then(OnceCell::get)
    }

    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.get(obj).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectRef, &HeapObject)> + '_ {
        self.slots[..self.top().min(self.capacity())]
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.get().map(|obj| (ObjectRef::from_index(index), obj)))
    }
}
