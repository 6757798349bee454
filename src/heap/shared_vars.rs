use std::sync::atomic::{AtomicU8, Ordering};

pub type SharedValue = AtomicU8;

/// Boolean flag shared between mutators and GC workers.
pub struct SharedFlag(SharedValue);

impl SharedFlag {
    pub const fn new() -> Self {
        Self(SharedValue::new(0))
    }

    pub fn set(&self) {
        self.0.store(1, Ordering::Release);
    }

    pub fn unset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) == 1
    }

    pub fn is_unset(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    pub fn set_cond(&self, c: bool) {
        if c {
            self.set();
        } else {
            self.unset();
        }
    }
}

impl Default for SharedFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Small enum-valued state shared between threads.
pub struct SharedEnumFlag(SharedValue);

impl SharedEnumFlag {
    pub const fn new(initial: u8) -> Self {
        Self(SharedValue::new(initial))
    }

    pub fn set(&self, val: u8) {
        self.0.store(val, Ordering::Release);
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    /// Returns the value observed before the exchange attempt.
    pub fn cmpxchg(&self, old: u8, new: u8) -> u8 {
        match self
            .0
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(val) => val,
            Err(val) => val,
        }
    }
}
