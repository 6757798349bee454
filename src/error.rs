//! Error types for heap construction, configuration and the mutator API.
//!
//! Marking itself never fails: cancellation travels through
//! [`Heap::cancelled_gc`](crate::heap::heap::Heap::cancelled_gc) and the
//! termination protocol's boolean results.

use std::fmt;

/// Errors surfaced by the mutator-facing API and by configuration parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    /// The object arena has no free slots left.
    OutOfMemory,
    /// A tunable could not be parsed or is out of range.
    InvalidArgument { name: &'static str, value: String },
    /// The calling thread was never attached to the heap.
    ThreadNotRegistered,
    /// An object reference or field index does not name a live slot.
    InvalidReference,
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::OutOfMemory => write!(f, "Out of memory"),
            GcError::InvalidArgument { name, value } => {
                write!(f, "Invalid value for {}: {:?}", name, value)
            }
            GcError::ThreadNotRegistered => write!(f, "Thread is not registered with the heap"),
            GcError::InvalidReference => write!(f, "Invalid object reference"),
        }
    }
}

impl std::error::Error for GcError {}

/// Result type for heap operations.
pub type GcResult<T> = Result<T, GcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(GcError::OutOfMemory.to_string(), "Out of memory");
        let err = GcError::InvalidArgument {
            name: "RSGC_MARK_LOOP_STRIDE",
            value: "abc".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value for RSGC_MARK_LOOP_STRIDE: \"abc\""
        );
    }
}
