use std::ops::Range;

use thiserror::Error;

/// The page backing could not supply (or release) the pages of `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("page backing failed for {start:#x}..{end:#x}")]
pub struct BackingError {
    pub start: usize,
    pub end: usize,
}

impl BackingError {
    pub fn new(range: Range<usize>) -> Self {
        Self {
            start: range.start,
            end: range.end,
        }
    }
}

/// Errors reported by [`crate::Heap`] operations.
///
/// None of them is fatal to the heap itself: a failed operation leaves the
/// heap exactly as it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// Growing to `requested` bytes would cross the maximum address.
    #[error("growing the heap to {requested:#x} bytes would cross its maximum address {max:#x}")]
    OutOfAddressSpace { requested: usize, max: usize },

    /// The page backing could not supply physical memory.
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] BackingError),

    /// A header or footer did not carry the expected magic value, or does not
    /// agree with its neighbours.
    #[error("corrupted block metadata at {address:#x}")]
    CorruptedMetadata { address: usize },

    #[error("free list is full ({capacity} entries)")]
    FreeListFull { capacity: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

pub type Result<T> = std::result::Result<T, HeapError>;
