//! This file contains all the rounding helpers for the heap.
//! Every page or word rounding in the crate goes through these functions.

/// It aligns `to_be_aligned` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. This method is used to round region sizes to
/// [`crate::config::PAGE_SIZE`] and block sizes to the machine word, because headers
/// and footers are read as typed values and their addresses must be aligned.
pub const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around when the
/// rounded value does not fit in a `usize`.
pub const fn checked_align(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    match to_be_aligned.checked_add(alignment - 1) {
        Some(value) => Some(value & !(alignment - 1)),
        None => None,
    }
}

/// It aligns `to_be_aligned` down to the previous multiple of `alignment`.
pub const fn align_down(to_be_aligned: usize, alignment: usize) -> usize {
    to_be_aligned & !(alignment - 1)
}

#[inline]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}
