use std::ops::Range;

use crate::{
    config::PAGE_SIZE,
    error::{HeapError, Result},
    kernel::PageBacking,
    utils::{align_down, checked_align},
};

/// The part of the heap span blocks can live in.
///
/// ```text
///  start                      end                               max
///    +-------------------------+---------------------------------+
///    |    blocks (backed)      |    reserved, not backed yet     |
///    +-------------------------+---------------------------------+
///    <-------- size() -------->
/// ```
///
/// `start` and `end` are always page aligned. The region grows towards `max`
/// and shrinks back, but never below `min_size`. Every change of `end` goes
/// through the [`PageBacking`] first, and `end` only moves once the backing
/// succeeded.
#[derive(Debug)]
pub(crate) struct Region<B> {
    start: usize,
    end: usize,
    max: usize,
    min_size: usize,
    backing: B,
}

impl<B: PageBacking> Region<B> {
    /// `start`, `end` and `min_size` must be page aligned, and
    /// `start <= end <= max`.
    pub fn new(start: usize, end: usize, max: usize, min_size: usize, backing: B) -> Self {
        debug_assert!(start % PAGE_SIZE == 0 && end % PAGE_SIZE == 0 && min_size % PAGE_SIZE == 0);
        debug_assert!(start <= end && end <= max);

        Self {
            start,
            end,
            max,
            min_size,
            backing,
        }
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn max(&self) -> usize {
        self.max
    }

    #[inline]
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn bounds(&self) -> Range<usize> {
        self.start..self.end
    }

    #[inline]
    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Grows the region to `new_size` bytes rounded up to a page, and returns the
    /// resulting size. Asking for the current size or less changes nothing.
    pub fn grow(&mut self, new_size: usize) -> Result<usize> {
        let out_of_space = HeapError::OutOfAddressSpace {
            requested: new_size,
            max: self.max,
        };

        let new_size = checked_align(new_size, PAGE_SIZE).ok_or(out_of_space)?;

        if new_size <= self.size() {
            return Ok(self.size());
        }

        let new_end = match self.start.checked_add(new_size) {
            Some(new_end) if new_end <= self.max => new_end,
            _ => return Err(out_of_space),
        };

        self.backing.back(self.end..new_end)?;

        log::debug!("heap grown from {:#x} to {:#x}", self.end, new_end);
        self.end = new_end;

        Ok(self.size())
    }

    /// Shrinks the region to `new_size` bytes rounded down to a page, never
    /// below the minimum size, and returns the resulting size. Asking for the
    /// current size or more changes nothing.
    pub fn shrink(&mut self, new_size: usize) -> Result<usize> {
        let new_size = align_down(new_size, PAGE_SIZE).max(self.min_size);

        if new_size >= self.size() {
            return Ok(self.size());
        }

        let new_end = self.start + new_size;

        self.backing.unback(new_end..self.end)?;

        log::debug!("heap shrunk from {:#x} to {:#x}", self.end, new_end);
        self.end = new_end;

        Ok(self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackingError;

    /// Records every call and refuses to back more than `budget` bytes at once.
    #[derive(Default)]
    struct Recorder {
        budget: Option<usize>,
        backed: Vec<Range<usize>>,
        unbacked: Vec<Range<usize>>,
    }

    impl PageBacking for Recorder {
        fn back(&mut self, range: Range<usize>) -> std::result::Result<(), BackingError> {
            if self.budget.is_some_and(|budget| range.len() > budget) {
                return Err(BackingError::new(range));
            }
            self.backed.push(range);
            Ok(())
        }

        fn unback(&mut self, range: Range<usize>) -> std::result::Result<(), BackingError> {
            self.unbacked.push(range);
            Ok(())
        }
    }

    const START: usize = 0x10_0000;

    fn region(size: usize, max_size: usize) -> Region<Recorder> {
        Region::new(START, START + size, START + max_size, size, Recorder::default())
    }

    #[test]
    fn grow_rounds_up_to_page() {
        let mut region = region(0x1000, 0x10000);

        assert_eq!(region.grow(0x1001), Ok(0x2000));
        assert_eq!(region.end(), START + 0x2000);
        assert_eq!(region.backing().backed, vec![START + 0x1000..START + 0x2000]);
    }

    #[test]
    fn grow_past_max_fails_without_change() {
        let mut region = region(0x1000, 0x4000);

        assert_eq!(
            region.grow(0x4001),
            Err(HeapError::OutOfAddressSpace {
                requested: 0x4001,
                max: START + 0x4000
            })
        );
        assert_eq!(region.end(), START + 0x1000);
        assert!(region.backing().backed.is_empty());
    }

    #[test]
    fn grow_up_to_max_succeeds() {
        let mut region = region(0x1000, 0x4000);

        assert_eq!(region.grow(0x4000), Ok(0x4000));
        assert_eq!(region.end(), region.max());
    }

    #[test]
    fn backing_failure_propagates_without_change() {
        let mut region = region(0x1000, 0x10000);
        region.backing.budget = Some(0x1000);

        assert_eq!(
            region.grow(0x3000),
            Err(HeapError::OutOfMemory(BackingError::new(START + 0x1000..START + 0x3000)))
        );
        assert_eq!(region.end(), START + 0x1000);
    }

    #[test]
    fn same_size_is_a_noop() {
        let mut region = region(0x2000, 0x10000);

        assert_eq!(region.grow(0x2000), Ok(0x2000));
        assert_eq!(region.grow(0x1000), Ok(0x2000));
        assert!(region.backing().backed.is_empty());
        assert!(region.backing().unbacked.is_empty());
    }

    #[test]
    fn shrink_rounds_down_and_respects_minimum() {
        let backing = Recorder::default();
        let mut region = Region::new(START, START + 0x8000, START + 0x10000, 0x2000, backing);

        assert_eq!(region.shrink(0x5fff), Ok(0x5000));
        assert_eq!(region.backing().unbacked, vec![START + 0x5000..START + 0x8000]);

        assert_eq!(region.shrink(0), Ok(0x2000));
        assert_eq!(region.end(), START + 0x2000);
    }

    #[test]
    fn shrink_never_grows() {
        let mut region = region(0x2000, 0x10000);

        assert_eq!(region.shrink(0x4000), Ok(0x2000));
        assert_eq!(region.end(), START + 0x2000);
    }
}
