use std::ptr::NonNull;

use crate::{
    block::{Block, MIN_BLOCK_SIZE},
    config::PAGE_SIZE,
    error::{BackingError, HeapError, Result},
    heap::{Heap, align_padding, block_size_for},
    kernel::PageBacking,
};

impl<B: PageBacking> Heap<B> {
    /// Allocates `size` bytes and returns a pointer to them. With `page_align`
    /// the returned address is a multiple of [`PAGE_SIZE`].
    ///
    /// The smallest free block that fits is used, and what it has left over
    /// goes back to the free list. When no free block fits, the region grows
    /// once and the search runs again.
    pub fn allocate(&mut self, size: usize, page_align: bool) -> Result<NonNull<u8>> {
        let needed = block_size_for(size)
            .ok_or(HeapError::InvalidArgument("allocation size overflows"))?;

        let index = match self.find_smallest_hole(needed, page_align) {
            Some(index) => index,
            None => {
                self.expand(needed, page_align)?;

                // Growth always leaves a hole of at least `needed` usable bytes.
                self.find_smallest_hole(needed, page_align).ok_or_else(|| {
                    let end = self.end_address();
                    log::error!(
                        "no hole for {needed:#x} bytes right after growing the heap to {end:#x}"
                    );
                    HeapError::OutOfMemory(BackingError::new(end..end))
                })?
            }
        };

        let payload = unsafe { self.carve(index, needed, page_align)? };

        log::trace!("allocate({size:#x}, page_align: {page_align}) -> {payload:#x}");

        // Payloads are never at address zero: they sit after a header.
        NonNull::new(payload as *mut u8)
            .ok_or(HeapError::InvalidArgument("allocation at null address"))
    }

    /// Index in the free list of the first (so smallest) block that can hold
    /// `needed` bytes once the alignment padding is taken out.
    pub(crate) fn find_smallest_hole(&self, needed: usize, page_align: bool) -> Option<usize> {
        self.free_list.iter().position(|hole| {
            let padding = if page_align { align_padding(hole.addr()) } else { 0 };

            unsafe { hole.size() }
                .checked_sub(padding)
                .is_some_and(|usable| usable >= needed)
        })
    }

    /// Grows the region so that a block of `needed` bytes fits at its end.
    ///
    /// The free block ending at the old end, if any, is stretched over the new
    /// pages; otherwise the new pages become a hole of their own.
    fn expand(&mut self, needed: usize, page_align: bool) -> Result<()> {
        // The padding of an aligned block never reaches a page plus a minimum block.
        let growth = if page_align {
            needed.checked_add(PAGE_SIZE + MIN_BLOCK_SIZE)
        } else {
            Some(needed)
        };

        let old_size = self.size();
        let old_end = self.end_address();

        let new_size = growth
            .and_then(|growth| old_size.checked_add(growth))
            .ok_or(HeapError::OutOfAddressSpace {
                requested: usize::MAX,
                max: self.max_address(),
            })?;

        let tail = unsafe { Block::ending_at(old_end, &self.bounds()) }
            .filter(|block| unsafe { !block.is_allocated() });

        let tail_index = match tail {
            Some(block) => Some(
                self.free_list
                    .position(block)
                    .ok_or(HeapError::CorruptedMetadata { address: block.addr() })?,
            ),
            None if self.free_list.is_full() => {
                return Err(HeapError::FreeListFull {
                    capacity: self.free_list.capacity(),
                });
            }
            None => None,
        };

        self.region.grow(new_size)?;
        let new_end = self.end_address();

        log::debug!("heap expanded by {:#x} bytes for a {needed:#x} byte block", new_end - old_end);

        unsafe {
            match (tail, tail_index) {
                (Some(block), Some(index)) => {
                    self.free_list.remove(index);
                    block.clear_metadata(old_end - block.addr());
                    block.write(new_end - block.addr(), false);
                    self.free_list.insert(block)?;
                }
                _ => self.add_hole(old_end, new_end)?,
            }
        }

        Ok(())
    }

    /// Turns the hole at `index` into an allocated block of `needed` bytes and
    /// returns its payload address.
    ///
    /// # Safety
    /// `index` must come from [`Heap::find_smallest_hole`] with the same
    /// `needed` and `page_align`.
    unsafe fn carve(&mut self, index: usize, needed: usize, page_align: bool) -> Result<usize> {
        let hole = self.free_list.remove(index);
        let hole_size = unsafe { hole.size() };
        let padding = if page_align { align_padding(hole.addr()) } else { 0 };

        let block = Block::at(hole.addr() + padding);
        let available = hole_size - padding;

        if padding > 0 {
            // The slot `hole` used is free again, so this insert always fits.
            unsafe {
                hole.write(padding, false);
                self.free_list.insert(hole)?;
            }
        }

        let remainder = available - needed;

        let size = if remainder < MIN_BLOCK_SIZE {
            available
        } else if self.free_list.is_full() {
            log::warn!(
                "free list is full, {remainder:#x} bytes after the block at {:#x} stay allocated",
                block.addr()
            );
            available
        } else {
            let rest = Block::at(block.addr() + needed);

            unsafe {
                rest.write(remainder, false);
                self.free_list.insert(rest)?;
            }

            needed
        };

        unsafe {
            block.write(size, true);
        }

        Ok(block.payload())
    }
}
