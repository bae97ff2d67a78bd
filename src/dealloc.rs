use crate::{
    block::{Block, HEADER_SIZE, MIN_BLOCK_SIZE},
    config::PAGE_SIZE,
    error::{HeapError, Result},
    heap::Heap,
    kernel::PageBacking,
    utils::align,
};

impl<B: PageBacking> Heap<B> {
    /// Returns the block behind `ptr` to the heap.
    ///
    /// The block is merged with its free neighbours, and if the result ends
    /// the region, the region shrinks back as far as the minimum size allows.
    /// A null `ptr` does nothing.
    ///
    /// A pointer that does not lead to a valid allocated block is rejected
    /// with nothing changed: [`HeapError::CorruptedMetadata`] when its
    /// metadata does not validate, [`HeapError::InvalidArgument`] when it is
    /// outside the heap or already free.
    ///
    /// # Safety
    /// `ptr` must be null or come from [`Heap::allocate`] on this heap, and
    /// must not be used once freed.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }

        let bounds = self.bounds();

        let block = match (ptr as usize).checked_sub(HEADER_SIZE) {
            Some(addr) if bounds.contains(&addr) => Block::at(addr),
            _ => {
                log::warn!("free({ptr:p}): pointer outside of the heap");
                return Err(HeapError::InvalidArgument("pointer outside of the heap"));
            }
        };

        unsafe {
            if !block.validate(&bounds) {
                log::warn!("free({ptr:p}): corrupted metadata at {:#x}", block.addr());
                return Err(HeapError::CorruptedMetadata { address: block.addr() });
            }

            if !block.is_allocated() {
                log::warn!("free({ptr:p}): block is already free");
                return Err(HeapError::InvalidArgument("block is already free"));
            }
        }

        let left = unsafe { block.left_neighbor(&bounds) }
            .filter(|left| unsafe { !left.is_allocated() });
        let right = unsafe { block.right_neighbor(&bounds) }
            .filter(|right| unsafe { !right.is_allocated() });

        // Everything that can reject the call is checked before the first write.
        for neighbour in left.iter().chain(right.iter()) {
            if self.free_list.position(*neighbour).is_none() {
                log::warn!(
                    "free({ptr:p}): free neighbour at {:#x} is not in the free list",
                    neighbour.addr()
                );
                return Err(HeapError::CorruptedMetadata {
                    address: neighbour.addr(),
                });
            }
        }

        if left.is_none() && right.is_none() && self.free_list.is_full() {
            log::warn!("free({ptr:p}): no free list entry left for the block");
            return Err(HeapError::FreeListFull {
                capacity: self.free_list.capacity(),
            });
        }

        let merged = unsafe { self.coalesce(block, left, right) };

        log::trace!(
            "free({ptr:p}) -> free block {:#x} of {:#x} bytes",
            merged.addr(),
            unsafe { merged.size() }
        );

        if let Some(merged) = unsafe { self.trim_end(merged) } {
            unsafe {
                self.free_list.insert(merged)?;
            }
        }

        Ok(())
    }

    /// Merges `block` with its free neighbours, taking them out of the free
    /// list, and marks the result free. The merged block is not listed yet.
    ///
    /// # Safety
    /// `block` must be a valid allocated block, `left` and `right` its free
    /// neighbours, both listed.
    unsafe fn coalesce(
        &mut self,
        block: Block,
        left: Option<Block>,
        right: Option<Block>,
    ) -> Block {
        unsafe {
            let mut start = block.addr();
            let mut end = block.addr() + block.size();

            if let Some(left) = left {
                self.free_list.remove_block(left);
                start = left.addr();
                left.clear_metadata(left.size());
            }

            if let Some(right) = right {
                self.free_list.remove_block(right);
                end = right.addr() + right.size();
                right.clear_metadata(right.size());
            }

            // Stale boundaries inside the merged block must never validate again.
            block.clear_metadata(block.size());

            let merged = Block::at(start);
            merged.write(end - start, false);
            merged
        }
    }

    /// Shrinks the region if the free `block` ends it. Returns what is left of
    /// the block, or `None` when the whole block went away with the region.
    ///
    /// # Safety
    /// `block` must be a valid free block, not in the free list.
    unsafe fn trim_end(&mut self, block: Block) -> Option<Block> {
        let size = unsafe { block.size() };
        let end = block.addr() + size;

        if end != self.end_address() {
            return Some(block);
        }

        let offset = block.addr() - self.start_address();
        let mut target = align(offset, PAGE_SIZE).max(self.min_size());

        // A tail too short for a block cannot stay behind.
        let kept = (self.start_address() + target).saturating_sub(block.addr());
        if kept > 0 && kept < MIN_BLOCK_SIZE {
            target += PAGE_SIZE;
        }

        if let Err(error) = self.region.shrink(target) {
            log::warn!("could not release the pages after {:#x}: {error}", block.addr());
            return Some(block);
        }

        let new_end = self.end_address();

        if new_end <= block.addr() {
            log::trace!("block {:#x} released with the end of the heap", block.addr());
            return None;
        }

        if new_end < end {
            unsafe {
                block.write(new_end - block.addr(), false);
            }
        }

        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Range;

    use crate::{
        Heap,
        block::{FOOTER_SIZE, HEADER_SIZE},
        config::{HeapConfig, PAGE_SIZE},
        error::{BackingError, HeapError},
        heap::{
            BlockInfo,
            tests::{INITIAL_SIZE, MAX_SIZE, reserved_heap},
        },
        kernel::{PageBacking, Reservation},
    };

    fn whole_heap(heap: &Heap<Reservation>) -> Vec<BlockInfo> {
        vec![BlockInfo {
            address: heap.start_address(),
            size: heap.size(),
            allocated: false,
        }]
    }

    fn blocks<B: PageBacking>(heap: &Heap<B>) -> Vec<BlockInfo> {
        heap.blocks().map(|block| block.unwrap()).collect()
    }

    #[test]
    fn null_is_a_noop() {
        let mut heap = reserved_heap(HeapConfig::default());

        unsafe {
            assert_eq!(heap.free(std::ptr::null_mut()), Ok(()));
        }
        assert_eq!(blocks(&heap), whole_heap(&heap));
    }

    #[test]
    fn freeing_both_allocations_restores_one_hole() {
        let mut heap = reserved_heap(HeapConfig::default());
        let end = heap.end_address();

        let first = heap.allocate(64, false).unwrap();
        let second = heap.allocate(128, false).unwrap();

        unsafe {
            heap.free(first.as_ptr()).unwrap();
            assert!(heap.check_integrity().is_ok());
            heap.free(second.as_ptr()).unwrap();
        }

        assert_eq!(heap.end_address(), end);
        assert_eq!(blocks(&heap), whole_heap(&heap));
        assert_eq!(heap.free_list_len(), 1);
        assert!(heap.check_integrity().is_ok());
    }

    #[test]
    fn adjacent_frees_coalesce_into_one_entry() {
        let mut heap = reserved_heap(HeapConfig::default());

        let a = heap.allocate(100, false).unwrap();
        let b = heap.allocate(200, false).unwrap();
        let fence = heap.allocate(8, false).unwrap();

        unsafe {
            heap.free(a.as_ptr()).unwrap();
            heap.free(b.as_ptr()).unwrap();
        }

        let free: Vec<_> = blocks(&heap).into_iter().filter(|block| !block.allocated).collect();
        assert_eq!(free.len(), 2);
        assert_eq!(free[0].address, heap.start_address());
        assert_eq!(free[0].size, fence.as_ptr() as usize - a.as_ptr() as usize);
        assert_eq!(heap.free_list_len(), 2);
        assert!(heap.check_integrity().is_ok());
    }

    #[test]
    fn left_merge_resorts_the_grown_block() {
        let mut heap = reserved_heap(HeapConfig::default());

        let a = heap.allocate(64, false).unwrap();
        let b = heap.allocate(1024, false).unwrap();
        let _c = heap.allocate(8, false).unwrap();
        let d = heap.allocate(512, false).unwrap();
        let _e = heap.allocate(8, false).unwrap();

        unsafe {
            heap.free(a.as_ptr()).unwrap();
            heap.free(d.as_ptr()).unwrap();
            // Merging `b` into `a` makes it larger than `d`.
            heap.free(b.as_ptr()).unwrap();
        }

        let sizes: Vec<_> = heap.free_blocks().map(|block| block.size).collect();
        let mut sorted = sizes.clone();
        sorted.sort();
        assert_eq!(sizes, sorted);
        assert!(heap.check_integrity().is_ok());
    }

    #[test]
    fn round_trip_keeps_free_bytes() {
        let mut heap = reserved_heap(HeapConfig::default());
        let _keep = heap.allocate(1000, false).unwrap();
        let before = heap.stats();

        for (size, page_align) in [(1, false), (4000, false), (64, true), (0x20000, false)] {
            let pointer = heap.allocate(size, page_align).unwrap();
            unsafe { heap.free(pointer.as_ptr()).unwrap() };

            assert_eq!(heap.stats(), before);
            assert!(heap.check_integrity().is_ok());
        }
    }

    #[test]
    fn freeing_the_tail_shrinks_the_region() {
        let mut heap = reserved_heap(HeapConfig::default());
        let initial_end = heap.end_address();

        let big = heap.allocate(2 * INITIAL_SIZE, false).unwrap();
        assert!(heap.end_address() > initial_end);

        unsafe { heap.free(big.as_ptr()).unwrap() };

        assert_eq!(heap.end_address(), initial_end);
        assert_eq!(blocks(&heap), whole_heap(&heap));
        assert!(heap.check_integrity().is_ok());
    }

    #[test]
    fn shrink_keeps_live_blocks_below_the_new_end() {
        let config = HeapConfig::new().with_min_size(0);
        let mut heap = reserved_heap(config);

        let low = heap.allocate(100, false).unwrap();
        let high = heap.allocate(3 * PAGE_SIZE, false).unwrap();
        let whole = heap.size();

        unsafe {
            std::ptr::write_bytes(low.as_ptr(), 0x11, 100);
            heap.free(high.as_ptr()).unwrap();
        }

        assert!(heap.size() < whole);
        assert_eq!(heap.size(), PAGE_SIZE);
        unsafe {
            assert_eq!(*low.as_ptr().add(99), 0x11);
        }

        let layout = blocks(&heap);
        assert_eq!(layout.len(), 2);
        assert!(layout[0].allocated);
        assert_eq!(layout[1].address + layout[1].size, heap.end_address());
        assert!(heap.check_integrity().is_ok());
    }

    #[test]
    fn sliver_tail_keeps_one_more_page() {
        let config = HeapConfig::new().with_min_size(0);
        let mut heap = reserved_heap(config);
        let start = heap.start_address();

        // The first block stops `HEADER_SIZE` bytes short of a page boundary.
        let first_size = PAGE_SIZE - HEADER_SIZE;
        let _first = heap
            .allocate(first_size - HEADER_SIZE - FOOTER_SIZE, false)
            .unwrap();
        let second = heap.allocate(2 * PAGE_SIZE, false).unwrap();
        assert_eq!(second.as_ptr() as usize, start + first_size + HEADER_SIZE);

        unsafe { heap.free(second.as_ptr()).unwrap() };

        assert_eq!(heap.size(), 2 * PAGE_SIZE);
        assert_eq!(
            blocks(&heap),
            vec![
                BlockInfo {
                    address: start,
                    size: first_size,
                    allocated: true,
                },
                BlockInfo {
                    address: start + first_size,
                    size: PAGE_SIZE + HEADER_SIZE,
                    allocated: false,
                },
            ]
        );
        assert!(heap.check_integrity().is_ok());
    }

    #[test]
    fn tail_on_a_page_boundary_is_released_entirely() {
        let config = HeapConfig::new().with_min_size(0);
        let mut heap = reserved_heap(config);

        // Exactly one page for the first block, the rest for the second.
        let first = heap.allocate(PAGE_SIZE - HEADER_SIZE - FOOTER_SIZE, false).unwrap();
        let second = heap.allocate(2 * PAGE_SIZE, false).unwrap();
        assert_eq!(second.as_ptr() as usize, heap.start_address() + PAGE_SIZE + HEADER_SIZE);

        unsafe { heap.free(second.as_ptr()).unwrap() };

        assert_eq!(heap.end_address(), heap.start_address() + PAGE_SIZE);
        assert_eq!(heap.free_list_len(), 0);
        assert_eq!(
            blocks(&heap),
            vec![BlockInfo {
                address: heap.start_address(),
                size: PAGE_SIZE,
                allocated: true,
            }]
        );
        assert!(heap.check_integrity().is_ok());

        // The heap grows back on the next request.
        unsafe { heap.free(first.as_ptr()).unwrap() };
        assert!(heap.allocate(64, false).is_ok());
        assert!(heap.check_integrity().is_ok());
    }

    #[test]
    fn minimum_size_prevents_shrinking() {
        let config = HeapConfig::new().with_min_size(INITIAL_SIZE);
        let mut heap = reserved_heap(config);
        let end = heap.end_address();

        let pointer = heap.allocate(64, false).unwrap();
        unsafe { heap.free(pointer.as_ptr()).unwrap() };

        assert_eq!(heap.end_address(), end);
        assert!(heap.check_integrity().is_ok());
    }

    #[test]
    fn corrupted_magic_is_reported_without_changes() {
        let mut heap = reserved_heap(HeapConfig::default());

        let pointer = heap.allocate(64, false).unwrap();
        let free_list_len = heap.free_list_len();
        let end = heap.end_address();

        unsafe {
            (pointer.as_ptr().sub(HEADER_SIZE) as *mut u32).write(0xDEAD_BEEF);

            assert_eq!(
                heap.free(pointer.as_ptr()),
                Err(HeapError::CorruptedMetadata {
                    address: pointer.as_ptr() as usize - HEADER_SIZE
                })
            );
        }

        assert_eq!(heap.free_list_len(), free_list_len);
        assert_eq!(heap.end_address(), end);
    }

    #[test]
    fn corrupted_footer_is_reported() {
        let mut heap = reserved_heap(HeapConfig::default());

        let pointer = heap.allocate(64, false).unwrap();

        unsafe {
            (pointer.as_ptr().add(64) as *mut u32).write(0);

            assert!(matches!(
                heap.free(pointer.as_ptr()),
                Err(HeapError::CorruptedMetadata { .. })
            ));
        }
    }

    #[test]
    fn double_free_is_rejected() {
        let mut heap = reserved_heap(HeapConfig::default());

        let pointer = heap.allocate(64, false).unwrap();
        let _fence = heap.allocate(64, false).unwrap();

        unsafe {
            heap.free(pointer.as_ptr()).unwrap();
            assert_eq!(
                heap.free(pointer.as_ptr()),
                Err(HeapError::InvalidArgument("block is already free"))
            );
        }
        assert!(heap.check_integrity().is_ok());
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let mut heap = reserved_heap(HeapConfig::default());
        let mut local = [0u8; 64];

        unsafe {
            assert_eq!(
                heap.free(local.as_mut_ptr().add(32)),
                Err(HeapError::InvalidArgument("pointer outside of the heap"))
            );
        }
    }

    #[test]
    fn full_free_list_rejects_isolated_free() {
        let config = HeapConfig::new().with_free_list_capacity(2);
        let mut heap = reserved_heap(config);

        let a = heap.allocate(64, false).unwrap();
        let _b = heap.allocate(64, false).unwrap();
        let c = heap.allocate(64, false).unwrap();
        let _d = heap.allocate(64, false).unwrap();

        unsafe {
            heap.free(a.as_ptr()).unwrap();
            assert_eq!(heap.free_list_len(), 2);

            assert_eq!(heap.free(c.as_ptr()), Err(HeapError::FreeListFull { capacity: 2 }));
        }

        assert_eq!(heap.free_list_len(), 2);
        assert!(heap.check_integrity().is_ok());
    }

    /// Refuses to give pages back.
    struct Sticky(Reservation);

    impl PageBacking for Sticky {
        fn back(&mut self, range: Range<usize>) -> std::result::Result<(), BackingError> {
            self.0.back(range)
        }

        fn unback(&mut self, range: Range<usize>) -> std::result::Result<(), BackingError> {
            Err(BackingError::new(range))
        }
    }

    #[test]
    fn failed_unback_keeps_the_block() {
        let reservation = Reservation::new(MAX_SIZE).unwrap();
        let base = reservation.start();
        let backing = Sticky(reservation);
        let mut heap =
            unsafe { Heap::create(base, base + INITIAL_SIZE, base + MAX_SIZE, backing).unwrap() };
        let initial_end = heap.end_address();

        let big = heap.allocate(INITIAL_SIZE, false).unwrap();
        let grown_end = heap.end_address();
        assert!(grown_end > initial_end);

        unsafe { heap.free(big.as_ptr()).unwrap() };

        assert_eq!(heap.end_address(), grown_end);
        assert_eq!(heap.free_list_len(), 1);
        assert!(heap.check_integrity().is_ok());
    }

    /// Allocates and frees pseudo-random sizes, filling every payload with a
    /// tag and checking it survives until the block is freed.
    #[test]
    fn random_sequence_keeps_invariants() {
        let config = HeapConfig::new().with_min_size(PAGE_SIZE);
        let mut heap = reserved_heap(config);
        let mut live: Vec<(usize, usize, u8)> = Vec::new();
        let mut state: u64 = 0x2545_F491_4F6C_DD1D;

        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for round in 0..2000u32 {
            let roll = next();

            if live.is_empty() || roll % 3 != 0 {
                let size = (next() % 6000) as usize;
                let page_align = next() % 5 == 0;
                let tag = (round % 251) as u8;

                let pointer = heap.allocate(size, page_align).unwrap();
                if page_align {
                    assert_eq!(pointer.as_ptr() as usize % PAGE_SIZE, 0);
                }

                unsafe { std::ptr::write_bytes(pointer.as_ptr(), tag, size) };
                live.push((pointer.as_ptr() as usize, size, tag));
            } else {
                let (address, size, tag) = live.swap_remove((roll as usize / 3) % live.len());

                unsafe {
                    let bytes = std::slice::from_raw_parts(address as *const u8, size);
                    assert!(bytes.iter().all(|&byte| byte == tag));

                    heap.free(address as *mut u8).unwrap();
                }
            }

            assert!(heap.check_integrity().is_ok(), "round {round}");

            if live.len() > 200 {
                let (address, _, _) = live.swap_remove(0);
                unsafe { heap.free(address as *mut u8).unwrap() };
            }
        }

        for (address, _, _) in live.drain(..) {
            unsafe { heap.free(address as *mut u8).unwrap() };
        }

        assert_eq!(heap.size(), PAGE_SIZE);
        assert_eq!(heap.free_list_len(), 1);
        assert!(heap.check_integrity().is_ok());
    }
}
