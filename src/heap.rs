use std::{fmt, iter::FusedIterator, mem, ops::Range, ptr::NonNull};

use crate::{
    block::{Block, MIN_BLOCK_SIZE},
    config::{HeapConfig, PAGE_SIZE},
    error::{HeapError, Result},
    freelist::{self, FreeList},
    kernel::PageBacking,
    region::Region,
    utils::{align, align_down, checked_align, is_aligned},
};

/// A growable heap over a reserved span of addresses.
///
/// The span given to [`Heap::create`] is laid out as follows:
///
/// ```text
///  base                start_address         end_address          max_address
///   +-----------+--------+---------------------+--------------------+
///   | free list |  pad   | block | block | ... |  room to grow      |
///   +-----------+--------+---------------------+--------------------+
/// ```
///
/// The free list is stored inline at the base, the blocks partition
/// `start_address..end_address` and the region grows towards `max_address`
/// when no free block can satisfy a request.
///
/// A `Heap` has no internal synchronization. Whoever owns it must serialize the
/// calls, e.g. by keeping it behind a mutex.
pub struct Heap<B: PageBacking> {
    pub(crate) region: Region<B>,
    pub(crate) free_list: FreeList,
}

/// A block as seen by [`Heap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the header.
    pub address: usize,
    /// Whole block size, metadata included.
    pub size: usize,
    pub allocated: bool,
}

impl BlockInfo {
    /// Address a caller got back from [`Heap::allocate`] for this block.
    pub fn payload(&self) -> usize {
        Block::at(self.address).payload()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub region_size: usize,
    pub free_bytes: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
    pub largest_free_block: usize,
}

impl<B: PageBacking> Heap<B> {
    /// Creates a heap with the default [`HeapConfig`].
    ///
    /// # Safety
    /// See [`Heap::with_config`].
    pub unsafe fn create(start: usize, end: usize, max: usize, backing: B) -> Result<Self> {
        unsafe { Self::with_config(start, end, max, backing, HeapConfig::default()) }
    }

    /// Creates a heap over `start..max` whose region initially ends at `end`.
    ///
    /// `start..end` is handed to `backing.back` once before anything is
    /// written. If `start` is not page aligned, the space up to the next page
    /// boundary after the free list is wasted; `end` and `max` are rounded down
    /// to a page.
    ///
    /// # Safety
    /// The caller gives the heap exclusive ownership of `start..max` for the
    /// lifetime of the returned value, and every address of that span the
    /// heap asks `backing` to back must become readable and writable memory.
    pub unsafe fn with_config(
        start: usize,
        end: usize,
        max: usize,
        mut backing: B,
        config: HeapConfig,
    ) -> Result<Self> {
        let capacity = config.free_list_capacity;

        if capacity == 0 {
            return Err(HeapError::InvalidArgument("free list capacity must not be zero"));
        }

        let base = checked_align(start, mem::align_of::<usize>())
            .ok_or(HeapError::InvalidArgument("heap start is out of the address space"))?;

        let data_start = freelist::footprint(capacity)
            .and_then(|footprint| base.checked_add(footprint))
            .and_then(|list_end| checked_align(list_end, PAGE_SIZE))
            .ok_or(HeapError::InvalidArgument("free list does not fit in the address space"))?;

        let end = align_down(end, PAGE_SIZE);
        let max = align_down(max, PAGE_SIZE);

        if end > max {
            return Err(HeapError::InvalidArgument("heap end is past its maximum address"));
        }

        if data_start.saturating_add(MIN_BLOCK_SIZE) > end {
            return Err(HeapError::InvalidArgument("heap is too small to hold its free list"));
        }

        backing.back(start..end)?;

        let initial_size = end - data_start;
        let min_size = align_down(config.min_size.unwrap_or(initial_size), PAGE_SIZE);

        // `base` is word aligned, lies in backed memory and is owned by us.
        let free_list =
            unsafe { FreeList::place(NonNull::new_unchecked(base as *mut u8), capacity) };

        let mut heap = Self {
            region: Region::new(data_start, end, max, min_size, backing),
            free_list,
        };

        unsafe {
            heap.add_hole(data_start, end)?;
        }

        log::debug!(
            "heap created: blocks at {data_start:#x}..{end:#x}, max {max:#x}, \
             {capacity} free list entries"
        );

        Ok(heap)
    }

    /// First byte available for blocks.
    #[inline]
    pub fn start_address(&self) -> usize {
        self.region.start()
    }

    /// Current exclusive end of the blocks.
    #[inline]
    pub fn end_address(&self) -> usize {
        self.region.end()
    }

    /// The region never grows past this address.
    #[inline]
    pub fn max_address(&self) -> usize {
        self.region.max()
    }

    /// The region never shrinks below this many bytes.
    #[inline]
    pub fn min_size(&self) -> usize {
        self.region.min_size()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.region.size()
    }

    #[inline]
    pub fn backing(&self) -> &B {
        self.region.backing()
    }

    /// Number of holes currently tracked.
    #[inline]
    pub fn free_list_len(&self) -> usize {
        self.free_list.len()
    }

    #[inline]
    pub fn free_list_capacity(&self) -> usize {
        self.free_list.capacity()
    }

    #[inline]
    pub(crate) fn bounds(&self) -> Range<usize> {
        self.region.bounds()
    }

    /// Writes a free block spanning `start..end` and puts it in the free list.
    ///
    /// # Safety
    /// `start..end` must be inside the region and not part of any other block.
    pub(crate) unsafe fn add_hole(&mut self, start: usize, end: usize) -> Result<()> {
        let hole = Block::at(start);

        unsafe {
            hole.write(end - start, false);
            self.free_list.insert(hole)?;
        }

        Ok(())
    }

    /// Walks every block from `start_address` to `end_address`.
    pub fn blocks(&self) -> Blocks<'_, B> {
        Blocks {
            heap: self,
            cursor: self.start_address(),
            done: false,
        }
    }

    /// Free blocks in free list order, that is, ascending by size.
    pub fn free_blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.free_list.iter().map(|block| unsafe { block_info(block) })
    }

    /// Walks the heap and sums it up. Stops at the first corrupted block.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            region_size: self.size(),
            ..HeapStats::default()
        };

        for block in self.blocks().map_while(|block| block.ok()) {
            if block.allocated {
                stats.allocated_bytes += block.size;
                stats.allocated_blocks += 1;
            } else {
                stats.free_bytes += block.size;
                stats.free_blocks += 1;
                stats.largest_free_block = stats.largest_free_block.max(block.size);
            }
        }

        stats
    }

    /// Verifies the heap invariants:
    ///
    /// - `start_address <= end_address <= max_address`, both ends page aligned.
    /// - Blocks exactly partition `start_address..end_address`.
    /// - Every free block is in the free list exactly once and allocated blocks
    ///   never are.
    /// - The free list is ascending by size.
    pub fn check_integrity(&self) -> Result<()> {
        let (start, end) = (self.start_address(), self.end_address());

        if start > end
            || end > self.max_address()
            || !is_aligned(start, PAGE_SIZE)
            || !is_aligned(end, PAGE_SIZE)
        {
            return Err(HeapError::CorruptedMetadata { address: end });
        }

        let mut free_blocks = 0;

        for block in self.blocks() {
            let block = block?;

            if !block.allocated {
                free_blocks += 1;

                let listed = self
                    .free_list
                    .iter()
                    .filter(|entry| entry.addr() == block.address)
                    .count();

                if listed != 1 {
                    return Err(HeapError::CorruptedMetadata { address: block.address });
                }
            }
        }

        let bounds = self.bounds();
        let mut previous = 0;

        for entry in self.free_list.iter() {
            unsafe {
                if !entry.validate(&bounds) || entry.is_allocated() || entry.size() < previous {
                    return Err(HeapError::CorruptedMetadata { address: entry.addr() });
                }

                previous = entry.size();
            }
        }

        if self.free_list.len() != free_blocks {
            return Err(HeapError::CorruptedMetadata { address: start });
        }

        Ok(())
    }

    /// Size of the last free list entry, the largest hole.
    fn largest_hole(&self) -> Option<usize> {
        if self.free_list.is_empty() {
            return None;
        }

        let last = self.free_list.lookup(self.free_list.len() - 1);
        Some(unsafe { last.size() })
    }
}

/// # Safety
/// `block` must be a valid block in backed memory.
unsafe fn block_info(block: Block) -> BlockInfo {
    let header = unsafe { block.header() };

    BlockInfo {
        address: block.addr(),
        size: header.size,
        allocated: header.allocated != 0,
    }
}

/// Iterator returned by [`Heap::blocks`]. Yields one error and stops if it
/// meets a block that does not validate.
pub struct Blocks<'a, B: PageBacking> {
    heap: &'a Heap<B>,
    cursor: usize,
    done: bool,
}

impl<B: PageBacking> Iterator for Blocks<'_, B> {
    type Item = Result<BlockInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor >= self.heap.end_address() {
            return None;
        }

        let block = Block::at(self.cursor);

        unsafe {
            if !block.validate(&self.heap.bounds()) {
                self.done = true;
                return Some(Err(HeapError::CorruptedMetadata { address: self.cursor }));
            }

            let info = block_info(block);
            self.cursor += info.size;

            Some(Ok(info))
        }
    }
}

impl<B: PageBacking> FusedIterator for Blocks<'_, B> {}

impl<B: PageBacking> fmt::Debug for Heap<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("start_address", &format_args!("{:#x}", self.start_address()))
            .field("end_address", &format_args!("{:#x}", self.end_address()))
            .field("max_address", &format_args!("{:#x}", self.max_address()))
            .field("free_list_len", &self.free_list.len())
            .field("largest_hole", &self.largest_hole())
            .finish()
    }
}

/// Number of bytes a block needs to hold a payload of `size` bytes.
pub(crate) fn block_size_for(size: usize) -> Option<usize> {
    let size = size.checked_add(MIN_BLOCK_SIZE)?;
    checked_align(size, mem::align_of::<usize>())
}

/// Bytes to skip at the start of the block at `addr` so that the payload of
/// the block that follows them is page aligned. A non-zero padding is always
/// large enough to become a free block of its own.
pub(crate) fn align_padding(addr: usize) -> usize {
    let payload = Block::at(addr).payload();

    if payload % PAGE_SIZE == 0 {
        return 0;
    }

    let mut aligned = align(payload, PAGE_SIZE);

    if aligned - payload < MIN_BLOCK_SIZE {
        aligned += PAGE_SIZE;
    }

    aligned - payload
}
