use std::{mem, ptr::NonNull, slice};

use crate::{
    block::Block,
    error::{HeapError, Result},
};

/// Record at the very base of the heap span. Its `capacity` entries follow it
/// immediately, and the first block starts at the next page boundary.
///
/// ```text
/// +------------------+ <- span base
/// |  len | capacity  |
/// +------------------+
/// |  entry 0         |
/// |  entry 1         |
/// |  ...             |
/// |  entry cap - 1   |
/// +------------------+
/// |  (padding)       |
/// +------------------+ <- start_address (page aligned)
/// |  first block     |
/// ```
#[repr(C)]
struct RawFreeList {
    len: usize,
    capacity: usize,
}

/// Bytes the free list occupies at the base of the heap for `capacity` entries.
pub(crate) const fn footprint(capacity: usize) -> Option<usize> {
    match capacity.checked_mul(mem::size_of::<usize>()) {
        Some(entries) => entries.checked_add(mem::size_of::<RawFreeList>()),
        None => None,
    }
}

/// Free blocks of the heap, sorted ascending by block size.
///
/// Each entry is the address of a free block's header. The list never grows
/// beyond the capacity it was placed with; [`FreeList::insert`] on a full list
/// fails with [`HeapError::FreeListFull`].
///
/// Ordering reads the `size` of every block it compares, so the list is only
/// meaningful while all its entries are valid free blocks.
pub(crate) struct FreeList {
    raw: NonNull<RawFreeList>,
}

impl FreeList {
    /// Writes an empty list of `capacity` entries at `addr`.
    ///
    /// # Safety
    /// `addr` must be word aligned and `addr..addr + footprint(capacity)` must be
    /// backed memory owned by the heap for as long as the list lives.
    pub unsafe fn place(addr: NonNull<u8>, capacity: usize) -> Self {
        let raw = addr.cast::<RawFreeList>();

        unsafe {
            raw.as_ptr().write(RawFreeList { len: 0, capacity });
        }

        Self { raw }
    }

    #[inline]
    pub fn len(&self) -> usize {
        unsafe { self.raw.as_ref().len }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        unsafe { self.raw.as_ref().capacity }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    #[inline]
    fn entries_ptr(&self) -> *mut usize {
        unsafe { self.raw.as_ptr().add(1).cast::<usize>() }
    }

    fn entries(&self) -> &[usize] {
        unsafe { slice::from_raw_parts(self.entries_ptr(), self.len()) }
    }

    fn storage_mut(&mut self) -> &mut [usize] {
        unsafe { slice::from_raw_parts_mut(self.entries_ptr(), self.capacity()) }
    }

    fn set_len(&mut self, len: usize) {
        unsafe {
            self.raw.as_mut().len = len;
        }
    }

    /// Entry at `index`. Panics when `index` is not below [`FreeList::len`].
    pub fn lookup(&self, index: usize) -> Block {
        Block::at(self.entries()[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = Block> + '_ {
        self.entries().iter().map(|&addr| Block::at(addr))
    }

    /// Searches the list by reference.
    pub fn position(&self, block: Block) -> Option<usize> {
        self.entries().iter().position(|&addr| addr == block.addr())
    }

    /// Inserts `block` after every entry whose size is lower or equal, and
    /// returns its index.
    ///
    /// # Safety
    /// `block` and every entry already in the list must be valid blocks in
    /// backed memory.
    pub unsafe fn insert(&mut self, block: Block) -> Result<usize> {
        let len = self.len();

        if len == self.capacity() {
            return Err(HeapError::FreeListFull {
                capacity: self.capacity(),
            });
        }

        let size = unsafe { block.size() };
        let index = self
            .entries()
            .partition_point(|&addr| unsafe { Block::at(addr).size() <= size });

        let storage = self.storage_mut();
        storage.copy_within(index..len, index + 1);
        storage[index] = block.addr();
        self.set_len(len + 1);

        Ok(index)
    }

    /// Removes the entry at `index`, keeping the order of the others.
    /// Panics when `index` is not below [`FreeList::len`].
    pub fn remove(&mut self, index: usize) -> Block {
        let len = self.len();
        assert!(index < len, "free list index {index} out of bounds ({len} entries)");

        let storage = self.storage_mut();
        let removed = storage[index];
        storage.copy_within(index + 1..len, index);
        self.set_len(len - 1);

        Block::at(removed)
    }

    /// Removes `block` wherever it is. Returns `false` if it was not listed.
    pub fn remove_block(&mut self, block: Block) -> bool {
        match self.position(block) {
            Some(index) => {
                self.remove(index);
                true
            }
            None => false,
        }
    }
}
