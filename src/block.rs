use std::{mem, ops::Range, ptr};

use crate::{config::HEAP_MAGIC, utils::is_aligned};

/// Header size of a block. Always a multiple of the machine word.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Footer size of a block. Always a multiple of the machine word.
pub(crate) const FOOTER_SIZE: usize = mem::size_of::<Footer>();

/// The smallest block we can build: a header immediately followed by its footer.
pub(crate) const MIN_BLOCK_SIZE: usize = HEADER_SIZE + FOOTER_SIZE;

/// Every block, free or allocated, is wrapped by a header and a footer that
/// live inside the heap's own bytes.
///
/// ```text
/// +---------------------+ <------+
/// |        magic        |        |
/// +---------------------+        |
/// |      allocated      |        | -> Header
/// +---------------------+        |
/// |        size         |        |
/// +---------------------+ <------+
/// |       Payload       |        |
/// |         ...         |        | -> Returned to the caller
/// |         ...         |        |
/// +---------------------+ <------+
/// |        magic        |        |
/// +---------------------+        | -> Footer
/// |       header        |        |
/// +---------------------+ <------+
/// ```
///
/// `size` covers the whole block, header and footer included. The footer
/// points back to its header, so the block that ends right before a given
/// address can be found in O(1) by reading the footer that precedes it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub magic: u32,
    /// 1 when allocated, 0 when free. Kept as a plain integer so that
    /// reading garbage never produces an invalid `bool`.
    pub allocated: u32,
    pub size: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Footer {
    pub magic: u32,
    _reserved: u32,
    /// Address of the header of this block.
    pub header: usize,
}

/// Typed view over the bytes of one block, identified by the address of its
/// header.
///
/// Reads and writes through a `Block` are `unsafe`: the caller guarantees the
/// touched bytes belong to backed heap memory. The `validate` family takes the
/// region bounds and checks every address against them before reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    addr: usize,
}

impl Block {
    #[inline]
    pub const fn at(addr: usize) -> Self {
        Self { addr }
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.addr
    }

    /// Address handed out to the caller.
    #[inline]
    pub const fn payload(self) -> usize {
        self.addr + HEADER_SIZE
    }

    /// # Safety
    /// The header must lie in backed heap memory.
    #[inline]
    pub unsafe fn header(self) -> Header {
        unsafe { ptr::read(self.addr as *const Header) }
    }

    /// # Safety
    /// See [`Block::header`].
    #[inline]
    pub unsafe fn size(self) -> usize {
        unsafe { self.header().size }
    }

    /// # Safety
    /// See [`Block::header`].
    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        unsafe { self.header().allocated != 0 }
    }

    /// Writes a fresh header for a block of `size` bytes.
    ///
    /// # Safety
    /// `self.addr..self.addr + HEADER_SIZE` must be backed heap memory.
    pub unsafe fn write_header(self, size: usize, allocated: bool) {
        unsafe {
            ptr::write(
                self.addr as *mut Header,
                Header {
                    magic: HEAP_MAGIC,
                    allocated: u32::from(allocated),
                    size,
                },
            );
        }
    }

    /// Writes the footer of a block of `size` bytes, pointing back to this header.
    ///
    /// # Safety
    /// The last `FOOTER_SIZE` bytes of `self.addr..self.addr + size` must be backed
    /// heap memory.
    pub unsafe fn write_footer(self, size: usize) {
        unsafe {
            ptr::write(
                (self.addr + size - FOOTER_SIZE) as *mut Footer,
                Footer {
                    magic: HEAP_MAGIC,
                    _reserved: 0,
                    header: self.addr,
                },
            );
        }
    }

    /// Header and footer in one go.
    ///
    /// # Safety
    /// See [`Block::write_header`] and [`Block::write_footer`].
    #[inline]
    pub unsafe fn write(self, size: usize, allocated: bool) {
        unsafe {
            self.write_header(size, allocated);
            self.write_footer(size);
        }
    }

    /// Wipes the magic of both boundary words. Used on blocks that are about to
    /// become the interior of a merged block.
    ///
    /// # Safety
    /// The whole block of `size` bytes must be backed heap memory.
    pub unsafe fn clear_metadata(self, size: usize) {
        unsafe {
            (*(self.addr as *mut Header)).magic = 0;
            (*((self.addr + size - FOOTER_SIZE) as *mut Footer)).magic = 0;
        }
    }

    /// Tells whether a genuine block starts at this address: its header and
    /// footer are inside `bounds`, both carry [`HEAP_MAGIC`] and the footer
    /// points back to the header.
    ///
    /// # Safety
    /// `bounds` must be backed heap memory.
    pub unsafe fn validate(self, bounds: &Range<usize>) -> bool {
        if !is_aligned(self.addr, mem::align_of::<Header>()) || self.addr < bounds.start {
            return false;
        }

        match self.addr.checked_add(HEADER_SIZE) {
            Some(end) if end <= bounds.end => {}
            _ => return false,
        }

        let header = unsafe { self.header() };

        if header.magic != HEAP_MAGIC || header.allocated > 1 {
            return false;
        }

        if header.size < MIN_BLOCK_SIZE || !is_aligned(header.size, mem::align_of::<Header>()) {
            return false;
        }

        match self.addr.checked_add(header.size) {
            Some(end) if end <= bounds.end => {}
            _ => return false,
        }

        let footer = unsafe { ptr::read((self.addr + header.size - FOOTER_SIZE) as *const Footer) };

        footer.magic == HEAP_MAGIC && footer.header == self.addr
    }

    /// Returns the validated block whose footer ends exactly at `end`.
    ///
    /// # Safety
    /// `bounds` must be backed heap memory.
    pub unsafe fn ending_at(end: usize, bounds: &Range<usize>) -> Option<Self> {
        let footer_addr = end.checked_sub(FOOTER_SIZE)?;

        if footer_addr < bounds.start
            || end > bounds.end
            || !is_aligned(footer_addr, mem::align_of::<Footer>())
        {
            return None;
        }

        let footer = unsafe { ptr::read(footer_addr as *const Footer) };

        if footer.magic != HEAP_MAGIC {
            return None;
        }

        let block = Self::at(footer.header);

        unsafe {
            (block.validate(bounds) && block.addr + block.size() == end).then_some(block)
        }
    }

    /// The block right before this one, found through its footer.
    ///
    /// # Safety
    /// `bounds` must be backed heap memory.
    #[inline]
    pub unsafe fn left_neighbor(self, bounds: &Range<usize>) -> Option<Self> {
        unsafe { Self::ending_at(self.addr, bounds) }
    }

    /// The block right after this one.
    ///
    /// # Safety
    /// `bounds` must be backed heap memory and `self` must be a valid block.
    pub unsafe fn right_neighbor(self, bounds: &Range<usize>) -> Option<Self> {
        let next = Self::at(self.addr + unsafe { self.size() });

        unsafe { next.validate(bounds).then_some(next) }
    }
}
