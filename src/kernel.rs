use std::{ops::Range, ptr::NonNull};

use crate::{error::BackingError, utils::{align, align_down}};

/// The page-mapping side of the heap. The heap decides *which* addresses need
/// memory behind them and calls into this trait; how pages are actually
/// supplied is up to the implementation.
///
/// Both calls may fail (physical memory exhaustion, a rejected syscall...).
/// The heap propagates such a failure to its caller and leaves its own state
/// untouched.
pub trait PageBacking {
    /// `range` is about to be used and must be readable and writable.
    fn back(&mut self, range: Range<usize>) -> Result<(), BackingError>;

    /// `range` is no longer used by the heap and its pages may be released.
    fn unback(&mut self, range: Range<usize>) -> Result<(), BackingError>;
}

impl<T: PageBacking + ?Sized> PageBacking for &mut T {
    fn back(&mut self, range: Range<usize>) -> Result<(), BackingError> {
        (**self).back(range)
    }

    fn unback(&mut self, range: Range<usize>) -> Result<(), BackingError> {
        (**self).unback(range)
    }
}

/// Backing for a flat address space where every address of the heap span is
/// already usable memory. Nothing to map, nothing to release.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatMemory;

impl PageBacking for FlatMemory {
    fn back(&mut self, _range: Range<usize>) -> Result<(), BackingError> {
        Ok(())
    }

    fn unback(&mut self, _range: Range<usize>) -> Result<(), BackingError> {
        Ok(())
    }
}

/// Zero-sized handle the platform specific memory calls are implemented on.
pub(crate) struct Kernel;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. As the allocator, our top level view of this has nothing
/// to do with the concrete implementations / APIs offered by each kernel.
trait PlatformMemory {
    /// Reserves `len` bytes of address space without any memory behind them.
    unsafe fn reserve(len: usize) -> Option<NonNull<u8>>;

    /// Makes `addr..addr + len` readable and writable.
    unsafe fn commit(addr: *mut u8, len: usize) -> bool;

    /// Gives the memory behind `addr..addr + len` back to the kernel while
    /// keeping the addresses reserved.
    unsafe fn decommit(addr: *mut u8, len: usize) -> bool;

    /// Returns the whole reservation starting at `addr` to the kernel.
    unsafe fn release(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

/// Wrapper to calculate the computer's page size.
#[inline]
pub(crate) fn page_size() -> usize {
    unsafe { Kernel::page_size() }
}

/// A span of address space reserved from the operating system. Pages are only
/// committed when the heap backs them and decommitted when it unbacks them, so
/// touching an address outside the current heap region faults.
///
/// Dropping the reservation returns the whole span to the kernel.
#[derive(Debug)]
pub struct Reservation {
    start: NonNull<u8>,
    len: usize,
    page_size: usize,
}

impl Reservation {
    /// Reserves at least `len` bytes, rounded up to the computer's page size.
    pub fn new(len: usize) -> Result<Self, BackingError> {
        let page_size = page_size();
        let len = align(len.max(1), page_size);

        let start = unsafe { Kernel::reserve(len) }.ok_or(BackingError { start: 0, end: len })?;

        log::debug!("reserved {len:#x} bytes at {:p}", start);

        Ok(Self { start, len, page_size })
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start.as_ptr() as usize
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.len
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_bounds(&self, range: &Range<usize>) -> Result<(), BackingError> {
        if range.start < self.start() || range.end > self.end() || range.start > range.end {
            return Err(BackingError::new(range.clone()));
        }

        Ok(())
    }
}

impl PageBacking for Reservation {
    fn back(&mut self, range: Range<usize>) -> Result<(), BackingError> {
        self.check_bounds(&range)?;

        // Every byte of `range` must end up committed, so widen it to whole pages.
        let start = align_down(range.start, self.page_size);
        let end = align(range.end, self.page_size).min(self.end());

        if start < end && !unsafe { Kernel::commit(start as *mut u8, end - start) } {
            return Err(BackingError::new(range));
        }

        Ok(())
    }

    fn unback(&mut self, range: Range<usize>) -> Result<(), BackingError> {
        self.check_bounds(&range)?;

        // Only pages fully inside `range` can go, their neighbours may still be in use.
        let start = align(range.start, self.page_size);
        let end = align_down(range.end, self.page_size);

        if start < end && !unsafe { Kernel::decommit(start as *mut u8, end - start) } {
            return Err(BackingError::new(range));
        }

        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe { Kernel::release(self.start.as_ptr(), self.len) }
    }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // No access until the heap commits the pages.
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = libc::mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn commit(addr: *mut u8, len: usize) -> bool {
            // Read-Write only memory.
            let prot = libc::PROT_READ | libc::PROT_WRITE;

            unsafe { libc::mprotect(addr.cast::<c_void>(), len as size_t, prot) == 0 }
        }

        unsafe fn decommit(addr: *mut u8, len: usize) -> bool {
            unsafe {
                libc::madvise(addr.cast::<c_void>(), len as size_t, libc::MADV_DONTNEED) == 0
                    && libc::mprotect(addr.cast::<c_void>(), len as size_t, libc::PROT_NONE) == 0
            }
        }

        unsafe fn release(addr: *mut u8, len: usize) {
            unsafe {
                libc::munmap(addr.cast::<c_void>(), len as size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use crate::kernel::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr =
                    Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn commit(addr: *mut u8, len: usize) -> bool {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            unsafe {
                let addr = Some(addr as *const c_void);

                !Memory::VirtualAlloc(addr, len, Memory::MEM_COMMIT, protection).is_null()
            }
        }

        unsafe fn decommit(addr: *mut u8, len: usize) -> bool {
            unsafe { Memory::VirtualFree(addr as *mut c_void, len, Memory::MEM_DECOMMIT).is_ok() }
        }

        unsafe fn release(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}
