//! A kernel-style heap that lives inside the memory it manages.
//!
//! The heap owns a span of addresses `start..max`. Its free list sits at the
//! bottom of the span, and blocks fill the region that follows it up to the
//! current end. Every block carries a header and a footer, so neighbours are
//! found in O(1) and merged on free.
//!
//! ```text
//!  base                                                              max
//!   +-----------+-----+--------------+-----------+--------+-------+......+
//!   | free list | pad | used | hole  |   used    |  hole  | used  |      |
//!   +-----------+-----+--------------+-----------+--------+-------+......+
//!                     ^                                           ^
//!                 region start                               region end
//! ```
//!
//! Memory behind the region is supplied by a [`PageBacking`]. [`FlatMemory`]
//! is for address spaces where everything is already usable, [`Reservation`]
//! reserves address space from the operating system and commits pages as the
//! region grows.
//!
//! ```no_run
//! use kheap::{Heap, Reservation};
//!
//! let reservation = Reservation::new(0x40_0000).unwrap();
//! let base = reservation.start();
//!
//! let mut heap =
//!     unsafe { Heap::create(base, base + 0x10_0000, base + 0x40_0000, reservation).unwrap() };
//!
//! let page = heap.allocate(100, true).unwrap();
//! assert_eq!(page.as_ptr() as usize % kheap::PAGE_SIZE, 0);
//!
//! unsafe { heap.free(page.as_ptr()).unwrap() };
//! ```

mod alloc;
mod block;
pub mod config;
mod dealloc;
pub mod error;
mod freelist;
mod heap;
pub mod kernel;
mod region;
mod utils;

pub use config::{HEAP_FREE_LIST_SIZE, HEAP_MAGIC, HeapConfig, PAGE_SIZE};
pub use error::{BackingError, HeapError, Result};
pub use heap::{BlockInfo, Blocks, Heap, HeapStats};
pub use kernel::{FlatMemory, PageBacking, Reservation};
