//! Compile-time constants of the heap layout and the runtime knobs of a
//! single [`crate::Heap`].

/// Page size the heap rounds its region to. Page-aligned allocations are
/// aligned to this value.
pub const PAGE_SIZE: usize = 0x1000;

/// Sentinel written in every block header and footer.
pub const HEAP_MAGIC: u32 = 0x1238_90AB;

/// Default number of entries the free list can hold.
pub const HEAP_FREE_LIST_SIZE: usize = 0x400;

/// Knobs of a single heap. Passed to [`crate::Heap::with_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Fixed capacity of the free list.
    pub free_list_capacity: usize,
    /// The region never shrinks below this many bytes. `None` means the
    /// size the heap was created with.
    pub min_size: Option<usize>,
}

impl HeapConfig {
    pub const fn new() -> Self {
        Self {
            free_list_capacity: HEAP_FREE_LIST_SIZE,
            min_size: None,
        }
    }

    pub const fn with_free_list_capacity(mut self, capacity: usize) -> Self {
        self.free_list_capacity = capacity;
        self
    }

    pub const fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = Some(min_size);
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}
