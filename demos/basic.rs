use kheap::{Heap, HeapConfig, PAGE_SIZE, Reservation};

const INITIAL_SIZE: usize = 0x10_0000;
const MAX_SIZE: usize = 0x40_0000;

fn log_alloc(addr: *mut u8, size: usize, page_align: bool) {
    println!("Requested {size} bytes of memory (page aligned: {page_align})");
    println!("Received this address: {addr:?}");
}

fn main() -> kheap::Result<()> {
    let reservation = Reservation::new(MAX_SIZE)?;
    let base = reservation.start();

    let config = HeapConfig::new().with_free_list_capacity(64);
    let mut heap = unsafe {
        Heap::with_config(base, base + INITIAL_SIZE, base + MAX_SIZE, reservation, config)?
    };

    println!("{heap:?}");

    let addr1 = heap.allocate(8, false)?;
    log_alloc(addr1.as_ptr(), 8, false);

    let addr2 = heap.allocate(100, true)?;
    log_alloc(addr2.as_ptr(), 100, true);
    assert_eq!(addr2.as_ptr() as usize % PAGE_SIZE, 0);

    // Larger than the initial region, the heap grows to make room.
    let addr3 = heap.allocate(2 * INITIAL_SIZE, false)?;
    log_alloc(addr3.as_ptr(), 2 * INITIAL_SIZE, false);
    println!("Heap end after growing: {:#x}", heap.end_address());

    for block in heap.blocks() {
        let block = block?;
        println!(
            "  {:#x} {:>8} bytes {}",
            block.address,
            block.size,
            if block.allocated { "used" } else { "free" }
        );
    }

    unsafe {
        heap.free(addr3.as_ptr())?;
        println!("Heap end after freeing the large block: {:#x}", heap.end_address());

        heap.free(addr1.as_ptr())?;
        heap.free(addr2.as_ptr())?;
    }

    println!("{:#?}", heap.stats());
    heap.check_integrity()
}
