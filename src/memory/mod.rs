/*
 * Block Allocator
 *
 * Fixed size-class pool backing process records (including their stacks)
 * and timeout descriptors. One contiguous region is acquired at
 * initialization; a tail pointer carves fresh blocks when a class free
 * list is empty, and released blocks return to their class for reuse.
 *
 * DESIGN OVERVIEW:
 * - 21 size classes tuned for process records; adjust per application
 * - Allocation runs in process context only, under the pool spin mutex
 * - Release pushes onto a lock-free per-class intake stack and is
 *   therefore legal from interrupt handlers, which must never claim a
 *   mutex (the timeout handler retires expired alternation descriptors)
 * - The intake stack is push-only; `allocate` consumes it wholesale under
 *   the pool mutex, so the usual Treiber ABA hazard does not arise
 *
 * ERROR HANDLING:
 * - No class large enough, or pool exhaustion, is a fatal programming
 *   error: the image exits with a diagnostic
 */

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::alloc::Layout;

use crate::mutex::SpinMutex;
use crate::utils::fatal;

/// Block length for each size class, in bytes.
pub const BLOCK_SIZES: [usize; 21] = [
    18, 32, 48, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072, 4096, 6144, 8192,
    10240, 12288, 16384, 24576,
];

/// Number of size classes.
const NALLOC: usize = BLOCK_SIZES.len();

/// Carve granularity; keeps every block address 16-byte aligned.
const BLOCK_ALIGN: usize = 16;

/// A released block, chained into its class list.
struct FreeBlock {
    next: *mut FreeBlock,
}

/// Free lists plus the unbroken tail of the region.
struct Pool {
    free: [*mut FreeBlock; NALLOC],
    tail: *mut u8,
    tail_len: usize,
}

// Raw pointers into the region; all access is serialized by the mutex.
unsafe impl Send for Pool {}

static POOL: SpinMutex<Pool> = SpinMutex::new(Pool {
    free: [ptr::null_mut(); NALLOC],
    tail: ptr::null_mut(),
    tail_len: 0,
});

/// Per-class intake of released blocks (lock-free, push-only).
static INTAKE: [AtomicPtr<FreeBlock>; NALLOC] =
    [const { AtomicPtr::new(ptr::null_mut()) }; NALLOC];

/// Initializes the pool over a freshly acquired region of `total` bytes.
pub fn init(total: usize) {
    let layout = match Layout::from_size_align(total, BLOCK_ALIGN) {
        Ok(layout) => layout,
        Err(_) => fatal("memory: bad pool size"),
    };
    let region = unsafe { std::alloc::alloc(layout) };
    if region.is_null() {
        fatal("memory: cannot acquire pool region");
    }

    let mut pool = POOL.lock();
    pool.tail = region;
    pool.tail_len = total;
    log::info!("memory: {} byte pool, {} size classes", total, NALLOC);
}

/// Finds the index of the smallest class whose blocks hold `size` bytes.
pub fn find_index(size: usize) -> usize {
    for (index, len) in BLOCK_SIZES.iter().enumerate() {
        if *len >= size {
            return index;
        }
    }
    fatal("memory: no block class large enough");
}

/// Allocates a block of the class implied by `index`.
///
/// Process context only. Drains the class intake before touching the tail
/// so released blocks are reused ahead of fresh carving.
pub fn allocate(index: usize) -> *mut u8 {
    let mut pool = POOL.lock();

    // adopt blocks released since the last allocation of this class
    let mut head = INTAKE[index].swap(ptr::null_mut(), Ordering::AcqRel);
    while !head.is_null() {
        unsafe {
            let next = (*head).next;
            (*head).next = pool.free[index];
            pool.free[index] = head;
            head = next;
        }
    }

    let block = pool.free[index];
    if !block.is_null() {
        pool.free[index] = unsafe { (*block).next };
        return block as *mut u8;
    }

    // class list empty, carve from the tail
    let len = BLOCK_SIZES[index].next_multiple_of(BLOCK_ALIGN);
    if pool.tail_len < len {
        fatal("memory: out of pool memory");
    }
    let block = pool.tail;
    pool.tail = unsafe { pool.tail.add(len) };
    pool.tail_len -= len;
    block
}

/// Returns a block to its class.
///
/// Lock-free; callable from interrupt handlers.
pub fn release(index: usize, addr: *mut u8) {
    let block = addr as *mut FreeBlock;
    loop {
        let head = INTAKE[index].load(Ordering::Acquire);
        unsafe {
            (*block).next = head;
        }
        if INTAKE[index]
            .compare_exchange_weak(head, block, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_picks_smallest_sufficient_class() {
        assert_eq!(find_index(1), 0);
        assert_eq!(find_index(18), 0);
        assert_eq!(find_index(19), 1);
        assert_eq!(find_index(4096), 14);
        assert_eq!(find_index(24576), 20);
    }

    #[test]
    fn released_blocks_are_reused() {
        init(64 * 1024);
        let index = find_index(1024);
        let a = allocate(index);
        release(index, a);
        let b = allocate(index);
        assert_eq!(a, b);
    }
}
