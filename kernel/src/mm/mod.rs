//! # Memory Management
//!
//! The kernel heap is a block allocator over a fixed 100 MiB physical
//! region; it backs both the raw `kmalloc` family and, through a
//! `GlobalAlloc` shim, everything the `alloc` crate hands out. Because
//! the kernel's address space is identity mapped, heap pointers are
//! physical addresses, which is what the paging and process code relies
//! on when it maps buffers into user space.

pub mod heap;
pub mod paging;

use core::alloc::Layout;
use core::ptr::NonNull;

use spin::Mutex;

use crate::arch;
use crate::config::{HEAP_ADDRESS, HEAP_BLOCK_SIZE, HEAP_SIZE_BYTES, HEAP_TABLE_ADDRESS};

pub use heap::Heap;
pub use paging::{PageFlags, PagingChunk, PAGE_SIZE};

static KERNEL_HEAP: Mutex<Option<Heap>> = Mutex::new(None);

/// Creates the kernel heap at its fixed physical location. Called once,
/// before anything allocates.
pub fn kheap_init() {
    let heap = unsafe {
        Heap::create(
            HEAP_ADDRESS,
            HEAP_ADDRESS + HEAP_SIZE_BYTES,
            HEAP_TABLE_ADDRESS as *mut u8,
        )
    };
    match heap {
        Ok(heap) => {
            let blocks = heap.total_blocks();
            *KERNEL_HEAP.lock() = Some(heap);
            log::info!("kernel heap ready: {} blocks of {} bytes", blocks, HEAP_BLOCK_SIZE);
        }
        Err(err) => panic!("failed to create the kernel heap: {}", err),
    }
}

/// Creates a small kernel heap over host memory so code paths that use
/// `kmalloc` directly can run under `cargo test`.
#[cfg(test)]
pub fn kheap_init_for_tests() {
    let mut guard = KERNEL_HEAP.lock();
    if guard.is_some() {
        return;
    }

    const TEST_BLOCKS: usize = 1024;
    let size = TEST_BLOCKS * HEAP_BLOCK_SIZE;
    let layout = Layout::from_size_align(size, HEAP_BLOCK_SIZE).unwrap();
    let region = unsafe { alloc::alloc::alloc_zeroed(layout) };
    assert!(!region.is_null());
    let table = alloc::boxed::Box::leak(alloc::vec![0u8; TEST_BLOCKS].into_boxed_slice());

    let heap = unsafe {
        Heap::create(region as usize, region as usize + size, table.as_mut_ptr())
    }
    .unwrap();
    *guard = Some(heap);
}

/// Allocates from the kernel heap. Null on exhaustion.
pub fn kmalloc(size: usize) -> *mut u8 {
    arch::without_interrupts(|| {
        KERNEL_HEAP
            .lock()
            .as_mut()
            .map_or(core::ptr::null_mut(), |heap| heap.alloc(size))
    })
}

/// Allocates zeroed memory from the kernel heap.
pub fn kzalloc(size: usize) -> *mut u8 {
    arch::without_interrupts(|| {
        KERNEL_HEAP
            .lock()
            .as_mut()
            .map_or(core::ptr::null_mut(), |heap| heap.zalloc(size))
    })
}

/// Returns an allocation to the kernel heap.
///
/// # Safety
///
/// `ptr` must have come from `kmalloc`/`kzalloc` and not been freed yet.
pub unsafe fn kfree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    arch::without_interrupts(|| {
        if let Some(heap) = KERNEL_HEAP.lock().as_mut() {
            unsafe { heap.free(ptr) };
        }
    });
}

/// An owned, page-aligned, zero-initialized buffer. Program images,
/// stacks, and ELF file bytes live in these so their physical base can
/// be mapped into a task's address space.
pub struct PageBuffer {
    ptr: NonNull<u8>,
    size: usize,
}

unsafe impl Send for PageBuffer {}
unsafe impl Sync for PageBuffer {}

impl PageBuffer {
    /// Allocates `size` zeroed bytes at page alignment.
    pub fn zeroed(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size.max(1), PAGE_SIZE).ok()?;
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| Self { ptr, size })
    }

    /// Base address of the buffer.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Base address as a 32-bit physical address.
    pub fn phys(&self) -> u32 {
        self.addr() as u32
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size.max(1), PAGE_SIZE).unwrap();
        unsafe {
            alloc::alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

/// Global allocator routing `alloc` through the kernel heap.
///
/// Block granularity means every allocation is at least 4096-aligned,
/// which satisfies any layout the kernel's containers ask for.
#[cfg(not(test))]
mod global {
    use core::alloc::{GlobalAlloc, Layout};

    use crate::config::HEAP_BLOCK_SIZE;

    struct KernelAllocator;

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            if layout.align() > HEAP_BLOCK_SIZE {
                return core::ptr::null_mut();
            }
            super::kmalloc(layout.size())
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            unsafe { super::kfree(ptr) };
        }
    }

    #[global_allocator]
    static ALLOCATOR: KernelAllocator = KernelAllocator;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_buffer_is_page_aligned_and_zeroed() {
        let buffer = PageBuffer::zeroed(3 * PAGE_SIZE).unwrap();
        assert_eq!(buffer.addr() % PAGE_SIZE, 0);
        assert_eq!(buffer.len(), 3 * PAGE_SIZE);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
    }
}
