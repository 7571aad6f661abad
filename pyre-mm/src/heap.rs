//! Loader Heap
//!
//! A fixed-size allocator for the loader's own transient working storage.
//! Nothing allocated here ever reaches the kernel; the backing region is part
//! of the loader image and is reclaimed with it.
//!
//! The region is carved into chunks, each prefixed by a header. Chunks tile
//! the region contiguously and are linked in address order; freeing eagerly
//! coalesces with both neighbours, so two adjacent free chunks never exist.
//! The heap never grows: exhaustion is a fatal internal error.

use core::mem::size_of;
use core::ptr::{self, NonNull};

use crate::internal_error;

/// Size of the heap backing region (128 KiB).
pub const HEAP_SIZE: usize = 128 * 1024;

/// Allocation granule; payloads are aligned to this.
const ALLOC_ALIGN: usize = 8;

/// Size of a chunk header.
const HEADER_SIZE: usize = size_of::<ChunkHeader>();

const _: () = assert!(
    HEADER_SIZE % ALLOC_ALIGN == 0,
    "chunk payloads must stay 8-byte aligned"
);

/// Backing storage for a [`Heap`], page-aligned as the platform requires.
#[repr(align(4096))]
pub struct HeapStorage([u8; HEAP_SIZE]);

impl HeapStorage {
    #[must_use]
    pub const fn new() -> Self {
        Self([0; HEAP_SIZE])
    }
}

impl Default for HeapStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Header prefixing every chunk of the region. The payload starts immediately
/// after it.
#[repr(C)]
struct ChunkHeader {
    /// Total size of the chunk including this header.
    size: usize,
    /// Whether the chunk is allocated.
    allocated: bool,
    /// Previous chunk by address, if any.
    prev: Option<NonNull<ChunkHeader>>,
    /// Next chunk by address, if any.
    next: Option<NonNull<ChunkHeader>>,
}

/// Snapshot of the heap's chunk structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of chunks, allocated and free.
    pub chunks: usize,
    /// Bytes in free chunks, headers included.
    pub free_bytes: usize,
    /// Size of the largest free chunk, header included.
    pub largest_free: usize,
}

/// The loader heap.
pub struct Heap {
    storage: &'static mut HeapStorage,
    /// First chunk of the region; `None` until the first allocation.
    head: Option<NonNull<ChunkHeader>>,
}

// SAFETY: all chunk pointers reference the exclusively owned backing region,
// so moving the heap between threads is sound; access is serialised by the
// owner.
unsafe impl Send for Heap {}

impl Heap {
    /// Create a heap over the given backing region. The initial free chunk is
    /// created lazily by the first allocation.
    #[must_use]
    pub fn new(storage: &'static mut HeapStorage) -> Self {
        Self {
            storage,
            head: None,
        }
    }

    fn base_addr(&self) -> usize {
        self.storage.0.as_ptr() as usize
    }

    fn ensure_initialised(&mut self) {
        if self.head.is_some() {
            return;
        }
        let base = self.storage.0.as_mut_ptr().cast::<ChunkHeader>();
        // SAFETY: the region is exclusively ours, 4 KiB aligned and large
        // enough for a header.
        unsafe {
            base.write(ChunkHeader {
                size: HEAP_SIZE,
                allocated: false,
                prev: None,
                next: None,
            });
            self.head = Some(NonNull::new_unchecked(base));
        }
    }

    /// Allocate `size` bytes of transient loader memory.
    ///
    /// The returned pointer is 8-byte aligned and never null; zero-sized
    /// requests and exhaustion are fatal internal errors.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            internal_error!("zero-sized heap allocation");
        }

        let size = align_up(size, ALLOC_ALIGN);
        let total = size + HEADER_SIZE;

        self.ensure_initialised();

        // First fit from the bottom of the region.
        let mut cursor = self.head;
        let chunk = loop {
            let Some(chunk) = cursor else {
                internal_error!("exhausted heap space (want {} bytes)", size);
            };
            // SAFETY: chunk headers are created only by this allocator and
            // stay valid for the lifetime of the region.
            let header = unsafe { chunk.as_ref() };
            if !header.allocated && header.size >= total {
                break chunk;
            }
            cursor = header.next;
        };

        // SAFETY: `chunk` came from the live chunk list.
        unsafe {
            let header = chunk.as_ptr();
            // Split when the remainder can hold a header plus the minimum
            // payload; otherwise hand out the whole chunk.
            if (*header).size >= total + HEADER_SIZE + ALLOC_ALIGN {
                let rest = chunk.as_ptr().cast::<u8>().add(total).cast::<ChunkHeader>();
                rest.write(ChunkHeader {
                    size: (*header).size - total,
                    allocated: false,
                    prev: Some(chunk),
                    next: (*header).next,
                });
                let rest = NonNull::new_unchecked(rest);
                if let Some(next) = (*header).next {
                    (*next.as_ptr()).prev = Some(rest);
                }
                (*header).next = Some(rest);
                (*header).size = total;
            }
            (*header).allocated = true;
            chunk.as_ptr().cast::<u8>().add(HEADER_SIZE)
        }
    }

    /// Free an allocation made on this heap.
    ///
    /// Passing null is a no-op. A pointer that is not a live allocation from
    /// this heap (including a second free of the same one) is a fatal
    /// internal error.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by [`Heap::allocate`]
    /// or [`Heap::reallocate`], and the allocation must no longer be
    /// referenced.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let chunk = self.chunk_from_payload(ptr);

        // SAFETY: `chunk_from_payload` verified that `ptr` lies inside the
        // region on an allocation boundary, so the header is ours.
        unsafe {
            if !(*chunk.as_ptr()).allocated {
                internal_error!("double free on address {:p}", ptr);
            }
            (*chunk.as_ptr()).allocated = false;

            // Coalesce with the following chunk, then the preceding one.
            if let Some(next) = (*chunk.as_ptr()).next {
                if !(*next.as_ptr()).allocated {
                    assert!(
                        chunk.as_ptr().cast::<u8>().add((*chunk.as_ptr()).size)
                            == next.as_ptr().cast::<u8>(),
                        "heap chunk list out of order"
                    );
                    (*chunk.as_ptr()).size += (*next.as_ptr()).size;
                    (*chunk.as_ptr()).next = (*next.as_ptr()).next;
                    if let Some(after) = (*chunk.as_ptr()).next {
                        (*after.as_ptr()).prev = Some(chunk);
                    }
                }
            }
            if let Some(prev) = (*chunk.as_ptr()).prev {
                if !(*prev.as_ptr()).allocated {
                    assert!(
                        prev.as_ptr().cast::<u8>().add((*prev.as_ptr()).size)
                            == chunk.as_ptr().cast::<u8>(),
                        "heap chunk list out of order"
                    );
                    (*prev.as_ptr()).size += (*chunk.as_ptr()).size;
                    (*prev.as_ptr()).next = (*chunk.as_ptr()).next;
                    if let Some(after) = (*chunk.as_ptr()).next {
                        (*after.as_ptr()).prev = Some(prev);
                    }
                }
            }
        }
    }

    /// Resize an allocation.
    ///
    /// A `size` of zero frees `ptr` and returns null; a null `ptr` behaves as
    /// [`Heap::allocate`]. When the rounded size matches the current capacity
    /// the allocation is returned unchanged, otherwise the contents move to a
    /// fresh allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this heap; when the
    /// contents move, the old pointer becomes invalid.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.free(ptr) };
            return ptr::null_mut();
        }

        let size = align_up(size, ALLOC_ALIGN);

        let old_payload = if ptr.is_null() {
            0
        } else {
            let chunk = self.chunk_from_payload(ptr);
            // SAFETY: validated header.
            let capacity = unsafe { (*chunk.as_ptr()).size } - HEADER_SIZE;
            if capacity == size {
                return ptr;
            }
            capacity
        };

        let new = self.allocate(size);
        if !ptr.is_null() {
            // SAFETY: both allocations are live, at least
            // `min(old_payload, size)` bytes long, and distinct.
            unsafe {
                ptr::copy_nonoverlapping(ptr, new, old_payload.min(size));
                self.free(ptr);
            }
        }
        new
    }

    /// Snapshot of chunk structure and free space.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            chunks: 0,
            free_bytes: 0,
            largest_free: 0,
        };
        let mut cursor = self.head;
        while let Some(chunk) = cursor {
            // SAFETY: live chunk list.
            let header = unsafe { chunk.as_ref() };
            stats.chunks += 1;
            if !header.allocated {
                stats.free_bytes += header.size;
                stats.largest_free = stats.largest_free.max(header.size);
            }
            cursor = header.next;
        }
        stats
    }

    /// Recover the chunk header behind a payload pointer, checking that the
    /// pointer can actually have come from this heap.
    fn chunk_from_payload(&self, ptr: *mut u8) -> NonNull<ChunkHeader> {
        let base = self.base_addr();
        let addr = ptr as usize;
        if addr < base + HEADER_SIZE
            || addr >= base + HEAP_SIZE
            || (addr - base) % ALLOC_ALIGN != 0
        {
            internal_error!("bad heap address {:p}", ptr);
        }
        // SAFETY: in range and non-null by the checks above.
        unsafe { NonNull::new_unchecked(ptr.sub(HEADER_SIZE).cast::<ChunkHeader>()) }
    }
}

/// Align `value` up to the given power-of-two alignment.
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    fn new_heap() -> Heap {
        Heap::new(Box::leak(Box::new(HeapStorage::new())))
    }

    #[test]
    fn test_first_fit_reuse() {
        let mut heap = new_heap();
        let p = heap.allocate(24);
        let q = heap.allocate(24);
        unsafe { q.write_bytes(0xAB, 24) };

        unsafe { heap.free(p) };
        let r = heap.allocate(24);
        assert_eq!(r, p);

        for i in 0..24 {
            assert_eq!(unsafe { *q.add(i) }, 0xAB);
        }
    }

    #[test]
    fn test_split_leaves_remainder() {
        let mut heap = new_heap();
        let p = heap.allocate(24);
        unsafe { p.write_bytes(0x11, 24) };

        let stats = heap.stats();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.free_bytes, HEAP_SIZE - 24 - HEADER_SIZE);
    }

    #[test]
    fn test_free_restores_state() {
        let mut heap = new_heap();
        let warm = heap.allocate(16);
        unsafe { heap.free(warm) };

        let baseline = heap.stats();
        assert_eq!(baseline.chunks, 1);
        assert_eq!(baseline.free_bytes, HEAP_SIZE);

        let p = heap.allocate(64);
        assert_ne!(heap.stats(), baseline);
        unsafe { heap.free(p) };
        assert_eq!(heap.stats(), baseline);
    }

    #[test]
    fn test_coalesce_spans_both_neighbours() {
        let mut heap = new_heap();
        let a = heap.allocate(100);
        let b = heap.allocate(200);

        unsafe {
            heap.free(a);
            heap.free(b);
        }

        let stats = heap.stats();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.free_bytes, HEAP_SIZE);
        assert_eq!(stats.largest_free, HEAP_SIZE);
    }

    #[test]
    fn test_null_free_is_noop() {
        let mut heap = new_heap();
        unsafe { heap.free(ptr::null_mut()) };
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_fatal() {
        let mut heap = new_heap();
        let p = heap.allocate(32);
        unsafe {
            heap.free(p);
            heap.free(p);
        }
    }

    #[test]
    #[should_panic(expected = "zero-sized heap allocation")]
    fn test_zero_allocation_is_fatal() {
        let mut heap = new_heap();
        heap.allocate(0);
    }

    #[test]
    #[should_panic(expected = "exhausted heap space")]
    fn test_exhaustion_is_fatal() {
        let mut heap = new_heap();
        heap.allocate(HEAP_SIZE);
    }

    #[test]
    #[should_panic(expected = "bad heap address")]
    fn test_foreign_pointer_is_fatal() {
        let mut heap = new_heap();
        let mut outside = 0u64;
        unsafe { heap.free((&mut outside as *mut u64).cast()) };
    }

    #[test]
    fn test_realloc_null_and_same_size() {
        let mut heap = new_heap();
        let p = unsafe { heap.reallocate(ptr::null_mut(), 40) };
        assert!(!p.is_null());
        unsafe { p.write_bytes(0x5A, 40) };

        let same = unsafe { heap.reallocate(p, 40) };
        assert_eq!(same, p);
    }

    #[test]
    fn test_realloc_moves_and_copies() {
        let mut heap = new_heap();
        let p = heap.allocate(40);
        unsafe { p.write_bytes(0x5A, 40) };

        let bigger = unsafe { heap.reallocate(p, 120) };
        assert_ne!(bigger, p);
        for i in 0..40 {
            assert_eq!(unsafe { *bigger.add(i) }, 0x5A);
        }

        let gone = unsafe { heap.reallocate(bigger, 0) };
        assert!(gone.is_null());
        assert_eq!(heap.stats().free_bytes, HEAP_SIZE);
    }

    #[test]
    fn test_realloc_shrink_moves() {
        let mut heap = new_heap();
        let p = heap.allocate(48);
        unsafe { p.write_bytes(0x3C, 48) };

        let smaller = unsafe { heap.reallocate(p, 40) };
        assert_ne!(smaller, p);
        for i in 0..40 {
            assert_eq!(unsafe { *smaller.add(i) }, 0x3C);
        }
    }
}
