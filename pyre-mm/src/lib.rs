//! Boot-Time Memory Manager
//!
//! The shared spine of the Pyre loader: every platform entry point and every
//! payload format goes through this crate to claim physical memory while the
//! kernel is being put in place.
//!
//! Two cooperating pieces, both living in the loader's own address space:
//!
//! - The [`Heap`]: a fixed-size allocator for the loader's transient working
//!   storage. Nothing on it survives into the kernel.
//! - The physical memory map: an address-ordered list of typed, page-aligned
//!   ranges covering all memory the platform announced, with constraint-aware
//!   allocation ([`MemoryManager::allocate`]), protection of the loader
//!   image, and finalization into the handoff map the kernel receives.
//!
//! The loader runs single-threaded with interrupts disabled; every operation
//! completes synchronously. Fatal conditions do not return: they are raised
//! through [`internal_error!`] or [`boot_error!`] and end in the binary's
//! panic handler.
//!
//! # Platform split
//!
//! Some targets own physical memory management themselves (UEFI boot
//! services, for one) for as long as the loader runs. Building with the
//! `platform-mm` feature keeps the heap and the map primitives and compiles
//! out allocation, protection and finalization; the platform supplies
//! equivalents.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod error;
pub mod heap;
pub mod manager;
pub mod map;
pub mod target;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, Once};

pub use heap::{Heap, HeapStats, HeapStorage, HEAP_SIZE};
pub use manager::{AllocFlags, Allocation, MemoryManager};
pub use map::{Direction, MemoryRange, RangeList};
pub use target::Target;

/// Statically reserved heap backing region, claimed exactly once by [`init`].
struct StorageCell {
    claimed: AtomicBool,
    storage: UnsafeCell<HeapStorage>,
}

// SAFETY: the `claimed` flag guarantees at most one mutable reference to the
// storage is ever handed out.
unsafe impl Sync for StorageCell {}

static HEAP_STORAGE: StorageCell = StorageCell {
    claimed: AtomicBool::new(false),
    storage: UnsafeCell::new(HeapStorage::new()),
};

fn claim_heap_storage() -> &'static mut HeapStorage {
    if HEAP_STORAGE.claimed.swap(true, Ordering::AcqRel) {
        crate::internal_error!("heap storage already claimed");
    }
    // SAFETY: the swap above makes this the only claim that ever succeeds.
    unsafe { &mut *HEAP_STORAGE.storage.get() }
}

/// The process-wide memory manager.
static MANAGER: Once<Mutex<MemoryManager>> = Once::new();

/// Construct the process-wide memory manager and initialise the memory map.
///
/// Called once by the platform entry code before anything else touches the
/// crate's globals. On full builds this runs the platform memory probe and
/// protects the loader image; under `platform-mm` it only sets up the heap
/// and an empty map.
pub fn init(target: &'static dyn Target) {
    MANAGER.call_once(|| Mutex::new(MemoryManager::new(claim_heap_storage(), target)));
    #[cfg(not(feature = "platform-mm"))]
    with(|mm| mm.init());
}

/// Run `f` with exclusive access to the process-wide memory manager.
pub fn with<R>(f: impl FnOnce(&mut MemoryManager) -> R) -> R {
    let Some(manager) = MANAGER.get() else {
        crate::internal_error!("memory manager used before init");
    };
    f(&mut manager.lock())
}
