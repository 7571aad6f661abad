//! Platform Target Interface
//!
//! Everything the memory manager needs from the surrounding loader comes in
//! through this trait: the physical address window the loader can reach, the
//! translation between loader virtual addresses and physical memory, the
//! firmware memory probe, and the bounds of the loader's own image.
//!
//! Implementations are process-wide singletons supplied by the platform entry
//! code (BIOS, EFI, ...).

use pyre_common::{PhysAddr, VirtAddr};

use crate::manager::MemoryManager;

/// Platform services consumed by the memory manager.
pub trait Target: Sync {
    /// Lowest physical address allocations may start at when the caller gives
    /// no constraint.
    fn phys_min(&self) -> PhysAddr {
        PhysAddr::new(0)
    }

    /// Highest physical address accessible to the loader. Allocation windows
    /// are clamped to this ceiling.
    fn phys_max(&self) -> PhysAddr {
        PhysAddr::new(0xFFFF_FFFF)
    }

    /// Translate a loader virtual address to a physical address.
    fn virt_to_phys(&self, addr: VirtAddr) -> PhysAddr;

    /// Translate a physical address to a loader virtual address.
    fn phys_to_virt(&self, addr: PhysAddr) -> VirtAddr;

    /// Announce the physical memory known to the firmware by calling
    /// [`MemoryManager::add`] for each range.
    fn memory_probe(&self, mm: &mut MemoryManager);

    /// Bounds of the loader's own image, as exported by the linker.
    fn image_bounds(&self) -> (VirtAddr, VirtAddr);
}
