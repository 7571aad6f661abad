//! Memory Manager
//!
//! Ties the loader heap and the physical memory map together and layers
//! constraint-aware allocation, protection of the loader image, and
//! finalization on top of the map primitives.
//!
//! The map-manipulation primitives ([`MemoryManager::insert`],
//! [`MemoryManager::add`], [`MemoryManager::dump`]) are always available.
//! The allocation side is compiled out under the `platform-mm` feature, where
//! the platform's own memory management takes its place.

use bitflags::bitflags;
use pyre_common::memory::MemoryKind;
use pyre_common::{PhysAddr, VirtAddr};

#[cfg(not(feature = "platform-mm"))]
use pyre_common::memory::{page, MemoryMap, MemoryMapEntry, MAX_MEMORY_RANGES};

use crate::heap::{Heap, HeapStorage};
#[cfg(not(feature = "platform-mm"))]
use crate::map::Direction;
use crate::map::{MemoryRange, RangeList};
use crate::target::Target;

#[cfg(not(feature = "platform-mm"))]
use crate::{boot_error, internal_error};

bitflags! {
    /// Behaviour flags for [`MemoryManager::allocate`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Place the region at the highest legal address within constraints,
        /// leaving low memory for other consumers.
        const HIGH = 1 << 0;
        /// Return `None` instead of raising a boot error when no free range
        /// satisfies the constraints.
        const CAN_FAIL = 1 << 1;
    }
}

/// A successful physical allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Loader-visible mapping of the allocated range.
    pub virt: VirtAddr,
    /// Physical address of the allocated range.
    pub phys: PhysAddr,
}

/// The loader's memory manager: the heap plus the physical memory map.
pub struct MemoryManager {
    heap: Heap,
    ranges: RangeList,
    target: &'static dyn Target,
}

impl MemoryManager {
    /// Create a manager over the given heap backing region.
    #[must_use]
    pub fn new(storage: &'static mut HeapStorage, target: &'static dyn Target) -> Self {
        Self {
            heap: Heap::new(storage),
            ranges: RangeList::new(),
            target,
        }
    }

    /// The loader heap.
    pub fn heap(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Insert a physical memory range, overwriting whatever it overlaps.
    /// See [`RangeList::insert_range`] for the exact semantics.
    pub fn insert(&mut self, start: PhysAddr, size: u64, kind: MemoryKind) {
        self.ranges.insert_range(&mut self.heap, start, size, kind);
    }

    /// Add a range of physical memory. Platform probes use this to seed the
    /// map.
    pub fn add(&mut self, start: PhysAddr, size: u64, kind: MemoryKind) {
        self.insert(start, size, kind);
    }

    /// The current ranges, in address order. Payload writers walk these to
    /// build their protocol-specific memory tags.
    pub fn iter_ranges(&self) -> impl Iterator<Item = MemoryRange> + '_ {
        self.ranges.iter()
    }

    /// Log the current memory map at debug level.
    pub fn dump(&self) {
        self.ranges.dump();
    }
}

#[cfg(not(feature = "platform-mm"))]
impl MemoryManager {
    /// Initialise the memory map: run the platform probe, then protect the
    /// loader's own image so it is never allocated over but is still handed
    /// back to the OS as free.
    pub fn init(&mut self) {
        let target = self.target;
        target.memory_probe(self);

        let (image_start, image_end) = target.image_bounds();
        let start = target.virt_to_phys(image_start).page_align_down();
        let end = target.virt_to_phys(image_end).page_align_up();
        self.protect(start, end.as_u64() - start.as_u64());

        log::debug!("memory: initial memory map:");
        self.dump();
    }

    /// Allocate a range of physical memory.
    ///
    /// Searches the free ranges for one able to satisfy the constraints,
    /// stamps the chosen placement with `kind` and returns both the physical
    /// address and the loader-visible mapping of it, so the memory is always
    /// accessible in the address space the loader runs in.
    ///
    /// * `size` - byte count, a multiple of the page size.
    /// * `align` - placement alignment, a power-of-two multiple of the page
    ///   size; zero means page alignment.
    /// * `min_addr` - lowest acceptable address, or null for the platform
    ///   minimum.
    /// * `max_addr` - highest acceptable address of the last byte, or null
    ///   for no constraint (clamped to the platform ceiling either way).
    /// * `kind` - classification for the new range; must not be
    ///   [`MemoryKind::Free`].
    /// * `flags` - see [`AllocFlags`].
    ///
    /// Returns `None` only when [`AllocFlags::CAN_FAIL`] is set and no free
    /// range satisfies the constraints; any other failure is fatal.
    pub fn allocate(
        &mut self,
        size: u64,
        align: u64,
        min_addr: PhysAddr,
        max_addr: PhysAddr,
        kind: MemoryKind,
        flags: AllocFlags,
    ) -> Option<Allocation> {
        if size == 0 || !page::is_aligned(size) {
            internal_error!("bad allocation size {:#x}", size);
        }
        let align = if align == 0 { page::SIZE } else { align };
        if !align.is_power_of_two() || !align.is_multiple_of(page::SIZE) {
            internal_error!("bad allocation alignment {:#x}", align);
        }
        if kind == MemoryKind::Free {
            internal_error!("allocations must not be free");
        }

        let min_addr = if min_addr.is_null() {
            self.target.phys_min()
        } else {
            min_addr
        };
        let mut max_addr = max_addr;
        if max_addr.is_null() || max_addr.as_u64() > self.target.phys_max().as_u64() {
            max_addr = self.target.phys_max();
        }
        if max_addr.as_u64() - min_addr.as_u64() < size - 1 {
            internal_error!(
                "allocation window {:#x}-{:#x} cannot hold {:#x} bytes",
                min_addr.as_u64(),
                max_addr.as_u64(),
                size
            );
        }

        let direction = if flags.contains(AllocFlags::HIGH) {
            Direction::HighToLow
        } else {
            Direction::LowToHigh
        };

        let mut cursor = self.ranges.first_in(direction);
        while let Some(node) = cursor {
            let range = self.ranges.get(node);
            if let Some(phys) = placement(&range, size, align, min_addr, max_addr, flags) {
                self.insert(PhysAddr::new(phys), size, kind);

                log::debug!(
                    "memory: allocated {:#x}-{:#x} (align: {:#x}, kind: {})",
                    phys,
                    phys + size,
                    align,
                    kind.label()
                );

                return Some(Allocation {
                    virt: self.target.phys_to_virt(PhysAddr::new(phys)),
                    phys: PhysAddr::new(phys),
                });
            }
            cursor = self.ranges.next_in(node, direction);
        }

        if flags.contains(AllocFlags::CAN_FAIL) {
            None
        } else {
            boot_error!("insufficient memory available (allocating {:#x} bytes)", size)
        }
    }

    /// Free a range obtained from [`MemoryManager::allocate`].
    ///
    /// The extent must lie entirely within a single non-free range; anything
    /// else is a fatal internal error.
    pub fn free(&mut self, virt: VirtAddr, size: u64) {
        let phys = self.target.virt_to_phys(virt);
        if !phys.is_page_aligned() || !page::is_aligned(size) || size == 0 {
            internal_error!("bad memory free of {:#x} + {:#x}", phys.as_u64(), size);
        }
        let last = phys.as_u64() + size - 1;

        let containing = self.iter_ranges().find(|range| {
            range.kind != MemoryKind::Free
                && phys.as_u64() >= range.start.as_u64()
                && last <= range.last_byte()
        });
        if containing.is_none() {
            internal_error!("bad memory free address {:#x}", phys.as_u64());
        }

        self.insert(phys, size, MemoryKind::Free);
    }

    /// Mark every free byte of `[start, start + size)` (page-aligned outward)
    /// as internal: reserved from allocation, but still handed back to the OS
    /// as free when the map is finalized. Used to keep the loader image from
    /// being allocated over.
    pub fn protect(&mut self, start: PhysAddr, size: u64) {
        if size == 0 {
            return;
        }
        let lo = page::align_down(start.as_u64());
        let hi = page::align_up(start.as_u64() + size) - 1;

        // Walk the window by address; insertion reshapes the list, so the
        // cursor never holds a node across a mutation.
        let mut pos = lo;
        while pos <= hi {
            let Some(range) = self.iter_ranges().find(|r| r.last_byte() >= pos) else {
                break;
            };
            if range.start.as_u64() > hi {
                break;
            }
            let range_last = range.last_byte();
            if range.kind == MemoryKind::Free {
                let overlap_start = pos.max(range.start.as_u64());
                let overlap_last = hi.min(range_last);
                self.insert(
                    PhysAddr::new(overlap_start),
                    overlap_last - overlap_start + 1,
                    MemoryKind::Internal,
                );
                pos = overlap_last + 1;
            } else {
                pos = range_last + 1;
            }
        }
    }

    /// Finalize the memory map for handoff to the OS.
    ///
    /// Internal ranges are reclaimed as free and re-merged, then the whole
    /// map moves into `out` and the manager's own list is left empty. Must be
    /// called once, after all allocations have been performed.
    pub fn finalize(&mut self, out: &mut MemoryMap) {
        // Reclaim loader-private memory.
        let mut cursor = self.ranges.first();
        while let Some(node) = cursor {
            let mut range = self.ranges.get(node);
            if range.kind == MemoryKind::Internal {
                range.kind = MemoryKind::Free;
                self.ranges.set(node, range);
                self.ranges.merge_neighbours(&mut self.heap, node);
            }
            cursor = self.ranges.next_of(node);
        }

        // Hand the ranges over and release their records.
        while let Some(node) = self.ranges.first() {
            let range = self.ranges.get(node);
            let pushed = out.push(MemoryMapEntry {
                start: range.start.as_u64(),
                size: range.size,
                kind: range.kind,
                _reserved: 0,
            });
            if pushed.is_err() {
                internal_error!("finalized memory map exceeds {} entries", MAX_MEMORY_RANGES);
            }
            self.ranges.unlink(node);
            // SAFETY: unlinked above and never referenced again.
            unsafe { RangeList::free_node(&mut self.heap, node) };
        }
    }
}

/// Compute where an allocation lands in `range`, if it fits the constraints.
#[cfg(not(feature = "platform-mm"))]
fn placement(
    range: &MemoryRange,
    size: u64,
    align: u64,
    min_addr: PhysAddr,
    max_addr: PhysAddr,
    flags: AllocFlags,
) -> Option<u64> {
    if range.kind != MemoryKind::Free {
        return None;
    }

    // Intersect the range with the requested window; it must be able to hold
    // the whole request.
    let match_start = min_addr.as_u64().max(range.start.as_u64());
    let match_end = max_addr.as_u64().min(range.last_byte());
    if match_end <= match_start || match_end - match_start + 1 < size {
        return None;
    }

    if flags.contains(AllocFlags::HIGH) {
        let start = align_down(match_end - size + 1, align);
        if start < match_start {
            return None;
        }
        Some(start)
    } else {
        let start = align_up(match_start, align);
        if start + size - 1 > match_end {
            return None;
        }
        Some(start)
    }
}

/// Align `value` up to the given power-of-two alignment.
#[cfg(not(feature = "platform-mm"))]
#[inline]
const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to the given power-of-two alignment.
#[cfg(not(feature = "platform-mm"))]
#[inline]
const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}
