//! # Entry Page Directory
//!
//! The page directory a processor runs on between the trampoline enabling paging and
//! the kernel page table being loaded. Two 4 MiB superpages map the same physical
//! window:
//!
//! ```text
//!   Virtual                          Physical
//!   [0x0000_0000, 0x0040_0000) ──┐
//!                                ├──▶ [0x0000_0000, 0x0040_0000)
//!   [0x8000_0000, 0x8040_0000) ──┘
//! ```
//!
//! The low alias keeps the trampoline's own instruction stream valid across the switch
//! to paging; the high alias is where kernel code, the entry routine and the kernel
//! stack live.

use core::mem::{align_of, size_of};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::memlayout::{KERNBASE, NPDENTRIES, PDXSHIFT, PGSIZE, PhysAddr, VirtAddr};

bitflags! {
    /// Page directory entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PdeFlags: u32 {
        /// Present
        const PRESENT = 1 << 0;
        /// Writable
        const WRITABLE = 1 << 1;
        /// User accessible
        const USER = 1 << 2;
        /// 4 MiB page
        const PAGE_SIZE = 1 << 7;
    }
}

/// Mask of the physical frame bits of a 4 MiB mapping
const SUPERPAGE_FRAME_MASK: u32 = !((1 << PDXSHIFT) - 1);

/// Page directory entry
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pde(u32);

impl Pde {
    /// Entry that maps nothing
    pub const fn empty() -> Self {
        Self(0)
    }

    /// 4 MiB mapping of the superpage starting at `pa`
    pub const fn superpage(pa: PhysAddr, flags: PdeFlags) -> Self {
        Self((pa.as_u32() & SUPERPAGE_FRAME_MASK) | flags.union(PdeFlags::PAGE_SIZE).bits())
    }

    /// Raw entry value
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Flags
    pub const fn flags(self) -> PdeFlags {
        PdeFlags::from_bits_truncate(self.0)
    }

    /// Is the entry present?
    pub const fn is_present(self) -> bool {
        self.flags().contains(PdeFlags::PRESENT)
    }

    /// Physical frame of a superpage entry
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & SUPERPAGE_FRAME_MASK)
    }
}

impl core::fmt::Debug for Pde {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pde")
            .field("frame", &self.frame())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Page-aligned array of page directory entries
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [Pde; NPDENTRIES],
}

const_assert_eq!(size_of::<PageDirectory>(), PGSIZE as usize);
const_assert_eq!(align_of::<PageDirectory>(), PGSIZE as usize);

impl PageDirectory {
    /// Directory with no mappings
    pub const fn empty() -> Self {
        Self {
            entries: [Pde::empty(); NPDENTRIES],
        }
    }

    /// Directory mapping the low 4 MiB at both 0 and [`KERNBASE`]
    pub const fn entry() -> Self {
        let flags = PdeFlags::PRESENT.union(PdeFlags::WRITABLE);
        let low = Pde::superpage(PhysAddr::new(0), flags);

        let mut dir = Self::empty();
        dir.entries[0] = low;
        dir.entries[VirtAddr::new(KERNBASE).pdx()] = low;
        dir
    }

    /// Entry at `index`
    pub fn get(&self, index: usize) -> Option<Pde> {
        self.entries.get(index).copied()
    }

    /// Present entries with their indices
    pub fn present(&self) -> impl Iterator<Item = (usize, Pde)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, pde)| pde.is_present())
    }

    /// Physical address `va` resolves to, if it is mapped
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let pde = self.entries[va.pdx()];
        if !pde.is_present() || !pde.flags().contains(PdeFlags::PAGE_SIZE) {
            return None;
        }
        Some(pde.frame().add(va.superpage_offset()))
    }
}

impl core::fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.present()).finish()
    }
}

/// Page directory loaded by the trampoline
pub static ENTRY_PGDIR: PageDirectory = PageDirectory::entry();
