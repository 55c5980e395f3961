//! # Memory Layout
//!
//! Fixed physical and virtual layout of the 32-bit kernel, plus the address newtypes the
//! rest of the crate speaks in.
//!
//! ```text
//!  Virtual                                  Physical
//!  0xFFFF_FFFF ┌───────────────┐
//!              │    devices    │
//!              ├───────────────┤
//!              │ direct map of │ ────────▶  [0, PHYSTOP)
//!              │ physical RAM  │
//!  KERNBASE ── ├───────────────┤
//!              │     user      │
//!  0x0000_0000 └───────────────┘
//! ```

use core::fmt;

use static_assertions::const_assert;

// =============================================================================
// CONSTANTS
// =============================================================================

/// First kernel virtual address; physical memory is mapped linearly from here
pub const KERNBASE: u32 = 0x8000_0000;

/// Start of extended memory, where the kernel image is loaded
pub const EXTMEM: u32 = 0x0010_0000;

/// Size of the window mapped by the entry page directory
pub const ENTRY_MAP_SIZE: u32 = 0x0040_0000;

/// Default top of physical memory
pub const PHYSTOP: u32 = 0x0E00_0000;

/// Page size
pub const PGSIZE: u32 = 4096;

/// Size of a per-processor kernel stack
pub const KSTACKSIZE: u32 = PGSIZE;

/// Physical address the startup trampoline is copied to
pub const TRAMPOLINE_PA: u32 = 0x7000;

/// Maximum number of processors
pub const NCPU: usize = 8;

/// Entries in a page directory
pub const NPDENTRIES: usize = 1024;

/// Shift of the page directory index within a virtual address
pub const PDXSHIFT: u32 = 22;

const_assert!(KSTACKSIZE == PGSIZE);
const_assert!(ENTRY_MAP_SIZE == 1 << PDXSHIFT);
const_assert!(TRAMPOLINE_PA % PGSIZE == 0);
const_assert!(TRAMPOLINE_PA < EXTMEM);
const_assert!(PHYSTOP < KERNBASE);

// =============================================================================
// PHYSICAL ADDRESS
// =============================================================================

/// A physical address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    /// Create a physical address
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Raw value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Address of this location in the kernel direct map
    #[inline]
    pub const fn to_virt(self) -> VirtAddr {
        VirtAddr(self.0 + KERNBASE)
    }

    /// Round down to a page boundary
    #[inline]
    pub const fn page_round_down(self) -> Self {
        Self(self.0 & !(PGSIZE - 1))
    }

    /// Round up to a page boundary
    #[inline]
    pub const fn page_round_up(self) -> Self {
        Self((self.0 + PGSIZE - 1) & !(PGSIZE - 1))
    }

    /// Is this address page aligned?
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PGSIZE == 0
    }

    /// Offset this address by `bytes`
    #[inline]
    pub const fn add(self, bytes: u32) -> Self {
        Self(self.0 + bytes)
    }

    /// Offset this address down by `bytes`
    #[inline]
    pub const fn sub(self, bytes: u32) -> Self {
        Self(self.0 - bytes)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// =============================================================================
// VIRTUAL ADDRESS
// =============================================================================

/// A kernel virtual address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    /// Create a virtual address
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Address of a kernel object
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u32)
    }

    /// Raw value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Physical address behind a direct-map address
    ///
    /// Only meaningful for addresses at or above [`KERNBASE`].
    #[inline]
    pub const fn to_phys(self) -> PhysAddr {
        debug_assert!(self.0 >= KERNBASE);
        PhysAddr(self.0 - KERNBASE)
    }

    /// Page directory index
    #[inline]
    pub const fn pdx(self) -> usize {
        (self.0 >> PDXSHIFT) as usize
    }

    /// Offset within a 4 MiB superpage
    #[inline]
    pub const fn superpage_offset(self) -> u32 {
        self.0 & (ENTRY_MAP_SIZE - 1)
    }

    /// Raw pointer to this address
    #[inline]
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    /// Raw mutable pointer to this address
    #[inline]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
