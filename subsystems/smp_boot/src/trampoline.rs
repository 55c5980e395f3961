//! # Startup Trampoline
//!
//! A woken processor starts in real mode at [`TRAMPOLINE_PA`]. The trampoline switches
//! it to protected mode, turns on paging with the entry page directory, loads a stack
//! and calls into the kernel. What it needs for that comes from three words placed
//! directly below its first instruction:
//!
//! ```text
//!   TRAMPOLINE_PA - 12   ┌──────────────────────┐
//!                        │ page directory (PA)  │
//!   TRAMPOLINE_PA -  8   ├──────────────────────┤
//!                        │ entry routine  (VA)  │
//!   TRAMPOLINE_PA -  4   ├──────────────────────┤
//!                        │ stack top      (VA)  │
//!   TRAMPOLINE_PA        ├──────────────────────┤
//!                        │ trampoline code ...  │
//!                        └──────────────────────┘
//! ```
//!
//! There is a single set of slots. Bring-up writes them for one processor, signals it,
//! and waits for it to report in before writing them again.

use core::mem::{offset_of, size_of};

use static_assertions::const_assert_eq;

use crate::error::{BootError, BootResult};
use crate::memlayout::{PGSIZE, PhysAddr, TRAMPOLINE_PA, VirtAddr};
use crate::platform::PhysMemory;

/// Distance of the stack-top slot below the entry point
pub const STACK_SLOT: u32 = 4;

/// Distance of the entry-routine slot below the entry point
pub const ENTRY_SLOT: u32 = 8;

/// Distance of the page-directory slot below the entry point
pub const PGDIR_SLOT: u32 = 12;

/// Parameters one woken processor reads from the slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TrampolineParams {
    /// Physical address loaded into CR3
    pub pgdir: PhysAddr,
    /// Routine the trampoline calls once paging is on
    pub entry: VirtAddr,
    /// Initial stack pointer (one past the top of the stack)
    pub stack_top: VirtAddr,
}

const_assert_eq!(size_of::<TrampolineParams>(), PGDIR_SLOT as usize);
const_assert_eq!(offset_of!(TrampolineParams, pgdir), (PGDIR_SLOT - PGDIR_SLOT) as usize);
const_assert_eq!(offset_of!(TrampolineParams, entry), (PGDIR_SLOT - ENTRY_SLOT) as usize);
const_assert_eq!(offset_of!(TrampolineParams, stack_top), (PGDIR_SLOT - STACK_SLOT) as usize);

/// The trampoline's low-memory home
#[derive(Debug)]
pub struct Trampoline {
    entry: PhysAddr,
}

impl Trampoline {
    /// Trampoline at [`TRAMPOLINE_PA`]
    pub const fn new() -> Self {
        Self::at(PhysAddr::new(TRAMPOLINE_PA))
    }

    /// Trampoline at another page below 1 MiB
    pub const fn at(entry: PhysAddr) -> Self {
        Self { entry }
    }

    /// Physical address of the first instruction
    pub fn entry(&self) -> PhysAddr {
        self.entry
    }

    /// Copy the trampoline code into place
    pub fn install<M: PhysMemory>(&self, memory: &M, image: &[u8]) -> BootResult<()> {
        if image.is_empty() {
            return Err(BootError::Misconfigured("trampoline image is empty"));
        }
        if image.len() > PGSIZE as usize {
            return Err(BootError::Misconfigured("trampoline image exceeds one page"));
        }
        memory.copy_to(self.entry, image);
        log::debug!("trampoline: {} bytes at {}", image.len(), self.entry);
        Ok(())
    }

    /// Fill the slots for the next processor
    pub fn patch<M: PhysMemory>(&self, memory: &M, params: &TrampolineParams) {
        memory.write_u32(self.slot(STACK_SLOT), params.stack_top.as_u32());
        memory.write_u32(self.slot(ENTRY_SLOT), params.entry.as_u32());
        memory.write_u32(self.slot(PGDIR_SLOT), params.pgdir.as_u32());
    }

    /// Current slot contents
    pub fn read_params<M: PhysMemory>(&self, memory: &M) -> TrampolineParams {
        TrampolineParams {
            pgdir: PhysAddr::new(memory.read_u32(self.slot(PGDIR_SLOT))),
            entry: VirtAddr::new(memory.read_u32(self.slot(ENTRY_SLOT))),
            stack_top: VirtAddr::new(memory.read_u32(self.slot(STACK_SLOT))),
        }
    }

    fn slot(&self, below: u32) -> PhysAddr {
        self.entry.sub(below)
    }
}

impl Default for Trampoline {
    fn default() -> Self {
        Self::new()
    }
}
