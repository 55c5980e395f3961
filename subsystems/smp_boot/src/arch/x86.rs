//! # 32-bit x86
//!
//! The trampoline is assembled into the kernel image, copied to [`TRAMPOLINE_PA`] by
//! bring-up and entered there in real mode. Every address it uses is computed relative
//! to that home, so it runs correctly wherever the linker placed the assembled copy.

use core::arch::{asm, global_asm};

use crate::entrypgdir::ENTRY_PGDIR;
use crate::memlayout::{PhysAddr, TRAMPOLINE_PA, VirtAddr};
use crate::platform::PhysMemory;
use crate::trampoline::{ENTRY_SLOT, PGDIR_SLOT, STACK_SLOT};

// =============================================================================
// TRAMPOLINE
// =============================================================================

global_asm!(
    ".pushsection .text.entryother, \"ax\"",
    ".code16",
    ".global entryother_start",
    "entryother_start:",
    "cli",
    "xorw %ax, %ax",
    "movw %ax, %ds",
    "movw %ax, %es",
    "movw %ax, %ss",
    // Protected mode with a flat GDT
    "lgdtl (entryother_gdtdesc - entryother_start + {tramp})",
    "movl %cr0, %eax",
    "orl $0x1, %eax",
    "movl %eax, %cr0",
    "ljmpl $0x8, $(entryother_start32 - entryother_start + {tramp})",
    ".code32",
    "entryother_start32:",
    "movw $0x10, %ax",
    "movw %ax, %ds",
    "movw %ax, %es",
    "movw %ax, %ss",
    "xorw %ax, %ax",
    "movw %ax, %fs",
    "movw %ax, %gs",
    // 4 MiB pages, entry page directory, paging and write protect on
    "movl %cr4, %eax",
    "orl $0x10, %eax",
    "movl %eax, %cr4",
    "movl ({tramp} - {pgdir}), %eax",
    "movl %eax, %cr3",
    "movl %cr0, %eax",
    "orl $0x80010000, %eax",
    "movl %eax, %cr0",
    "movl ({tramp} - {stack}), %esp",
    "call *({tramp} - {entry})",
    "entryother_spin:",
    "hlt",
    "jmp entryother_spin",
    ".p2align 2",
    "entryother_gdt:",
    ".quad 0",
    ".word 0xffff, 0x0000",
    ".byte 0x00, 0x9a, 0xcf, 0x00",
    ".word 0xffff, 0x0000",
    ".byte 0x00, 0x92, 0xcf, 0x00",
    "entryother_gdtdesc:",
    ".word entryother_gdtdesc - entryother_gdt - 1",
    ".long entryother_gdt - entryother_start + {tramp}",
    ".global entryother_end",
    "entryother_end:",
    ".popsection",
    tramp = const TRAMPOLINE_PA,
    pgdir = const PGDIR_SLOT,
    entry = const ENTRY_SLOT,
    stack = const STACK_SLOT,
    options(att_syntax)
);

unsafe extern "C" {
    static entryother_start: u8;
    static entryother_end: u8;
}

/// Machine code of the trampoline, ready for [`Trampoline::install`](crate::Trampoline::install)
pub fn entryother_image() -> &'static [u8] {
    // SAFETY: both symbols bound the trampoline inside the kernel's text section
    unsafe {
        let start = &raw const entryother_start;
        let end = &raw const entryother_end;
        core::slice::from_raw_parts(start, end as usize - start as usize)
    }
}

/// Physical address of [`ENTRY_PGDIR`] for the trampoline's page-directory slot
pub fn entry_pgdir_phys() -> PhysAddr {
    VirtAddr::from_ptr(&ENTRY_PGDIR).to_phys()
}

// =============================================================================
// PHYSICAL MEMORY
// =============================================================================

/// Physical memory reached through the kernel direct map
#[derive(Debug)]
pub struct DirectMap {
    _private: (),
}

impl DirectMap {
    /// Access physical memory through the direct map
    ///
    /// # Safety
    ///
    /// Every physical address passed to the returned value must be mapped at
    /// `pa + KERNBASE` in the active page table.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl PhysMemory for DirectMap {
    fn read_u32(&self, pa: PhysAddr) -> u32 {
        // SAFETY: mapped per `DirectMap::new`
        unsafe { pa.to_virt().as_ptr::<u32>().read_volatile() }
    }

    fn write_u32(&self, pa: PhysAddr, value: u32) {
        // SAFETY: mapped per `DirectMap::new`
        unsafe { pa.to_virt().as_mut_ptr::<u32>().write_volatile(value) }
    }

    fn copy_to(&self, pa: PhysAddr, bytes: &[u8]) {
        let dst = pa.to_virt().as_mut_ptr::<u8>();
        for (i, byte) in bytes.iter().enumerate() {
            // SAFETY: mapped per `DirectMap::new`
            unsafe { dst.add(i).write_volatile(*byte) }
        }
    }
}

// =============================================================================
// HALT
// =============================================================================

/// Stop the executing processor with interrupts off
pub fn halt_forever() -> ! {
    loop {
        // SAFETY: touches no memory
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) }
    }
}
