//! # Platform Boundary
//!
//! Everything the boot core drives but does not implement: physical memory access,
//! interrupt controllers, descriptor tables, the kernel subsystems initialized during
//! boot, and the scheduler that every processor finally enters.
//!
//! A board implements [`Platform`] by naming one type per concern. A single struct may
//! stand in for several of them.

use crate::cpu::{ApicId, CpuTable};
use crate::error::BootResult;
use crate::kalloc::PageAllocator;
use crate::memlayout::{PhysAddr, VirtAddr};

// =============================================================================
// PHYSICAL MEMORY
// =============================================================================

/// Word and block access to physical memory
///
/// The allocator threads its free list through the pages it manages and the trampoline
/// writes its parameter slots through this interface.
pub trait PhysMemory {
    /// Read the 32-bit word at `pa`
    fn read_u32(&self, pa: PhysAddr) -> u32;

    /// Write the 32-bit word at `pa`
    fn write_u32(&self, pa: PhysAddr, value: u32);

    /// Copy `bytes` to physical memory starting at `pa`
    fn copy_to(&self, pa: PhysAddr, bytes: &[u8]);
}

// =============================================================================
// INTERRUPT CONTROLLER
// =============================================================================

/// Local and I/O APIC plus the legacy PIC
pub trait InterruptController {
    /// Initialize the executing processor's local APIC
    fn init_local(&self);

    /// Mask the legacy 8259 PIC
    fn disable_pic(&self);

    /// Route external interrupts through the I/O APIC
    fn init_ioapic(&self);

    /// Send the INIT/STARTUP sequence to `id`, starting it at `start`
    ///
    /// Parameter writes made before this call must be visible to the target's first
    /// instruction fetch.
    fn start_processor(&self, id: ApicId, start: PhysAddr);
}

// =============================================================================
// MACHINE
// =============================================================================

/// Per-processor CPU state
pub trait Machine {
    /// Local APIC id of the executing processor
    fn current_apic_id(&self) -> ApicId;

    /// Load the kernel GDT and segment registers
    fn load_segments(&self);

    /// Switch from the entry page directory to the kernel page table
    fn switch_kernel_vm(&self);

    /// Load the interrupt descriptor table
    fn load_idt(&self);

    /// Stop the executing processor for good
    fn halt(&self) -> !;
}

// =============================================================================
// SUBSYSTEMS
// =============================================================================

/// Kernel subsystems brought up by the boot processor
pub trait Subsystems<M: PhysMemory> {
    /// First physical address past the kernel image
    fn kernel_end(&self) -> PhysAddr;

    /// Build the kernel page table and switch the boot processor onto it
    fn setup_kernel_vm(&self, allocator: &mut PageAllocator<M>) -> BootResult<()>;

    /// Register every processor in the machine
    fn discover_processors(&self, cpus: &CpuTable) -> BootResult<()>;

    /// Console
    fn init_console(&self);

    /// Serial port
    fn init_uart(&self);

    /// Process table
    fn init_process_table(&self);

    /// Trap vectors
    fn init_trap_vectors(&self);

    /// Buffer cache
    fn init_buffer_cache(&self);

    /// File table
    fn init_file_table(&self);

    /// Disk
    fn init_disk(&self);

    /// Virtual address of the routine woken processors call; it must end in
    /// [`Kernel::mpenter`](crate::Kernel::mpenter)
    fn ap_entry(&self) -> VirtAddr;

    /// Physical address of [`ENTRY_PGDIR`](crate::entrypgdir::ENTRY_PGDIR)
    fn entry_pgdir(&self) -> PhysAddr;

    /// Startup trampoline code
    fn trampoline_image(&self) -> &'static [u8];
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Process table and scheduler
pub trait Scheduler<M: PhysMemory> {
    /// Create the first user process; called once, after the allocator covers all of
    /// physical memory
    fn create_first_process(&self, allocator: &mut PageAllocator<M>) -> BootResult<()>;

    /// Take ownership of the allocator; from here on it needs a lock
    fn adopt_allocator(&self, allocator: PageAllocator<M>);

    /// Run processes forever on the executing processor
    fn enter_scheduler(&self) -> !;
}

// =============================================================================
// PLATFORM
// =============================================================================

/// Everything a boot needs from the machine and the rest of the kernel
pub trait Platform: Sync {
    /// Physical memory access
    type Memory: PhysMemory + Send;
    /// Interrupt controllers
    type Interrupts: InterruptController + Sync;
    /// Per-processor CPU state
    type Machine: Machine + Sync;
    /// Kernel subsystems
    type Subsystems: Subsystems<Self::Memory> + Sync;
    /// Scheduler
    type Scheduler: Scheduler<Self::Memory> + Sync;

    /// Handle on physical memory
    fn memory(&self) -> Self::Memory;

    /// Interrupt controllers
    fn interrupts(&self) -> &Self::Interrupts;

    /// Per-processor CPU state
    fn machine(&self) -> &Self::Machine;

    /// Kernel subsystems
    fn subsystems(&self) -> &Self::Subsystems;

    /// Scheduler
    fn scheduler(&self) -> &Self::Scheduler;
}
