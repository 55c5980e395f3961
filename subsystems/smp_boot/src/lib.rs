//! # Helix OS SMP Boot
//!
//! Multiprocessor bring-up and staged physical memory bootstrap for 32-bit x86.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                      HELIX OS SMP BOOT SEQUENCE                             │
//! │                      ══════════════════════════                             │
//! │                                                                             │
//! │   BOOT PROCESSOR                                 NON-BOOT PROCESSORS        │
//! │                                                                             │
//! │   ┌──────────────────┐                                                      │
//! │   │ Allocator Phase 1│  [kernel end, 4 MiB)                                 │
//! │   └────────┬─────────┘                                                      │
//! │            ▼                                                                │
//! │   ┌──────────────────┐                                                      │
//! │   │ Kernel VM        │                                                      │
//! │   └────────┬─────────┘                                                      │
//! │            ▼                                                                │
//! │   ┌──────────────────┐                                                      │
//! │   │ Discovery        │  registry, LAPIC, GDT, PIC, IOAPIC                   │
//! │   └────────┬─────────┘                                                      │
//! │            ▼                                                                │
//! │   ┌──────────────────┐                                                      │
//! │   │ Collaborators    │  console, uart, proc, traps, bio, files, disk        │
//! │   └────────┬─────────┘                                                      │
//! │            ▼                                                                │
//! │   ┌──────────────────┐   slots + SIPI    ┌───────────────────┐              │
//! │   │ Bring-up         │──────────────────▶│ trampoline @0x7000│              │
//! │   │  (one at a time) │                   └─────────┬─────────┘              │
//! │   │                  │                             ▼                        │
//! │   │                  │                   ┌───────────────────┐              │
//! │   │                  │◀── started ───────│ mpenter → mpmain  │──▶ scheduler │
//! │   └────────┬─────────┘                   └───────────────────┘              │
//! │            ▼                                                                │
//! │   ┌──────────────────┐                                                      │
//! │   │ Allocator Phase 2│  [4 MiB, PHYSTOP)                                    │
//! │   └────────┬─────────┘                                                      │
//! │            ▼                                                                │
//! │   ┌──────────────────┐                                                      │
//! │   │ First Process    │                                                      │
//! │   └────────┬─────────┘                                                      │
//! │            ▼                                                                │
//! │          mpmain ─────────────────────────────────────────────▶ scheduler    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Why two allocator phases
//!
//! A processor woken by the trampoline runs on [`entrypgdir::ENTRY_PGDIR`], which maps
//! only the low 4 MiB. Every kernel stack handed out during bring-up must therefore come
//! from that window. Memory above 4 MiB is released to the allocator only once
//! [`smp::start_others`] has returned, and [`kalloc::PageAllocator::initialize_phase2`]
//! demands the [`smp::BringupComplete`] token as proof.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use helix_smp_boot::{BootConfig, BootSequence, Kernel};
//!
//! static KERNEL: Kernel<Pc> = Kernel::new(BootConfig::new(), Pc::new());
//! static CONSOLE: spin::Mutex<Cga> = spin::Mutex::new(Cga::new());
//!
//! #[unsafe(no_mangle)]
//! pub extern "C" fn main() -> ! {
//!     if let Err(error) = helix_smp_boot::logger::init(&CONSOLE, KERNEL.config().log_level) {
//!         KERNEL.fatal(&error);
//!     }
//!     BootSequence::new(&KERNEL).run()
//! }
//!
//! // Address handed to the trampoline through `Subsystems::ap_entry`
//! extern "C" fn mpenter() -> ! {
//!     KERNEL.mpenter()
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)]

use bitflags::bitflags;
use log::LevelFilter;

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Physical and virtual memory layout
pub mod memlayout;

/// Error handling
pub mod error;

/// Collaborator traits the boot core drives
pub mod platform;

/// Two-phase physical page allocator
pub mod kalloc;

/// Entry page directory used before the kernel page table
pub mod entrypgdir;

/// Startup trampoline and its parameter slots
pub mod trampoline;

/// Processor registry
pub mod cpu;

/// Non-boot processor bring-up
pub mod smp;

/// Per-processor setup shared by every processor
pub mod percpu;

/// Boot stages, state tracking and hooks
pub mod stage;

/// Boot orchestrator
pub mod boot;

/// `log` backend for the boot console
pub mod logger;

/// Architecture-specific glue
pub mod arch;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use crate::boot::{BootSequence, Handoff, Kernel};
pub use crate::cpu::{ApicId, Cpu, CpuTable, KernelStack, ThisCpu};
pub use crate::entrypgdir::{ENTRY_PGDIR, PageDirectory, Pde, PdeFlags};
pub use crate::error::{BootError, BootResult, ErrorCategory};
pub use crate::kalloc::{AllocatorPhase, PageAllocator};
pub use crate::memlayout::{PhysAddr, VirtAddr};
pub use crate::platform::{
    InterruptController, Machine, PhysMemory, Platform, Scheduler, Subsystems,
};
pub use crate::smp::{ApState, BringupComplete};
pub use crate::stage::{BootHooks, BootStage, BootState, NoopHooks};
pub use crate::trampoline::{Trampoline, TrampolineParams};

// =============================================================================
// BOOT CONFIGURATION
// =============================================================================

/// How the boot processor waits for a woken processor to report in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinPolicy {
    /// Spin until the readiness flag is set, however long that takes
    Forever,
    /// Give up after `max_spins` polls and fail the boot with
    /// [`BootError::ProcessorTimeout`]
    Bounded {
        /// Number of polls before giving up
        max_spins: u64,
    },
}

/// Boot configuration options
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// Maximum number of processors the registry accepts
    pub max_cpus: usize,

    /// Top of usable physical memory (exclusive)
    pub phystop: u32,

    /// Bring-up wait policy
    pub spin_policy: SpinPolicy,

    /// Level passed to the boot logger
    pub log_level: LevelFilter,
}

impl BootConfig {
    /// Create a new default configuration
    pub const fn new() -> Self {
        Self {
            max_cpus: memlayout::NCPU,
            phystop: memlayout::PHYSTOP,
            spin_policy: SpinPolicy::Forever,
            log_level: LevelFilter::Info,
        }
    }

    /// Create configuration for QEMU testing
    pub const fn qemu() -> Self {
        Self {
            max_cpus: memlayout::NCPU,
            phystop: memlayout::PHYSTOP,
            spin_policy: SpinPolicy::Bounded {
                max_spins: 100_000_000,
            },
            log_level: LevelFilter::Debug,
        }
    }

    /// Create configuration for a uniprocessor boot
    pub const fn single_cpu() -> Self {
        Self {
            max_cpus: 1,
            phystop: memlayout::PHYSTOP,
            spin_policy: SpinPolicy::Forever,
            log_level: LevelFilter::Info,
        }
    }

    /// Use a different top of physical memory
    pub const fn with_phystop(mut self, phystop: u32) -> Self {
        self.phystop = phystop;
        self
    }

    /// Use a different bring-up wait policy
    pub const fn with_spin_policy(mut self, policy: SpinPolicy) -> Self {
        self.spin_policy = policy;
        self
    }

    /// Check the configuration for values the boot path cannot honour
    pub fn validate(&self) -> BootResult<()> {
        if self.max_cpus == 0 || self.max_cpus > memlayout::NCPU {
            return Err(BootError::Misconfigured("max_cpus must be within 1..=NCPU"));
        }
        if self.phystop % memlayout::PGSIZE != 0 {
            return Err(BootError::Misconfigured("phystop is not page aligned"));
        }
        if self.phystop <= memlayout::ENTRY_MAP_SIZE {
            return Err(BootError::Misconfigured("phystop must lie above the entry-mapped window"));
        }
        if self.phystop > memlayout::KERNBASE {
            return Err(BootError::Misconfigured("phystop overlaps the kernel virtual base"));
        }
        if let SpinPolicy::Bounded { max_spins: 0 } = self.spin_policy {
            return Err(BootError::Misconfigured("bounded spin policy needs at least one spin"));
        }
        Ok(())
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// BOOT FLAGS
// =============================================================================

bitflags! {
    /// Completed boot stages
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BootStatus: u32 {
        /// Allocator holds the entry-mapped window
        const ALLOCATOR_PHASE1 = 1 << 0;
        /// Kernel page table built
        const KERNEL_VM = 1 << 1;
        /// Processors discovered, interrupt controllers up
        const DISCOVERY = 1 << 2;
        /// External subsystems initialized
        const COLLABORATORS = 1 << 3;
        /// Every non-boot processor reported in
        const BRINGUP = 1 << 4;
        /// Allocator holds all of physical memory
        const ALLOCATOR_PHASE2 = 1 << 5;
        /// First process created
        const FIRST_PROCESS = 1 << 6;
        /// Boot processor entered the scheduler
        const SCHEDULER = 1 << 7;
        /// Error occurred
        const ERROR = 1 << 31;
    }
}

// =============================================================================
// VERSION INFORMATION
// =============================================================================

/// SMP boot subsystem version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(BootConfig::default().validate().is_ok());
        assert!(BootConfig::qemu().validate().is_ok());
        assert!(BootConfig::single_cpu().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let mut config = BootConfig::new();
        config.max_cpus = 0;
        assert!(matches!(config.validate(), Err(BootError::Misconfigured(_))));

        let config = BootConfig::new().with_phystop(memlayout::ENTRY_MAP_SIZE);
        assert!(config.validate().is_err());

        let config = BootConfig::new().with_phystop(0x0080_0001);
        assert!(config.validate().is_err());

        let config = BootConfig::new().with_spin_policy(SpinPolicy::Bounded { max_spins: 0 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_status_flags_are_distinct() {
        let all = [
            BootStatus::ALLOCATOR_PHASE1,
            BootStatus::KERNEL_VM,
            BootStatus::DISCOVERY,
            BootStatus::COLLABORATORS,
            BootStatus::BRINGUP,
            BootStatus::ALLOCATOR_PHASE2,
            BootStatus::FIRST_PROCESS,
            BootStatus::SCHEDULER,
        ];
        let combined = all.iter().fold(BootStatus::empty(), |acc, f| acc | *f);
        assert_eq!(combined.bits().count_ones(), all.len() as u32);
        assert!(!combined.contains(BootStatus::ERROR));
    }
}
