//! # Per-Processor Setup
//!
//! Every processor, boot or not, passes through here exactly once on its way into the
//! scheduler.
//!
//! ```text
//!   non-boot:  trampoline ──▶ mpenter ──┐
//!                 switch_kernel_vm      │
//!                 load_segments         ├──▶ mpmain ──▶ load_idt
//!                 init_local            │               mark started
//!                                       │               enter_scheduler (never returns)
//!   boot:      boot_entry (discovery) ──┘
//!                 init_local
//!                 load_segments
//! ```

use crate::boot::Kernel;
use crate::platform::{InterruptController, Machine, Platform, Scheduler};

impl<P: Platform> Kernel<P> {
    /// Entry point of a woken processor
    ///
    /// Called by the routine at [`Subsystems::ap_entry`](crate::Subsystems::ap_entry) on
    /// the stack bring-up allocated, while the entry page directory is still loaded.
    pub fn mpenter(&self) -> ! {
        let platform = self.platform();
        platform.machine().switch_kernel_vm();
        platform.machine().load_segments();
        platform.interrupts().init_local();
        self.mpmain()
    }

    /// Boot processor's half of the local setup; the kernel page table is already live
    pub(crate) fn boot_entry(&self) {
        let platform = self.platform();
        platform.interrupts().init_local();
        platform.machine().load_segments();
    }

    /// Shared tail: load the IDT, report in, schedule
    pub(crate) fn mpmain(&self) -> ! {
        let platform = self.platform();
        let this = match self.cpus().this_cpu(platform.machine().current_apic_id()) {
            Ok(this) => this,
            Err(error) => self.fatal(&error),
        };

        log::info!("cpu{}: starting {}", this.index(), this.index());
        platform.machine().load_idt();
        this.mark_started();
        platform.scheduler().enter_scheduler()
    }
}
