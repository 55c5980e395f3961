//! # Non-Boot Processor Bring-up
//!
//! Processors are started strictly one after another because they share the single
//! set of trampoline slots.
//!
//! ```text
//!   for each registered processor except the boot processor:
//!
//!   NotStarted ──▶ ParametersWritten ──▶ Signaled ──▶ Running
//!       │                 │                  │            │
//!   allocate stack    patch slots        INIT/SIPI    readiness flag
//!   (phase-1 pool)    fence              spin ...     observed
//! ```
//!
//! ## Limitation
//!
//! Under [`SpinPolicy::Forever`] a processor that never reports in stalls bring-up
//! forever. [`SpinPolicy::Bounded`] trades that hang for a fatal
//! [`BootError::ProcessorTimeout`].

use core::hint::spin_loop;
use core::sync::atomic::{Ordering, fence};

use crate::SpinPolicy;
use crate::boot::Kernel;
use crate::cpu::{ApicId, Cpu, KernelStack};
use crate::error::{BootError, BootResult};
use crate::kalloc::PageAllocator;
use crate::platform::{InterruptController, Machine, Platform, Subsystems};
use crate::trampoline::TrampolineParams;

/// Bring-up progress of one non-boot processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApState {
    /// Nothing done yet
    NotStarted,
    /// Stack allocated and trampoline slots filled
    ParametersWritten,
    /// Start signal sent
    Signaled,
    /// Readiness flag observed
    Running,
}

impl ApState {
    /// Following state
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::ParametersWritten),
            Self::ParametersWritten => Some(Self::Signaled),
            Self::Signaled => Some(Self::Running),
            Self::Running => None,
        }
    }
}

/// Proof that every non-boot processor has been brought up
///
/// Only [`start_others`] creates one. The allocator refuses to extend past the
/// entry-mapped window without it.
#[derive(Debug)]
pub struct BringupComplete {
    started: usize,
}

impl BringupComplete {
    /// Number of processors brought up
    pub fn started(&self) -> usize {
        self.started
    }

    #[cfg(test)]
    pub(crate) const fn assume(started: usize) -> Self {
        Self { started }
    }
}

/// Start every registered processor other than the executing one
///
/// Copies the trampoline into low memory, then for each processor in registry order
/// allocates a kernel stack, fills the trampoline slots, signals the processor and spins
/// until it sets its readiness flag.
pub fn start_others<P: Platform>(
    kernel: &Kernel<P>,
    allocator: &mut PageAllocator<P::Memory>,
) -> BootResult<BringupComplete> {
    let platform = kernel.platform();
    let memory = platform.memory();
    let trampoline = kernel.trampoline();
    let boot = platform.machine().current_apic_id();

    trampoline.install(&memory, platform.subsystems().trampoline_image())?;

    if let SpinPolicy::Bounded { max_spins } = kernel.config().spin_policy {
        log::warn!("smp: bring-up wait bounded to {} spins", max_spins);
    }

    let mut started = 0;
    for (index, cpu) in kernel.cpus().iter().enumerate() {
        if cpu.apic_id() == boot {
            continue;
        }

        // The slots are free only once every earlier processor has reported in.
        debug_assert!(
            kernel
                .cpus()
                .iter()
                .take(index)
                .all(|c| c.apic_id() == boot || c.is_started()),
            "trampoline slots still in use"
        );

        let state = bring_up(kernel, allocator, cpu)?;
        debug_assert_eq!(state, ApState::Running);
        started += 1;
    }

    log::info!("smp: {} processor(s) started", started);
    Ok(BringupComplete { started })
}

/// Take one processor from `NotStarted` to `Running`
fn bring_up<P: Platform>(
    kernel: &Kernel<P>,
    allocator: &mut PageAllocator<P::Memory>,
    cpu: &Cpu,
) -> BootResult<ApState> {
    let platform = kernel.platform();
    let memory = platform.memory();
    let trampoline = kernel.trampoline();
    let id = cpu.apic_id();
    let mut state = ApState::NotStarted;

    let stack = cpu.assign_stack(KernelStack::new(allocator.allocate_page()?))?;
    let params = TrampolineParams {
        pgdir: platform.subsystems().entry_pgdir(),
        entry: platform.subsystems().ap_entry(),
        stack_top: stack.top(),
    };
    trampoline.patch(&memory, &params);
    state = advance(id, state);

    log::debug!(
        "smp: apic {} stack {} entry {} pgdir {}",
        id,
        params.stack_top,
        params.entry,
        params.pgdir
    );

    fence(Ordering::SeqCst);
    platform.interrupts().start_processor(id, trampoline.entry());
    state = advance(id, state);

    wait_started(cpu, kernel.config().spin_policy)?;
    Ok(advance(id, state))
}

fn advance(id: ApicId, state: ApState) -> ApState {
    match state.next() {
        Some(next) => {
            log::trace!("smp: apic {} {:?} -> {:?}", id, state, next);
            next
        },
        None => state,
    }
}

fn wait_started(cpu: &Cpu, policy: SpinPolicy) -> BootResult<()> {
    match policy {
        SpinPolicy::Forever => {
            while !cpu.is_started() {
                spin_loop();
            }
            Ok(())
        },
        SpinPolicy::Bounded { max_spins } => {
            for _ in 0..max_spins {
                if cpu.is_started() {
                    return Ok(());
                }
                spin_loop();
            }
            if cpu.is_started() {
                Ok(())
            } else {
                Err(BootError::ProcessorTimeout(cpu.apic_id()))
            }
        },
    }
}
