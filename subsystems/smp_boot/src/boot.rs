//! # Boot Orchestrator
//!
//! The ordered sequence the boot processor runs exactly once.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                       BOOT SEQUENCE EXECUTION                               │
//! │                                                                             │
//! │   for each stage in [AllocatorPhase1, KernelVm, ..., FirstProcess]:         │
//! │       │                                                                     │
//! │       ├──▶ Check predecessors complete                                      │
//! │       ├──▶ Call pre_stage() hook                                            │
//! │       ├──▶ Execute stage                                                    │
//! │       │       ├── Ok  ──▶ post_stage() hook, mark complete                  │
//! │       │       └── Err ──▶ on_error() hook ──▶ log ──▶ halt                  │
//! │       └──▶ Next stage                                                       │
//! │                                                                             │
//! │   allocator ──▶ scheduler                                                   │
//! │   mpmain (never returns)                                                    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::BootConfig;
use crate::cpu::CpuTable;
use crate::error::{BootError, BootResult};
use crate::kalloc::PageAllocator;
use crate::memlayout::{ENTRY_MAP_SIZE, PhysAddr};
use crate::platform::{InterruptController, Machine, Platform, Scheduler, Subsystems};
use crate::smp::{self, BringupComplete};
use crate::stage::{BootHooks, BootStage, BootState, NoopHooks};
use crate::trampoline::Trampoline;

// =============================================================================
// KERNEL
// =============================================================================

/// State shared by every processor during boot
///
/// Lives in a `static` so woken processors can reach it from the trampoline's entry
/// routine.
#[derive(Debug)]
pub struct Kernel<P: Platform> {
    config: BootConfig,
    platform: P,
    cpus: CpuTable,
    trampoline: Trampoline,
}

impl<P: Platform> Kernel<P> {
    /// Create the shared boot state
    pub const fn new(config: BootConfig, platform: P) -> Self {
        Self {
            cpus: CpuTable::new(config.max_cpus),
            config,
            platform,
            trampoline: Trampoline::new(),
        }
    }

    /// Boot configuration
    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    /// Platform
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Processor registry
    pub fn cpus(&self) -> &CpuTable {
        &self.cpus
    }

    /// Startup trampoline
    pub fn trampoline(&self) -> &Trampoline {
        &self.trampoline
    }

    /// Report `error` and stop the executing processor
    pub fn fatal(&self, error: &BootError) -> ! {
        log::error!("boot: fatal: {}", error);
        self.platform.machine().halt()
    }
}

// =============================================================================
// BOOT SEQUENCE
// =============================================================================

/// Boot orchestrator
pub struct BootSequence<'k, P: Platform, H: BootHooks = NoopHooks> {
    kernel: &'k Kernel<P>,
    hooks: H,
    state: BootState,
    allocator: PageAllocator<P::Memory>,
}

impl<'k, P: Platform> BootSequence<'k, P> {
    /// Create a boot sequence for `kernel`
    pub fn new(kernel: &'k Kernel<P>) -> Self {
        Self {
            kernel,
            hooks: NoopHooks,
            state: BootState::new(),
            allocator: PageAllocator::new(kernel.platform.memory()),
        }
    }
}

impl<'k, P: Platform, H: BootHooks> BootSequence<'k, P, H> {
    /// Set custom boot hooks
    pub fn with_hooks<H2: BootHooks>(self, hooks: H2) -> BootSequence<'k, P, H2> {
        BootSequence {
            kernel: self.kernel,
            hooks,
            state: self.state,
            allocator: self.allocator,
        }
    }

    /// Boot progress so far
    pub fn state(&self) -> &BootState {
        &self.state
    }

    /// Run the whole boot and enter the scheduler; any failure halts
    pub fn run(self) -> ! {
        let kernel = self.kernel;
        match self.bootstrap() {
            Ok(handoff) => handoff.enter_scheduler(),
            Err(error) => kernel.fatal(&error),
        }
    }

    /// Run every stage up to and including first-process creation, then hand the
    /// allocator to the scheduler
    pub fn bootstrap(mut self) -> BootResult<Handoff<'k, P>> {
        self.kernel.config.validate()?;
        log::info!(
            "boot: helix smp boot v{}, up to {} cpus",
            crate::VERSION,
            self.kernel.cpus.limit()
        );

        self.stage(BootStage::AllocatorPhase1, |kernel, allocator| {
            let start = kernel.platform.subsystems().kernel_end();
            allocator.initialize_phase1(start, PhysAddr::new(ENTRY_MAP_SIZE))
        })?;

        self.stage(BootStage::KernelVm, |kernel, allocator| {
            kernel.platform.subsystems().setup_kernel_vm(allocator)
        })?;

        let cpu_count = self.stage(BootStage::Discovery, |kernel, _| kernel.discover())?;
        self.state.set_cpu_count(cpu_count);

        self.stage(BootStage::Collaborators, |kernel, _| {
            kernel.init_collaborators();
            Ok(())
        })?;

        let bringup = self.stage(BootStage::Bringup, |kernel, allocator| {
            smp::start_others(kernel, allocator)
        })?;
        self.state.set_started_cpus(bringup.started());

        self.stage(BootStage::AllocatorPhase2, |kernel, allocator| {
            allocator.initialize_phase2(
                PhysAddr::new(ENTRY_MAP_SIZE),
                PhysAddr::new(kernel.config.phystop),
                &bringup,
            )
        })?;

        self.stage(BootStage::FirstProcess, |kernel, allocator| {
            kernel.platform.scheduler().create_first_process(allocator)
        })?;

        let BootSequence {
            kernel,
            state,
            allocator,
            ..
        } = self;
        log::info!("boot: {} free pages handed to the scheduler", allocator.free_pages());
        kernel.platform.scheduler().adopt_allocator(allocator);

        Ok(Handoff {
            kernel,
            state,
            bringup,
        })
    }

    fn stage<T>(
        &mut self,
        stage: BootStage,
        run: impl FnOnce(&'k Kernel<P>, &mut PageAllocator<P::Memory>) -> BootResult<T>,
    ) -> BootResult<T> {
        self.state.begin(stage)?;
        log::info!("boot: {} ({})", stage.name(), stage.description());

        let result = self
            .hooks
            .pre_stage(stage, &self.state)
            .and_then(|()| run(self.kernel, &mut self.allocator));

        let result = result.and_then(|value| {
            self.state.complete(stage);
            self.hooks.post_stage(stage, &self.state).map(|()| value)
        });

        if let Err(error) = &result {
            self.hooks.on_error(stage, error);
            self.state.set_error(stage, *error);
        }
        result
    }
}

impl<P: Platform> Kernel<P> {
    /// Register processors and bring up the boot processor's interrupt hardware
    fn discover(&self) -> BootResult<usize> {
        self.platform.subsystems().discover_processors(&self.cpus)?;

        let boot = self.platform.machine().current_apic_id();
        if self.cpus.position(boot).is_none() {
            return Err(BootError::BootProcessorMissing(boot));
        }
        log::info!("boot: {} cpu(s), boot processor apic {}", self.cpus.len(), boot);

        self.boot_entry();
        self.platform.interrupts().disable_pic();
        self.platform.interrupts().init_ioapic();
        Ok(self.cpus.len())
    }

    fn init_collaborators(&self) {
        let subsystems = self.platform.subsystems();
        subsystems.init_console();
        subsystems.init_uart();
        subsystems.init_process_table();
        subsystems.init_trap_vectors();
        subsystems.init_buffer_cache();
        subsystems.init_file_table();
        subsystems.init_disk();
    }
}

impl<P: Platform, H: BootHooks> core::fmt::Debug for BootSequence<'_, P, H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BootSequence")
            .field("state", &self.state)
            .field("free_pages", &self.allocator.free_pages())
            .finish()
    }
}

// =============================================================================
// HANDOFF
// =============================================================================

/// A finished boot waiting for the boot processor to enter the scheduler
#[derive(Debug)]
pub struct Handoff<'k, P: Platform> {
    kernel: &'k Kernel<P>,
    state: BootState,
    bringup: BringupComplete,
}

impl<'k, P: Platform> Handoff<'k, P> {
    /// Boot progress
    pub fn state(&self) -> &BootState {
        &self.state
    }

    /// Number of non-boot processors brought up
    pub fn started(&self) -> usize {
        self.bringup.started()
    }

    /// Enter the shared per-processor tail on the boot processor
    pub fn enter_scheduler(mut self) -> ! {
        if let Err(error) = self.state.begin(BootStage::Scheduler) {
            self.kernel.fatal(&error);
        }
        log::info!(
            "boot: {} ({})",
            BootStage::Scheduler.name(),
            BootStage::Scheduler.description()
        );
        self.state.complete(BootStage::Scheduler);
        self.kernel.mpmain()
    }
}
