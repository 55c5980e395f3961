//! # Boot Stages
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────────┐
//! │                         BOOT STAGE STATE MACHINE                           │
//! │                                                                            │
//! │   ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────────┐            │
//! │   │ Alloc P1 │──▶│ KernelVm │──▶│Discovery │──▶│Collaborators │            │
//! │   └──────────┘   └──────────┘   └──────────┘   └──────┬───────┘            │
//! │                                                       │                    │
//! │   ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────▼───────┐            │
//! │   │Scheduler │◀──│ First    │◀──│ Alloc P2 │◀──│   Bring-up   │            │
//! │   │          │   │ Process  │   │          │   │              │            │
//! │   └──────────┘   └──────────┘   └──────────┘   └──────────────┘            │
//! │                                                                            │
//! │   Any stage ──▶ Error ──▶ halt                                             │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::BootStatus;
use crate::error::{BootError, BootResult};

// =============================================================================
// BOOT STAGES
// =============================================================================

/// Boot stage enumeration
///
/// Stages run strictly in declaration order; none may start before all of its
/// predecessors have completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BootStage {
    /// Free the entry-mapped window to the allocator
    AllocatorPhase1 = 0,
    /// Build the kernel page table
    KernelVm        = 1,
    /// Register processors, set up LAPIC, GDT, PIC and IOAPIC
    Discovery       = 2,
    /// Console, serial, process table, traps, buffer cache, files, disk
    Collaborators   = 3,
    /// Start every non-boot processor
    Bringup         = 4,
    /// Free the rest of physical memory to the allocator
    AllocatorPhase2 = 5,
    /// Create the first user process
    FirstProcess    = 6,
    /// Boot processor enters the scheduler
    Scheduler       = 7,
    /// Error state
    Error           = 255,
}

impl BootStage {
    /// All regular stages in order
    pub const ALL: [BootStage; 8] = [
        Self::AllocatorPhase1,
        Self::KernelVm,
        Self::Discovery,
        Self::Collaborators,
        Self::Bringup,
        Self::AllocatorPhase2,
        Self::FirstProcess,
        Self::Scheduler,
    ];

    /// Get the next stage in the sequence
    pub fn next(self) -> Option<Self> {
        match self {
            Self::AllocatorPhase1 => Some(Self::KernelVm),
            Self::KernelVm => Some(Self::Discovery),
            Self::Discovery => Some(Self::Collaborators),
            Self::Collaborators => Some(Self::Bringup),
            Self::Bringup => Some(Self::AllocatorPhase2),
            Self::AllocatorPhase2 => Some(Self::FirstProcess),
            Self::FirstProcess => Some(Self::Scheduler),
            Self::Scheduler => None,
            Self::Error => None,
        }
    }

    /// Get stage name
    pub const fn name(self) -> &'static str {
        match self {
            Self::AllocatorPhase1 => "Allocator Phase 1",
            Self::KernelVm => "Kernel VM",
            Self::Discovery => "Discovery",
            Self::Collaborators => "Collaborators",
            Self::Bringup => "Bring-up",
            Self::AllocatorPhase2 => "Allocator Phase 2",
            Self::FirstProcess => "First Process",
            Self::Scheduler => "Scheduler",
            Self::Error => "Error",
        }
    }

    /// Get stage description
    pub const fn description(self) -> &'static str {
        match self {
            Self::AllocatorPhase1 => "pages below the entry-mapped limit",
            Self::KernelVm => "kernel page table",
            Self::Discovery => "processors and interrupt controllers",
            Self::Collaborators => "kernel subsystems",
            Self::Bringup => "non-boot processors",
            Self::AllocatorPhase2 => "pages up to the top of memory",
            Self::FirstProcess => "first user process",
            Self::Scheduler => "boot processor scheduling",
            Self::Error => "boot sequence error",
        }
    }

    /// Get corresponding status flag
    pub const fn status_flag(self) -> BootStatus {
        match self {
            Self::AllocatorPhase1 => BootStatus::ALLOCATOR_PHASE1,
            Self::KernelVm => BootStatus::KERNEL_VM,
            Self::Discovery => BootStatus::DISCOVERY,
            Self::Collaborators => BootStatus::COLLABORATORS,
            Self::Bringup => BootStatus::BRINGUP,
            Self::AllocatorPhase2 => BootStatus::ALLOCATOR_PHASE2,
            Self::FirstProcess => BootStatus::FIRST_PROCESS,
            Self::Scheduler => BootStatus::SCHEDULER,
            Self::Error => BootStatus::ERROR,
        }
    }
}

// =============================================================================
// BOOT STATE
// =============================================================================

/// Boot progress tracking
#[derive(Debug, Clone)]
pub struct BootState {
    current_stage: Option<BootStage>,
    status: BootStatus,
    cpu_count: usize,
    started_cpus: usize,
    error: Option<(BootStage, BootError)>,
}

impl BootState {
    /// Create a new boot state
    pub const fn new() -> Self {
        Self {
            current_stage: None,
            status: BootStatus::empty(),
            cpu_count: 0,
            started_cpus: 0,
            error: None,
        }
    }

    /// Stage running or last run
    pub fn current_stage(&self) -> Option<BootStage> {
        self.current_stage
    }

    /// Completed stages
    pub fn status(&self) -> BootStatus {
        self.status
    }

    /// Check if stage is complete
    pub fn stage_complete(&self, stage: BootStage) -> bool {
        self.status.contains(stage.status_flag())
    }

    /// Enter `stage` if every earlier stage has completed
    pub fn begin(&mut self, stage: BootStage) -> BootResult<()> {
        if let Some((failed, _)) = self.error {
            return Err(BootError::StageOrder {
                expected: failed,
                found: stage,
            });
        }
        let missing = BootStage::ALL
            .iter()
            .take_while(|s| **s < stage)
            .find(|s| !self.stage_complete(**s));
        if let Some(expected) = missing {
            return Err(BootError::StageOrder {
                expected: *expected,
                found: stage,
            });
        }
        if self.stage_complete(stage) {
            return Err(BootError::StageOrder {
                expected: stage.next().unwrap_or(stage),
                found: stage,
            });
        }
        self.current_stage = Some(stage);
        Ok(())
    }

    /// Mark stage as complete
    pub fn complete(&mut self, stage: BootStage) {
        self.status.insert(stage.status_flag());
    }

    /// Record a failure
    pub fn set_error(&mut self, stage: BootStage, error: BootError) {
        self.current_stage = Some(BootStage::Error);
        self.status.insert(BootStatus::ERROR);
        self.error = Some((stage, error));
    }

    /// Failure, if any
    pub fn error(&self) -> Option<(BootStage, BootError)> {
        self.error
    }

    /// Set CPU count
    pub fn set_cpu_count(&mut self, count: usize) {
        self.cpu_count = count;
    }

    /// Get CPU count
    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    /// Set number of processors brought up
    pub fn set_started_cpus(&mut self, count: usize) {
        self.started_cpus = count;
    }

    /// Number of processors brought up
    pub fn started_cpus(&self) -> usize {
        self.started_cpus
    }
}

impl Default for BootState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// BOOT HOOKS
// =============================================================================

/// Callbacks around each boot stage
pub trait BootHooks {
    /// Called before a stage begins
    fn pre_stage(&mut self, _stage: BootStage, _state: &BootState) -> BootResult<()> {
        Ok(())
    }

    /// Called after a stage completes successfully
    fn post_stage(&mut self, _stage: BootStage, _state: &BootState) -> BootResult<()> {
        Ok(())
    }

    /// Called when a stage fails, before the boot halts
    fn on_error(&mut self, _stage: BootStage, _error: &BootError) {}
}

/// No-op boot hooks implementation
#[derive(Debug, Default)]
pub struct NoopHooks;

impl BootHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_chain_matches_all() {
        let mut stage = BootStage::ALL[0];
        for expected in BootStage::ALL.iter().skip(1) {
            stage = stage.next().unwrap();
            assert_eq!(stage, *expected);
        }
        assert_eq!(stage.next(), None);
    }

    #[test]
    fn test_stages_run_in_order() {
        let mut state = BootState::new();
        state.begin(BootStage::AllocatorPhase1).unwrap();
        state.complete(BootStage::AllocatorPhase1);

        assert_eq!(
            state.begin(BootStage::AllocatorPhase2),
            Err(BootError::StageOrder {
                expected: BootStage::KernelVm,
                found: BootStage::AllocatorPhase2,
            })
        );
        state.begin(BootStage::KernelVm).unwrap();
        assert_eq!(state.current_stage(), Some(BootStage::KernelVm));
    }

    #[test]
    fn test_stage_cannot_repeat() {
        let mut state = BootState::new();
        state.begin(BootStage::AllocatorPhase1).unwrap();
        state.complete(BootStage::AllocatorPhase1);
        assert!(state.begin(BootStage::AllocatorPhase1).is_err());
    }

    #[test]
    fn test_error_blocks_further_stages() {
        let mut state = BootState::new();
        state.set_error(BootStage::AllocatorPhase1, BootError::OutOfMemory);
        assert!(state.status().contains(BootStatus::ERROR));
        assert_eq!(state.current_stage(), Some(BootStage::Error));
        assert!(state.begin(BootStage::AllocatorPhase1).is_err());
        assert_eq!(
            state.error(),
            Some((BootStage::AllocatorPhase1, BootError::OutOfMemory))
        );
    }
}
