//! # Boot Errors
//!
//! Every error in this crate ends the boot. The orchestrator logs the diagnostic and
//! halts the boot processor; nothing is handed back to a caller.
//!
//! ## Error Categories
//!
//! | Category            | Example                                       |
//! |---------------------|-----------------------------------------------|
//! | Misconfiguration    | allocator phase out of order, registry full   |
//! | ResourceExhaustion  | no free page for a kernel stack               |
//! | Unresponsive        | processor never set its readiness flag        |
//!
//! `Unresponsive` only occurs under [`SpinPolicy::Bounded`](crate::SpinPolicy). With the
//! default policy a silent processor stalls bring-up forever.

use core::fmt;

use crate::cpu::ApicId;
use crate::kalloc::AllocatorPhase;
use crate::memlayout::PhysAddr;
use crate::stage::BootStage;

// =============================================================================
// ERROR CATEGORY
// =============================================================================

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCategory {
    /// Boot code called out of order or the machine disagrees with the configuration
    Misconfiguration   = 0x0001,
    /// A resource the boot path cannot do without ran out
    ResourceExhaustion = 0x0002,
    /// A processor did not answer its start signal in time
    Unresponsive       = 0x0003,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// =============================================================================
// BOOT ERROR
// =============================================================================

/// Boot failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// Allocator operation attempted in the wrong phase
    AllocatorPhase {
        /// Operation that was refused
        op: &'static str,
        /// Phase the allocator was in
        phase: AllocatorPhase,
    },
    /// Invalid configuration or argument
    Misconfigured(&'static str),
    /// Discovery reported more processors than the registry holds
    TooManyProcessors {
        /// Registry capacity
        limit: usize,
    },
    /// The same local APIC id was registered twice
    DuplicateProcessor(ApicId),
    /// Discovery did not report the processor running the boot
    BootProcessorMissing(ApicId),
    /// Code ran on a processor the registry does not know
    UnknownProcessor(ApicId),
    /// Boot stage run before its predecessors completed
    StageOrder {
        /// First stage that has not completed
        expected: BootStage,
        /// Stage that was attempted
        found: BootStage,
    },
    /// Frame handed to the allocator is misaligned or outside managed memory
    BadFrame(PhysAddr),
    /// No free page left
    OutOfMemory,
    /// Processor did not set its readiness flag within the spin bound
    ProcessorTimeout(ApicId),
}

impl BootError {
    /// Classification of this error
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::OutOfMemory => ErrorCategory::ResourceExhaustion,
            Self::ProcessorTimeout(_) => ErrorCategory::Unresponsive,
            _ => ErrorCategory::Misconfiguration,
        }
    }

    /// Short human-readable message
    pub const fn message(&self) -> &'static str {
        match self {
            Self::AllocatorPhase { .. } => "allocator used out of phase",
            Self::Misconfigured(msg) => *msg,
            Self::TooManyProcessors { .. } => "too many processors",
            Self::DuplicateProcessor(_) => "duplicate processor id",
            Self::BootProcessorMissing(_) => "boot processor not discovered",
            Self::UnknownProcessor(_) => "unknown processor",
            Self::StageOrder { .. } => "boot stage out of order",
            Self::BadFrame(_) => "bad frame",
            Self::OutOfMemory => "out of memory",
            Self::ProcessorTimeout(_) => "processor did not start",
        }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category(), self.message())?;

        match self {
            Self::AllocatorPhase { op, phase } => write!(f, ": {} during {:?}", op, phase),
            Self::TooManyProcessors { limit } => write!(f, " (limit {})", limit),
            Self::DuplicateProcessor(id)
            | Self::BootProcessorMissing(id)
            | Self::UnknownProcessor(id)
            | Self::ProcessorTimeout(id) => write!(f, " (apic {})", id),
            Self::StageOrder { expected, found } => {
                write!(f, ": {} before {}", found.name(), expected.name())
            },
            Self::BadFrame(pa) => write!(f, " at {}", pa),
            Self::Misconfigured(_) | Self::OutOfMemory => Ok(()),
        }
    }
}

/// Result type for boot operations
pub type BootResult<T> = Result<T, BootError>;
