//! # Processor Registry
//!
//! A fixed table of processor descriptors filled once by discovery on the boot
//! processor and read by everyone afterwards.
//!
//! The readiness flag of a descriptor has a single writer: the processor it describes.
//! That is enforced by API shape. The only path to [`Cpu`]'s setter is
//! [`ThisCpu::mark_started`], and a [`ThisCpu`] can only be obtained by asking the
//! registry about the processor executing the call.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Once;
use static_assertions::assert_impl_all;

use crate::error::{BootError, BootResult};
use crate::memlayout::{KSTACKSIZE, NCPU, PhysAddr, VirtAddr};

// =============================================================================
// APIC ID
// =============================================================================

/// Local APIC id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ApicId(u8);

impl ApicId {
    /// Create an id
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Raw value
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ApicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// KERNEL STACK
// =============================================================================

/// One page of kernel stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStack {
    base: PhysAddr,
}

impl KernelStack {
    /// Stack occupying the page at `base`
    pub const fn new(base: PhysAddr) -> Self {
        Self { base }
    }

    /// Lowest physical address
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    /// Initial stack pointer: one past the highest byte, in the direct map
    pub const fn top(&self) -> VirtAddr {
        self.base.add(KSTACKSIZE).to_virt()
    }
}

// =============================================================================
// PROCESSOR DESCRIPTOR
// =============================================================================

/// Processor descriptor
#[derive(Debug)]
pub struct Cpu {
    apic_id: ApicId,
    started: AtomicBool,
    kstack: Once<KernelStack>,
}

impl Cpu {
    const fn new(apic_id: ApicId) -> Self {
        Self {
            apic_id,
            started: AtomicBool::new(false),
            kstack: Once::new(),
        }
    }

    /// Local APIC id
    pub fn apic_id(&self) -> ApicId {
        self.apic_id
    }

    /// Has this processor finished its local setup?
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Stack assigned by bring-up, if any
    pub fn kernel_stack(&self) -> Option<&KernelStack> {
        self.kstack.get()
    }

    /// Record the stack bring-up allocated for this processor
    pub(crate) fn assign_stack(&self, stack: KernelStack) -> BootResult<&KernelStack> {
        if self.kstack.is_completed() {
            return Err(BootError::Misconfigured("kernel stack already assigned"));
        }
        Ok(self.kstack.call_once(|| stack))
    }

    fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Bounded processor registry
#[derive(Debug)]
pub struct CpuTable {
    slots: [Once<Cpu>; NCPU],
    count: AtomicUsize,
    limit: usize,
}

assert_impl_all!(CpuTable: Sync, Send);

impl CpuTable {
    /// Empty registry accepting at most `limit` processors (capped at [`NCPU`])
    pub const fn new(limit: usize) -> Self {
        Self {
            slots: [const { Once::new() }; NCPU],
            count: AtomicUsize::new(0),
            limit: if limit > NCPU { NCPU } else { limit },
        }
    }

    /// Capacity
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of registered processors
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Is the registry empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a processor; returns its index
    ///
    /// Discovery calls this from the boot processor before any other processor runs.
    pub fn register(&self, apic_id: ApicId) -> BootResult<usize> {
        if self.position(apic_id).is_some() {
            return Err(BootError::DuplicateProcessor(apic_id));
        }

        let index = self.count.load(Ordering::Acquire);
        if index >= self.limit {
            return Err(BootError::TooManyProcessors { limit: self.limit });
        }
        self.slots[index].call_once(|| Cpu::new(apic_id));
        self.count.store(index + 1, Ordering::Release);

        log::debug!("cpu: registered apic {} as cpu{}", apic_id, index);
        Ok(index)
    }

    /// Descriptor at `index`
    pub fn get(&self, index: usize) -> Option<&Cpu> {
        if index >= self.len() {
            return None;
        }
        self.slots[index].get()
    }

    /// Registered processors in discovery order
    pub fn iter(&self) -> impl Iterator<Item = &Cpu> + '_ {
        self.slots[..self.len()].iter().filter_map(Once::get)
    }

    /// Index of the processor with `apic_id`
    pub fn position(&self, apic_id: ApicId) -> Option<usize> {
        self.iter().position(|cpu| cpu.apic_id() == apic_id)
    }

    /// Descriptor of the processor with `apic_id`
    pub fn identify(&self, apic_id: ApicId) -> BootResult<&Cpu> {
        self.iter()
            .find(|cpu| cpu.apic_id() == apic_id)
            .ok_or(BootError::UnknownProcessor(apic_id))
    }

    /// Number of processors that finished their local setup
    pub fn started_count(&self) -> usize {
        self.iter().filter(|cpu| cpu.is_started()).count()
    }

    /// Handle on the descriptor of the executing processor
    ///
    /// `current` must be the APIC id read on the executing processor.
    pub(crate) fn this_cpu(&self, current: ApicId) -> BootResult<ThisCpu<'_>> {
        let index = self
            .position(current)
            .ok_or(BootError::UnknownProcessor(current))?;
        let cpu = self
            .get(index)
            .ok_or(BootError::UnknownProcessor(current))?;
        Ok(ThisCpu { cpu, index })
    }
}

// =============================================================================
// THIS CPU
// =============================================================================

/// The executing processor's own descriptor
#[derive(Debug)]
pub struct ThisCpu<'t> {
    cpu: &'t Cpu,
    index: usize,
}

impl<'t> ThisCpu<'t> {
    /// Registry index
    pub fn index(&self) -> usize {
        self.index
    }

    /// Descriptor
    pub fn cpu(&self) -> &'t Cpu {
        self.cpu
    }

    /// Announce that local setup is complete
    pub fn mark_started(self) {
        self.cpu.mark_started();
    }
}
