//! Host stand-ins for the machine: sparse physical memory, an event log, and one
//! thread per woken processor.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::boot::Kernel;
use crate::cpu::{ApicId, CpuTable};
use crate::error::BootResult;
use crate::kalloc::{AllocatorPhase, PageAllocator};
use crate::memlayout::{EXTMEM, PhysAddr, VirtAddr};
use crate::platform::{
    InterruptController, Machine, PhysMemory, Platform, Scheduler, Subsystems,
};
use crate::stage::{BootHooks, BootStage, BootState};
use crate::trampoline::TrampolineParams;
use crate::{BootConfig, BootError};

/// Entry routine address handed to the trampoline
pub const ENTRY_ADDR: VirtAddr = VirtAddr::new(0x8010_3000);

/// Physical address reported for the entry page directory
pub const ENTRY_PGDIR_PA: PhysAddr = PhysAddr::new(0x0010_8000);

const TRAMPOLINE_IMAGE: &[u8] = &[0xFA, 0x31, 0xC0, 0x8E, 0xD8, 0x8E, 0xC0, 0x8E, 0xD0];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// MEMORY
// =============================================================================

/// Byte-addressed sparse memory; unwritten bytes read as zero
#[derive(Debug, Clone, Default)]
pub struct MockMemory {
    bytes: Arc<Mutex<BTreeMap<u32, u8>>>,
}

impl MockMemory {
    pub fn read_bytes(&self, pa: PhysAddr, len: usize) -> Vec<u8> {
        let bytes = lock(&self.bytes);
        (0..len as u32)
            .map(|i| bytes.get(&(pa.as_u32() + i)).copied().unwrap_or(0))
            .collect()
    }
}

impl PhysMemory for MockMemory {
    fn read_u32(&self, pa: PhysAddr) -> u32 {
        let raw = self.read_bytes(pa, 4);
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    fn write_u32(&self, pa: PhysAddr, value: u32) {
        self.copy_to(pa, &value.to_le_bytes());
    }

    fn copy_to(&self, pa: PhysAddr, src: &[u8]) {
        let mut bytes = lock(&self.bytes);
        for (i, byte) in src.iter().enumerate() {
            bytes.insert(pa.as_u32() + i as u32, *byte);
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Observable platform call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Begin(BootStage),
    End(BootStage),
    Failed(BootStage),
    SetupKernelVm,
    DiscoverProcessors,
    InitLocalApic(ApicId),
    LoadSegments(ApicId),
    DisablePic,
    InitIoApic,
    Console,
    Uart,
    ProcessTable,
    TrapVectors,
    BufferCache,
    FileTable,
    Disk,
    StartProcessor(ApicId, PhysAddr),
    SwitchKernelVm(ApicId),
    LoadIdt(ApicId),
    FirstProcess(PhysAddr),
    AdoptAllocator,
    EnterScheduler(ApicId),
    Halt,
}

impl Event {
    fn apic(&self) -> Option<ApicId> {
        match *self {
            Self::InitLocalApic(id)
            | Self::LoadSegments(id)
            | Self::SwitchKernelVm(id)
            | Self::LoadIdt(id)
            | Self::EnterScheduler(id) => Some(id),
            _ => None,
        }
    }
}

thread_local! {
    static CURRENT_APIC: Cell<Option<ApicId>> = const { Cell::new(None) };
}

// =============================================================================
// PLATFORM
// =============================================================================

/// Simulated multiprocessor
pub struct MockPlatform {
    memory: MockMemory,
    cpus: Vec<ApicId>,
    boot_apic: ApicId,
    dead: BTreeSet<ApicId>,
    kernel_end: PhysAddr,
    kernel: OnceLock<&'static Kernel<MockPlatform>>,
    events: Mutex<Vec<Event>>,
    starts: Mutex<Vec<(ApicId, PhysAddr, TrampolineParams)>>,
    observed: Mutex<BTreeMap<ApicId, TrampolineParams>>,
    overlapping: AtomicUsize,
    adopted: Mutex<Option<PageAllocator<MockMemory>>>,
}

impl std::fmt::Debug for MockPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPlatform")
            .field("cpus", &self.cpus)
            .field("boot_apic", &self.boot_apic)
            .field("dead", &self.dead)
            .finish_non_exhaustive()
    }
}

impl MockPlatform {
    /// Machine whose discovery reports `ids`, booting on apic 0
    pub fn with_cpus(ids: &[u8]) -> Self {
        Self {
            memory: MockMemory::default(),
            cpus: ids.iter().copied().map(ApicId::new).collect(),
            boot_apic: ApicId::new(0),
            dead: BTreeSet::new(),
            kernel_end: PhysAddr::new(EXTMEM),
            kernel: OnceLock::new(),
            events: Mutex::new(Vec::new()),
            starts: Mutex::new(Vec::new()),
            observed: Mutex::new(BTreeMap::new()),
            overlapping: AtomicUsize::new(0),
            adopted: Mutex::new(None),
        }
    }

    pub fn boot_apic(mut self, id: u8) -> Self {
        self.boot_apic = ApicId::new(id);
        self
    }

    /// Processor `id` ignores its start signal
    pub fn dead(mut self, id: u8) -> Self {
        self.dead.insert(ApicId::new(id));
        self
    }

    pub fn kernel_end(mut self, end: PhysAddr) -> Self {
        self.kernel_end = end;
        self
    }

    fn record(&self, event: Event) {
        lock(&self.events).push(event);
    }

    fn current(&self) -> ApicId {
        CURRENT_APIC.with(Cell::get).unwrap_or(self.boot_apic)
    }

    fn kernel(&self) -> &'static Kernel<MockPlatform> {
        self.kernel.get().copied().expect("kernel not leaked")
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    pub fn events_of(&self, id: ApicId) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.apic() == Some(id))
            .collect()
    }

    /// Slot contents sampled as each start signal was sent
    pub fn starts(&self) -> Vec<(ApicId, PhysAddr, TrampolineParams)> {
        lock(&self.starts).clone()
    }

    /// Slot contents a woken processor read as its first action
    pub fn observed_by(&self, id: ApicId) -> Option<TrampolineParams> {
        lock(&self.observed).get(&id).copied()
    }

    /// Start signals sent while an earlier processor had not reported in
    pub fn overlapping_starts(&self) -> usize {
        self.overlapping.load(Ordering::SeqCst)
    }

    /// Allocator handed over at the end of boot
    pub fn adopted(&self) -> Option<PageAllocatorSummary> {
        lock(&self.adopted).as_ref().map(|a| PageAllocatorSummary {
            phase: a.phase(),
            free: a.free_pages(),
            regions: a.regions(),
        })
    }

    pub fn wait_for(&self, event: Event) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.events().contains(&event) {
            assert!(Instant::now() < deadline, "timed out waiting for {:?}", event);
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Snapshot of the adopted allocator
#[derive(Debug, Clone, Copy)]
pub struct PageAllocatorSummary {
    phase: AllocatorPhase,
    free: usize,
    regions: [Option<(PhysAddr, PhysAddr)>; 2],
}

impl PageAllocatorSummary {
    pub fn phase(&self) -> AllocatorPhase {
        self.phase
    }

    pub fn free_pages(&self) -> usize {
        self.free
    }

    pub fn regions(&self) -> [Option<(PhysAddr, PhysAddr)>; 2] {
        self.regions
    }
}

/// Leak a kernel for `platform` so simulated processors can share it
pub fn leak_kernel(platform: MockPlatform, config: BootConfig) -> &'static Kernel<MockPlatform> {
    let kernel: &'static Kernel<MockPlatform> = Box::leak(Box::new(Kernel::new(config, platform)));
    let _ = kernel.platform().kernel.set(kernel);
    kernel
}

fn run_processor(kernel: &'static Kernel<MockPlatform>, id: ApicId) {
    CURRENT_APIC.with(|current| current.set(Some(id)));
    let params = kernel.trampoline().read_params(&kernel.platform().memory);
    lock(&kernel.platform().observed).insert(id, params);
    kernel.mpenter()
}

impl Platform for MockPlatform {
    type Memory = MockMemory;
    type Interrupts = Self;
    type Machine = Self;
    type Subsystems = Self;
    type Scheduler = Self;

    fn memory(&self) -> MockMemory {
        self.memory.clone()
    }

    fn interrupts(&self) -> &Self {
        self
    }

    fn machine(&self) -> &Self {
        self
    }

    fn subsystems(&self) -> &Self {
        self
    }

    fn scheduler(&self) -> &Self {
        self
    }
}

impl InterruptController for MockPlatform {
    fn init_local(&self) {
        self.record(Event::InitLocalApic(self.current()));
    }

    fn disable_pic(&self) {
        self.record(Event::DisablePic);
    }

    fn init_ioapic(&self) {
        self.record(Event::InitIoApic);
    }

    fn start_processor(&self, id: ApicId, start: PhysAddr) {
        let kernel = self.kernel();
        self.record(Event::StartProcessor(id, start));

        let pending = lock(&self.starts)
            .iter()
            .filter(|(prev, ..)| !kernel.cpus().identify(*prev).is_ok_and(|c| c.is_started()))
            .count();
        self.overlapping.fetch_add(pending, Ordering::SeqCst);

        let params = kernel.trampoline().read_params(&self.memory);
        lock(&self.starts).push((id, start, params));

        if !self.dead.contains(&id) {
            thread::spawn(move || run_processor(kernel, id));
        }
    }
}

impl Machine for MockPlatform {
    fn current_apic_id(&self) -> ApicId {
        self.current()
    }

    fn load_segments(&self) {
        self.record(Event::LoadSegments(self.current()));
    }

    fn switch_kernel_vm(&self) {
        self.record(Event::SwitchKernelVm(self.current()));
    }

    fn load_idt(&self) {
        self.record(Event::LoadIdt(self.current()));
    }

    fn halt(&self) -> ! {
        self.record(Event::Halt);
        panic!("processor {} halted", self.current());
    }
}

impl Subsystems<MockMemory> for MockPlatform {
    fn kernel_end(&self) -> PhysAddr {
        self.kernel_end
    }

    fn setup_kernel_vm(&self, _allocator: &mut PageAllocator<MockMemory>) -> BootResult<()> {
        self.record(Event::SetupKernelVm);
        Ok(())
    }

    fn discover_processors(&self, cpus: &CpuTable) -> BootResult<()> {
        self.record(Event::DiscoverProcessors);
        for id in &self.cpus {
            cpus.register(*id)?;
        }
        Ok(())
    }

    fn init_console(&self) {
        self.record(Event::Console);
    }

    fn init_uart(&self) {
        self.record(Event::Uart);
    }

    fn init_process_table(&self) {
        self.record(Event::ProcessTable);
    }

    fn init_trap_vectors(&self) {
        self.record(Event::TrapVectors);
    }

    fn init_buffer_cache(&self) {
        self.record(Event::BufferCache);
    }

    fn init_file_table(&self) {
        self.record(Event::FileTable);
    }

    fn init_disk(&self) {
        self.record(Event::Disk);
    }

    fn ap_entry(&self) -> VirtAddr {
        ENTRY_ADDR
    }

    fn entry_pgdir(&self) -> PhysAddr {
        ENTRY_PGDIR_PA
    }

    fn trampoline_image(&self) -> &'static [u8] {
        TRAMPOLINE_IMAGE
    }
}

impl Scheduler<MockMemory> for MockPlatform {
    fn create_first_process(&self, allocator: &mut PageAllocator<MockMemory>) -> BootResult<()> {
        let page = allocator.allocate_page()?;
        self.record(Event::FirstProcess(page));
        Ok(())
    }

    fn adopt_allocator(&self, allocator: PageAllocator<MockMemory>) {
        self.record(Event::AdoptAllocator);
        *lock(&self.adopted) = Some(allocator);
    }

    fn enter_scheduler(&self) -> ! {
        self.record(Event::EnterScheduler(self.current()));
        loop {
            thread::park();
        }
    }
}

// =============================================================================
// HOOKS
// =============================================================================

/// Hooks that log stage boundaries into the platform's event stream
#[derive(Debug)]
pub struct RecordingHooks {
    platform: &'static MockPlatform,
}

impl RecordingHooks {
    pub fn new(platform: &'static MockPlatform) -> Self {
        Self { platform }
    }
}

impl BootHooks for RecordingHooks {
    fn pre_stage(&mut self, stage: BootStage, _state: &BootState) -> BootResult<()> {
        self.platform.record(Event::Begin(stage));
        Ok(())
    }

    fn post_stage(&mut self, stage: BootStage, _state: &BootState) -> BootResult<()> {
        self.platform.record(Event::End(stage));
        Ok(())
    }

    fn on_error(&mut self, stage: BootStage, _error: &BootError) {
        self.platform.record(Event::Failed(stage));
    }
}
