//! # Two-Phase Page Allocator
//!
//! Free pages form a last-in, first-out list threaded through the pages themselves:
//! the first word of every free page holds the physical address of the next one.
//!
//! ```text
//!   head ──▶ ┌────────┐    ┌────────┐    ┌────────┐
//!            │ next ──┼──▶ │ next ──┼──▶ │  END   │
//!            │        │    │        │    │        │
//!            └────────┘    └────────┘    └────────┘
//! ```
//!
//! ## Phases
//!
//! | Phase        | Memory managed             | Entered by                 |
//! |--------------|----------------------------|----------------------------|
//! | Uninitialized| none                       |                            |
//! | EntryMapped  | `[kernel end, 4 MiB)`      | `initialize_phase1`        |
//! | Full         | above plus `[4 MiB, top)`  | `initialize_phase2` + token|
//!
//! A processor woken by the trampoline can only address the low 4 MiB until it loads
//! the kernel page table, so every stack allocated during bring-up has to come from the
//! `EntryMapped` pool. Phase 2 requires a [`BringupComplete`] token, which only
//! [`start_others`](crate::smp::start_others) hands out.

use crate::error::{BootError, BootResult};
use crate::memlayout::{ENTRY_MAP_SIZE, EXTMEM, PGSIZE, PhysAddr};
use crate::platform::PhysMemory;
use crate::smp::BringupComplete;

/// Free-list terminator; never a valid page address
const END_OF_LIST: u32 = u32::MAX;

/// Allocator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AllocatorPhase {
    /// No memory registered yet
    Uninitialized,
    /// Only the entry-mapped window is available
    EntryMapped,
    /// All of physical memory is available
    Full,
}

/// Physical page allocator used during boot
///
/// Owned by the boot sequence and mutated through `&mut self` only. After boot it is
/// handed to the scheduler, which puts it behind a lock.
#[derive(Debug)]
pub struct PageAllocator<M: PhysMemory> {
    memory: M,
    head: u32,
    free: usize,
    phase: AllocatorPhase,
    /// Lowest managed address
    floor: PhysAddr,
    /// One past the highest managed address
    ceiling: PhysAddr,
    regions: [Option<(PhysAddr, PhysAddr)>; 2],
}

impl<M: PhysMemory> PageAllocator<M> {
    /// Create an empty allocator
    pub const fn new(memory: M) -> Self {
        Self {
            memory,
            head: END_OF_LIST,
            free: 0,
            phase: AllocatorPhase::Uninitialized,
            floor: PhysAddr::new(0),
            ceiling: PhysAddr::new(0),
            regions: [None, None],
        }
    }

    /// Current phase
    pub fn phase(&self) -> AllocatorPhase {
        self.phase
    }

    /// Number of free pages
    pub fn free_pages(&self) -> usize {
        self.free
    }

    /// Page-aligned ranges registered by phase 1 and phase 2
    pub fn regions(&self) -> [Option<(PhysAddr, PhysAddr)>; 2] {
        self.regions
    }

    /// Register `[start, end)` as the first free memory
    ///
    /// The range must lie inside the entry-mapped window and above [`EXTMEM`], clear of
    /// the trampoline and the rest of low memory. `start` is rounded up and `end` down to
    /// page boundaries.
    pub fn initialize_phase1(&mut self, start: PhysAddr, end: PhysAddr) -> BootResult<()> {
        if self.phase != AllocatorPhase::Uninitialized {
            return Err(BootError::AllocatorPhase {
                op: "initialize_phase1",
                phase: self.phase,
            });
        }
        if end.as_u32() > ENTRY_MAP_SIZE {
            return Err(BootError::Misconfigured(
                "phase-1 memory extends past the entry-mapped window",
            ));
        }
        if start > end {
            return Err(BootError::Misconfigured("phase-1 range is inverted"));
        }

        let (start, end) = (start.page_round_up(), end.page_round_down());
        if start < PhysAddr::new(EXTMEM) {
            return Err(BootError::Misconfigured("phase-1 memory starts below extended memory"));
        }
        self.floor = start;
        self.ceiling = end;
        self.phase = AllocatorPhase::EntryMapped;
        self.free_range(start, end);
        self.regions[0] = Some((start, end));

        log::debug!(
            "kalloc: phase 1 [{}, {}) {} pages",
            start,
            end,
            self.free
        );
        Ok(())
    }

    /// Register `[start, end)` once every processor has been brought up
    pub fn initialize_phase2(
        &mut self,
        start: PhysAddr,
        end: PhysAddr,
        _bringup: &BringupComplete,
    ) -> BootResult<()> {
        if self.phase != AllocatorPhase::EntryMapped {
            return Err(BootError::AllocatorPhase {
                op: "initialize_phase2",
                phase: self.phase,
            });
        }
        if start > end {
            return Err(BootError::Misconfigured("phase-2 range is inverted"));
        }

        let (start, end) = (start.page_round_up(), end.page_round_down());
        let overlaps = self.regions[0]
            .is_some_and(|(low, high)| low < high && start < high && low < end);
        if start < end && overlaps {
            return Err(BootError::Misconfigured("phase-2 range overlaps phase-1 memory"));
        }
        if start < end {
            self.floor = self.floor.min(start);
            self.ceiling = self.ceiling.max(end);
        }
        let before = self.free;
        self.phase = AllocatorPhase::Full;
        self.free_range(start, end);
        self.regions[1] = Some((start, end));

        log::debug!(
            "kalloc: phase 2 [{}, {}) {} pages",
            start,
            end,
            self.free - before
        );
        Ok(())
    }

    /// Take one page off the free list
    pub fn allocate_page(&mut self) -> BootResult<PhysAddr> {
        if self.phase == AllocatorPhase::Uninitialized {
            return Err(BootError::AllocatorPhase {
                op: "allocate_page",
                phase: self.phase,
            });
        }
        if self.head == END_OF_LIST {
            return Err(BootError::OutOfMemory);
        }

        let page = PhysAddr::new(self.head);
        self.head = self.memory.read_u32(page);
        self.free -= 1;
        Ok(page)
    }

    /// Return a page to the free list
    pub fn free_page(&mut self, page: PhysAddr) -> BootResult<()> {
        if self.phase == AllocatorPhase::Uninitialized {
            return Err(BootError::AllocatorPhase {
                op: "free_page",
                phase: self.phase,
            });
        }
        if !page.is_page_aligned() || page < self.floor || page >= self.ceiling {
            return Err(BootError::BadFrame(page));
        }
        self.push(page);
        Ok(())
    }

    fn free_range(&mut self, start: PhysAddr, end: PhysAddr) {
        let mut page = start;
        while page < end {
            self.push(page);
            page = page.add(PGSIZE);
        }
    }

    fn push(&mut self, page: PhysAddr) {
        self.memory.write_u32(page, self.head);
        self.head = page.as_u32();
        self.free += 1;
    }
}
