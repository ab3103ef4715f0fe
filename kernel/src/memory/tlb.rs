//! Software-refilled, fully associative TLB.
//!
//! There is no hardware page-table walker behind user mappings: every
//! translation the CPU may use lives in this table, and the fault resolver
//! refills it. Entries are only changed with interrupts masked.

use crate::{
    constants::memory::{NUM_TLB, PAGE_SIZE},
    interrupts::without_interrupts,
};
use arrayvec::ArrayVec;
use bitflags::bitflags;
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TlbFlags: u8 {
        const VALID = 1 << 0;
        /// Writes allowed; a write through a clean entry raises a protection fault
        const DIRTY = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub page: VirtAddr,
    pub frame: PhysAddr,
    pub flags: TlbFlags,
}

impl TlbEntry {
    const INVALID: TlbEntry = TlbEntry {
        page: VirtAddr::zero(),
        frame: PhysAddr::zero(),
        flags: TlbFlags::empty(),
    };

    pub fn is_valid(&self) -> bool {
        self.flags.contains(TlbFlags::VALID)
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(TlbFlags::DIRTY)
    }
}

/// Which slot [`Tlb::install`] wrote, and how it was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbWrite {
    /// An entry for the page already existed and was rewritten
    Refreshed(usize),
    /// An invalid slot was used
    Free(usize),
    /// A live entry for another page was displaced
    Replaced(usize),
}

struct TlbState {
    entries: ArrayVec<TlbEntry, NUM_TLB>,
    next_victim: usize,
}

impl TlbState {
    fn probe(&self, page: VirtAddr) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.is_valid() && entry.page == page)
    }
}

pub struct Tlb {
    state: Mutex<TlbState>,
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb {
    pub fn new() -> Self {
        Self::with_capacity(NUM_TLB)
    }

    /// A TLB with fewer slots than the hardware has, capped at [`NUM_TLB`]
    pub fn with_capacity(slots: usize) -> Self {
        let mut entries = ArrayVec::new();
        for _ in 0..slots.clamp(1, NUM_TLB) {
            entries.push(TlbEntry::INVALID);
        }
        Self {
            state: Mutex::new(TlbState {
                entries,
                next_victim: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Slot holding a valid mapping for `page`, if any
    pub fn probe(&self, page: VirtAddr) -> Option<usize> {
        without_interrupts(|| self.state.lock().probe(page.align_down(PAGE_SIZE)))
    }

    pub fn translate(&self, page: VirtAddr) -> Option<TlbEntry> {
        without_interrupts(|| {
            let state = self.state.lock();
            let page = page.align_down(PAGE_SIZE);
            state.probe(page).map(|i| state.entries[i])
        })
    }

    /// Maps `page` to `frame`, writable iff `writable`.
    ///
    /// An existing entry for the page is rewritten in place; otherwise the
    /// first invalid slot is used, and when the table is full the round-robin
    /// victim is replaced.
    pub fn install(&self, page: VirtAddr, frame: PhysAddr, writable: bool) -> TlbWrite {
        let page = page.align_down(PAGE_SIZE);
        let mut flags = TlbFlags::VALID;
        flags.set(TlbFlags::DIRTY, writable);
        let entry = TlbEntry { page, frame, flags };

        let write = without_interrupts(|| {
            let mut state = self.state.lock();
            let write = if let Some(i) = state.probe(page) {
                TlbWrite::Refreshed(i)
            } else if let Some(i) = state.entries.iter().position(|e| !e.is_valid()) {
                // keep the round-robin victim off the line just filled
                if state.next_victim == i {
                    state.next_victim = (i + 1) % state.entries.len();
                }
                TlbWrite::Free(i)
            } else {
                let i = state.next_victim;
                state.next_victim = (i + 1) % state.entries.len();
                TlbWrite::Replaced(i)
            };

            let slot = match write {
                TlbWrite::Refreshed(i) | TlbWrite::Free(i) | TlbWrite::Replaced(i) => i,
            };
            let old = core::mem::replace(&mut state.entries[slot], entry);
            if old.is_valid() {
                flush(old.page);
            }
            write
        });
        log::trace!("TLB {:?}: {:?} -> {:?} ({:?})", write, page, frame, flags);
        write
    }

    /// Drops the mapping for `page`; returns whether one existed
    pub fn invalidate(&self, page: VirtAddr) -> bool {
        without_interrupts(|| {
            let mut state = self.state.lock();
            match state.probe(page.align_down(PAGE_SIZE)) {
                Some(i) => {
                    state.entries[i] = TlbEntry::INVALID;
                    flush(page);
                    true
                }
                None => false,
            }
        })
    }

    pub fn invalidate_all(&self) {
        without_interrupts(|| {
            let mut state = self.state.lock();
            for entry in state.entries.iter_mut() {
                if entry.is_valid() {
                    flush(entry.page);
                }
                *entry = TlbEntry::INVALID;
            }
        })
    }

    pub fn valid_count(&self) -> usize {
        without_interrupts(|| {
            self.state
                .lock()
                .entries
                .iter()
                .filter(|entry| entry.is_valid())
                .count()
        })
    }
}

/// Drops any translation the CPU cached for `page`
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn flush(page: VirtAddr) {
    x86_64::instructions::tlb::flush(page);
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn flush(_page: VirtAddr) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: u64) -> VirtAddr {
        VirtAddr::new(n * 4096)
    }

    fn frame(n: u64) -> PhysAddr {
        PhysAddr::new(0x10_0000 + n * 4096)
    }

    #[test]
    fn test_install_prefers_existing_then_free() {
        let tlb = Tlb::with_capacity(4);
        assert_eq!(tlb.install(page(1), frame(1), false), TlbWrite::Free(0));
        assert_eq!(tlb.install(page(2), frame(2), true), TlbWrite::Free(1));
        assert_eq!(tlb.install(page(1), frame(7), true), TlbWrite::Refreshed(0));

        let entry = tlb.translate(page(1) + 12u64).unwrap();
        assert_eq!(entry.frame, frame(7));
        assert!(entry.is_writable());
        assert_eq!(tlb.valid_count(), 2);
    }

    #[test]
    fn test_round_robin_replacement_wraps() {
        let tlb = Tlb::with_capacity(2);
        tlb.install(page(1), frame(1), false);
        tlb.install(page(2), frame(2), false);

        assert_eq!(tlb.install(page(3), frame(3), false), TlbWrite::Replaced(0));
        assert_eq!(tlb.install(page(4), frame(4), false), TlbWrite::Replaced(1));
        assert_eq!(tlb.install(page(5), frame(5), false), TlbWrite::Replaced(0));
        assert!(tlb.probe(page(1)).is_none());
        assert_eq!(tlb.probe(page(4)), Some(1));
    }

    #[test]
    fn test_refill_of_victim_slot_moves_victim_on() {
        let tlb = Tlb::with_capacity(2);
        tlb.install(page(1), frame(1), false);
        tlb.install(page(2), frame(2), false);
        tlb.invalidate(page(1));

        assert_eq!(tlb.install(page(3), frame(3), false), TlbWrite::Free(0));
        assert_eq!(tlb.install(page(4), frame(4), false), TlbWrite::Replaced(1));
        assert_eq!(tlb.probe(page(3)), Some(0));
        assert!(tlb.probe(page(2)).is_none());
    }

    #[test]
    fn test_invalidate_frees_slot() {
        let tlb = Tlb::with_capacity(2);
        tlb.install(page(1), frame(1), false);
        tlb.install(page(2), frame(2), false);

        assert!(tlb.invalidate(page(1)));
        assert!(!tlb.invalidate(page(1)));
        assert_eq!(tlb.install(page(9), frame(9), false), TlbWrite::Free(0));

        tlb.invalidate_all();
        assert_eq!(tlb.valid_count(), 0);
    }
}
