//! VM event counters, reported at shutdown.

use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    /// Any fault that ended with a mapping installed
    TlbFault,
    /// Mapping went into an unused TLB slot
    TlbFaultFree,
    /// Mapping displaced a live TLB entry
    TlbFaultReplace,
    /// Whole TLB flushed on address-space switch
    TlbInvalidate,
    /// Page was resident, only the TLB entry was missing
    TlbReload,
    /// Fresh stack page filled with zeros
    PageFaultZero,
    /// Page brought in from the executable or the swap file
    PageFaultDisk,
    ElfFileRead,
    SwapFileRead,
    SwapFileWrite,
}

const NUM_STATS: usize = 10;

const STAT_NAMES: [&str; NUM_STATS] = [
    "TLB faults",
    "TLB faults with free",
    "TLB faults with replace",
    "TLB invalidations",
    "TLB reloads",
    "Page faults (zeroed)",
    "Page faults (disk)",
    "ELF file reads",
    "Swapfile reads",
    "Swapfile writes",
];

#[derive(Default)]
pub struct VmStats {
    counters: [AtomicU64; NUM_STATS],
}

impl VmStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, stat: Stat) {
        self.counters[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, stat: Stat) -> u64 {
        self.counters[stat as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> [u64; NUM_STATS] {
        core::array::from_fn(|i| self.counters[i].load(Ordering::Relaxed))
    }

    /// Logs every counter and warns when they do not add up
    pub fn report(&self) {
        let counts = self.snapshot();
        for (name, count) in STAT_NAMES.iter().zip(counts) {
            log::info!("VM stat {}: {}", name, count);
        }

        let tlb_faults = self.get(Stat::TlbFault);
        let placed = self.get(Stat::TlbFaultFree) + self.get(Stat::TlbFaultReplace);
        if tlb_faults != placed {
            log::warn!(
                "VM stats: {} TLB faults but {} free + replace",
                tlb_faults,
                placed
            );
        }

        let disk = self.get(Stat::ElfFileRead) + self.get(Stat::SwapFileRead);
        if self.get(Stat::PageFaultDisk) != disk {
            log::warn!(
                "VM stats: {} disk page faults but {} ELF + swap reads",
                self.get(Stat::PageFaultDisk),
                disk
            );
        }
    }
}
