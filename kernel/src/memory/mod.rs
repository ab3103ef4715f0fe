pub mod address_space;
pub mod coremap;
pub mod error;
pub mod fault;
pub mod page_table;
pub mod phys;
pub mod stats;
pub mod swap;
pub mod tlb;

#[cfg(test)]
pub(crate) mod testing;

use alloc::boxed::Box;
use x86_64::{PhysAddr, VirtAddr};

use address_space::AddressSpace;
use coremap::{Coremap, FrameUse, Requester};
use error::VmResult;
use fault::FaultKind;
use phys::PhysMemory;
use stats::{Stat, VmStats};
use swap::SwapStore;
use tlb::Tlb;

/// The VM system: one per kernel, built at boot and passed to whoever needs it
pub struct Vm {
    pub coremap: Coremap,
    pub swap: SwapStore,
    pub tlb: Tlb,
    pub stats: VmStats,
}

impl Vm {
    pub fn new(memory: Box<dyn PhysMemory>, swap: SwapStore) -> Self {
        Self {
            coremap: Coremap::new(memory),
            swap,
            tlb: Tlb::new(),
            stats: VmStats::new(),
        }
    }

    /// Replaces the TLB, e.g. with a smaller one
    pub fn with_tlb(mut self, tlb: Tlb) -> Self {
        self.tlb = tlb;
        self
    }

    /// Builds the frame table now rather than on the first allocation
    pub fn bootstrap(&self) {
        self.coremap.bootstrap();
        log::info!(
            "VM ready: {} frames, {} swap slots, {} TLB entries",
            self.coremap.frame_count(),
            self.swap.slot_count(),
            self.tlb.capacity()
        );
    }

    pub fn memory(&self) -> &dyn PhysMemory {
        self.coremap.memory()
    }

    /// Allocates `n` contiguous frames, evicting one of `requester`'s pages
    /// to swap if nothing is free
    pub fn get_frames(
        &self,
        n: usize,
        swappable: bool,
        usage: FrameUse,
        requester: Option<Requester<'_>>,
    ) -> VmResult<PhysAddr> {
        self.coremap
            .allocate(n, swappable, usage, requester, |victim| {
                self.swap.write_out(victim, self.memory(), &self.tlb)?;
                self.stats.inc(Stat::SwapFileWrite);
                Ok(())
            })
    }

    /// Frees the run starting at `paddr`; returns how many frames it held
    pub fn free_frames(&self, paddr: PhysAddr) -> VmResult<usize> {
        self.coremap.free(paddr)
    }

    /// Allocates `n` contiguous frames for the kernel; these are never evicted
    pub fn alloc_kpages(&self, n: usize) -> VmResult<PhysAddr> {
        self.get_frames(n, false, FrameUse::Kernel, None)
    }

    pub fn free_kpages(&self, paddr: PhysAddr) -> VmResult<()> {
        self.free_frames(paddr).map(|_| ())
    }

    pub fn handle_fault(
        &self,
        space: &mut AddressSpace,
        kind: FaultKind,
        vaddr: VirtAddr,
    ) -> VmResult<()> {
        fault::handle_fault(self, space, kind, vaddr)
    }

    /// Reports VM statistics
    pub fn shutdown(&self) {
        self.stats.report();
        self.coremap.dump();
    }
}
