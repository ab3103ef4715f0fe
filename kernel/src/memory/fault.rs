//! TLB fault resolution.
//!
//! Every user-mode translation miss and write-protection fault ends up in
//! [`handle_fault`], which finds the page's entry, populates a frame if the
//! page is not resident, and installs the mapping in the TLB.

use crate::{
    constants::memory::PAGE_SIZE,
    memory::{
        address_space::AddressSpace,
        error::{VmError, VmResult},
        page_table::{Pte, PteFlags, PteIndex, SegmentKind},
        stats::Stat,
        swap,
        tlb::TlbWrite,
        Vm,
    },
    processes::loader,
};
use x86_64::{structures::idt::PageFaultErrorCode, VirtAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    /// Write through a mapping installed read-only
    ProtectionViolation,
}

impl FaultKind {
    /// Decodes a hardware page-fault error code.
    ///
    /// A present-page violation is only resolvable when it is a write; a
    /// read or instruction fetch the mapping forbids is an address error.
    pub fn from_error_code(code: PageFaultErrorCode) -> VmResult<Self> {
        let write = code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
        if code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
            return if write {
                Ok(FaultKind::ProtectionViolation)
            } else {
                Err(VmError::InvalidAddress)
            };
        }
        Ok(if write { FaultKind::Write } else { FaultKind::Read })
    }
}

/// Resolves a fault at `vaddr` in `space`.
///
/// Errors that [`VmError::terminates_process`] reports as fatal should end
/// the process; the rest are returned to it as an errno.
pub fn handle_fault(
    vm: &Vm,
    space: &mut AddressSpace,
    kind: FaultKind,
    vaddr: VirtAddr,
) -> VmResult<()> {
    let page = vaddr.align_down(PAGE_SIZE);
    let at = space.pages().locate(page)?;
    let pte = *space
        .pages()
        .pte(at)
        .ok_or(VmError::Inconsistent("located page outside its segment"))?;
    log::trace!(
        "pid {}: {:?} fault at {:?} in {:?}",
        space.pid(),
        kind,
        vaddr,
        at.segment
    );

    let result = match kind {
        FaultKind::ProtectionViolation => protection_fault(vm, space, &pte),
        FaultKind::Read | FaultKind::Write if pte.is_valid() => {
            vm.stats.inc(Stat::TlbReload);
            install_mapping(vm, &pte).map(|_| ())
        }
        FaultKind::Read | FaultKind::Write => populate(vm, space, at, &pte),
    };

    if let Err(VmError::Inconsistent(what)) = result {
        log::error!(
            "pid {}: {} (page {:?}, {:?})",
            space.pid(),
            what,
            page,
            pte
        );
    }
    result
}

fn protection_fault(vm: &Vm, space: &mut AddressSpace, pte: &Pte) -> VmResult<()> {
    if !pte.is_valid() {
        return Err(VmError::Inconsistent("protection fault on a page that is not resident"));
    }
    if pte.is_dirty() {
        return Err(VmError::Inconsistent("protection fault on a writable page"));
    }
    if pte.is_modified() {
        return Err(VmError::ReadOnlyWrite);
    }
    loader::copy_on_write(vm, space, pte.page())
}

/// Brings a non-resident page in from wherever its contents live
fn populate(vm: &Vm, space: &mut AddressSpace, at: PteIndex, pte: &Pte) -> VmResult<()> {
    if pte.in_swap() {
        return swap::read_in(vm, space, at);
    }
    if !pte.flags().is_empty() {
        return Err(VmError::Inconsistent("absent page with flags set"));
    }
    match at.segment {
        SegmentKind::Text | SegmentKind::Data => loader::load_segment_page(vm, space, pte.page()),
        SegmentKind::Stack => zero_fill(vm, space, at),
    }
}

/// Backs a stack page that was never touched with a zeroed frame
fn zero_fill(vm: &Vm, space: &mut AddressSpace, at: PteIndex) -> VmResult<()> {
    let frame = vm.get_frames(1, true, at.segment.usage(), Some(space.requester()))?;
    vm.memory().zero(frame, PAGE_SIZE as usize);
    vm.stats.inc(Stat::PageFaultZero);

    let pte = space
        .pages_mut()
        .pte_mut(at)
        .ok_or(VmError::Inconsistent("stack page outside its segment"))?;
    pte.bind(frame);
    pte.insert_flags(PteFlags::DIRTY | PteFlags::MODIFIED);
    install_mapping(vm, pte)?;
    Ok(())
}

/// Writes the TLB entry for a resident page.
///
/// Dirty pages map writable. Clean pages that are modified map read-only so
/// the next write faults; clean unmodified pages map writable.
pub(crate) fn install_mapping(vm: &Vm, pte: &Pte) -> VmResult<TlbWrite> {
    let frame = pte
        .frame()
        .ok_or(VmError::Inconsistent("mapping a page that is not resident"))?;
    let writable = pte.is_dirty() || !pte.is_modified();

    let write = vm.tlb.install(pte.page(), frame, writable);
    match write {
        TlbWrite::Refreshed(_) => {}
        TlbWrite::Free(_) => {
            vm.stats.inc(Stat::TlbFault);
            vm.stats.inc(Stat::TlbFaultFree);
        }
        TlbWrite::Replaced(_) => {
            vm.stats.inc(Stat::TlbFault);
            vm.stats.inc(Stat::TlbFaultReplace);
        }
    }
    Ok(write)
}
