//! Swap store.
//!
//! The swap file is an array of page-sized slots with no header: slot `i`
//! lives at byte offset `i * PAGE_SIZE`. A slot is claimed the first time a
//! page is evicted and stays bound to that page for the life of the address
//! space; slots are never handed back.

use crate::{
    constants::memory::{FRAME_SIZE, PAGE_SIZE, SWAP_FILE_SIZE},
    filesys::{FsError, VnodeRef},
    memory::{
        address_space::AddressSpace,
        error::{VmError, VmResult},
        fault::install_mapping,
        page_table::{Pte, PteIndex, SwapSlot},
        phys::PhysMemory,
        stats::Stat,
        tlb::Tlb,
        Vm,
    },
};
use alloc::{boxed::Box, vec, vec::Vec};
use spin::Mutex;
use x86_64::PhysAddr;

/// Which slots hold a page, one bit per slot
struct SlotMap {
    total: usize,
    used: usize,
    bitmap: Box<[u64]>,
}

impl SlotMap {
    fn new(total: usize) -> Self {
        Self {
            total,
            used: 0,
            bitmap: vec![0u64; total.div_ceil(64)].into_boxed_slice(),
        }
    }

    fn is_bit_set(&self, slot: usize) -> bool {
        assert!(slot < self.total);
        (self.bitmap[slot / 64] & (1 << (slot % 64))) != 0
    }

    fn set_bit(&mut self, slot: usize) {
        if !self.is_bit_set(slot) {
            self.bitmap[slot / 64] |= 1 << (slot % 64);
            self.used += 1;
        }
    }

    /// Lowest unused slot
    fn first_free(&self) -> Option<usize> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i * 64 + word.trailing_ones() as usize)
            .filter(|&slot| slot < self.total)
    }
}

pub struct SwapStore {
    file: VnodeRef,
    slots: Mutex<SlotMap>,
}

impl SwapStore {
    pub fn new(file: VnodeRef) -> Self {
        Self::with_slots(file, (SWAP_FILE_SIZE / PAGE_SIZE) as usize)
    }

    pub fn with_slots(file: VnodeRef, slots: usize) -> Self {
        log::info!(
            "Swap: {} slots, {} KiB",
            slots,
            slots as u64 * PAGE_SIZE / 1024
        );
        Self {
            file,
            slots: Mutex::new(SlotMap::new(slots)),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().total
    }

    pub fn free_slots(&self) -> usize {
        let slots = self.slots.lock();
        slots.total - slots.used
    }

    pub fn is_slot_free(&self, slot: SwapSlot) -> bool {
        let slots = self.slots.lock();
        slot < slots.total && !slots.is_bit_set(slot)
    }

    /// Copies a resident, modified page to swap and unbinds it from its frame.
    ///
    /// A page already bound to a slot overwrites it; otherwise the lowest free
    /// slot is claimed. The slot is only recorded once the write has gone
    /// through. On success the page's TLB entry is dropped and the frame
    /// zeroed.
    pub fn write_out(
        &self,
        pte: &mut Pte,
        memory: &dyn PhysMemory,
        tlb: &Tlb,
    ) -> VmResult<SwapSlot> {
        if !pte.is_modified() {
            return Err(VmError::CleanEviction);
        }
        let frame = pte
            .frame()
            .ok_or(VmError::Inconsistent("evicting a page that is not resident"))?;

        let mut buf = vec![0u8; FRAME_SIZE];
        memory.read(frame, &mut buf);

        let mut slots = self.slots.lock();
        let slot = match pte.swap_slot() {
            Some(slot) => slot,
            None => slots.first_free().ok_or(VmError::SwapFull)?,
        };
        let written = self.file.write_at(slot as u64 * PAGE_SIZE, &buf)?;
        if written != FRAME_SIZE {
            return Err(VmError::Io(FsError::IOError));
        }
        slots.set_bit(slot);
        drop(slots);

        log::trace!("Swapped out {:?} to slot {}", pte.page(), slot);
        pte.swap_out(slot);
        tlb.invalidate(pte.page());
        memory.zero(frame, FRAME_SIZE);
        Ok(slot)
    }

    /// Fills `frame` with the contents of `slot`
    pub fn read_slot(
        &self,
        slot: SwapSlot,
        memory: &dyn PhysMemory,
        frame: PhysAddr,
    ) -> VmResult<()> {
        let mut buf: Vec<u8> = vec![0u8; FRAME_SIZE];
        let slots = self.slots.lock();
        if slot >= slots.total || !slots.is_bit_set(slot) {
            return Err(VmError::Inconsistent("reading an unused swap slot"));
        }
        let read = self.file.read_at(slot as u64 * PAGE_SIZE, &mut buf)?;
        drop(slots);

        if read != FRAME_SIZE {
            return Err(VmError::Io(FsError::IOError));
        }
        memory.write(frame, &buf);
        Ok(())
    }
}

/// Brings the swapped-out page at `at` back into a fresh frame and maps it.
///
/// The frame is allocated before the swap lock is taken, since allocating may
/// itself evict a page through [`SwapStore::write_out`].
pub fn read_in(vm: &Vm, space: &mut AddressSpace, at: PteIndex) -> VmResult<()> {
    let slot = space
        .pages()
        .pte(at)
        .and_then(Pte::swap_slot)
        .ok_or(VmError::Inconsistent("swap-in of a page with no slot"))?;

    let frame = vm.get_frames(1, true, at.segment.usage(), Some(space.requester()))?;
    if let Err(err) = vm.swap.read_slot(slot, vm.memory(), frame) {
        if let Err(free_err) = vm.free_frames(frame) {
            log::error!("Dropping frame after failed swap-in: {}", free_err);
        }
        return Err(err);
    }
    vm.stats.inc(Stat::SwapFileRead);
    vm.stats.inc(Stat::PageFaultDisk);

    let pte = space
        .pages_mut()
        .pte_mut(at)
        .ok_or(VmError::Inconsistent("swap-in target vanished"))?;
    pte.bind(frame);
    log::trace!("Swapped in {:?} from slot {}", pte.page(), slot);
    install_mapping(vm, pte)?;
    Ok(())
}
