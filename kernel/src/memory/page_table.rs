//! Per-process page tables.
//!
//! A user address space is at most three contiguous segments: text and data,
//! defined from the executable's program headers in that order, and a
//! fixed-size stack just below [`USER_STACK_TOP`]. Each segment holds one
//! [`Pte`] per page.

use crate::{
    constants::memory::{MAX_REGIONS, PAGE_SIZE, STACK_PAGES, USER_STACK_TOP},
    memory::{
        coremap::FrameUse,
        error::{VmError, VmResult},
    },
};
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use bitflags::bitflags;
use x86_64::{PhysAddr, VirtAddr};

/// Index of a page-sized slot in the swap file
pub type SwapSlot = usize;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        /// The page may be written through its current mapping
        const DIRTY = 1 << 0;
        /// The page holds data that exists nowhere else; evicting it needs swap
        const MODIFIED = 1 << 1;
    }
}

bitflags! {
    /// Segment permissions, numbered like ELF `p_flags`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

/// Where the contents of a page live right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Never loaded, or dropped without a swap copy
    Absent,
    /// In a frame; `slot` is kept when the page came back from swap so a
    /// later eviction can overwrite it
    Resident {
        frame: PhysAddr,
        slot: Option<SwapSlot>,
    },
    Swapped {
        slot: SwapSlot,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    page: VirtAddr,
    residency: Residency,
    flags: PteFlags,
}

impl Pte {
    fn new(page: VirtAddr) -> Self {
        Self {
            page,
            residency: Residency::Absent,
            flags: PteFlags::empty(),
        }
    }

    /// Page-aligned virtual address this entry maps
    pub fn page(&self) -> VirtAddr {
        self.page
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn flags(&self) -> PteFlags {
        self.flags
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.residency, Residency::Resident { .. })
    }

    /// The page's only copy is in the swap file
    pub fn in_swap(&self) -> bool {
        matches!(self.residency, Residency::Swapped { .. })
    }

    pub fn frame(&self) -> Option<PhysAddr> {
        match self.residency {
            Residency::Resident { frame, .. } => Some(frame),
            _ => None,
        }
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.residency {
            Residency::Resident { slot, .. } => slot,
            Residency::Swapped { slot } => Some(slot),
            Residency::Absent => None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PteFlags::DIRTY)
    }

    pub fn is_modified(&self) -> bool {
        self.flags.contains(PteFlags::MODIFIED)
    }

    /// Makes the page resident in `frame`, keeping any swap binding
    pub(crate) fn bind(&mut self, frame: PhysAddr) {
        self.residency = Residency::Resident {
            frame,
            slot: self.swap_slot(),
        };
    }

    pub(crate) fn swap_out(&mut self, slot: SwapSlot) {
        self.residency = Residency::Swapped { slot };
    }

    pub(crate) fn clear(&mut self) {
        self.residency = Residency::Absent;
        self.flags = PteFlags::empty();
    }

    pub(crate) fn insert_flags(&mut self, flags: PteFlags) {
        self.flags.insert(flags);
    }

    #[cfg(test)]
    pub(crate) fn remove_flags(&mut self, flags: PteFlags) {
        self.flags.remove(flags);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Text,
    Data,
    Stack,
}

impl SegmentKind {
    /// Tag recorded in the coremap for frames backing this segment
    pub fn usage(self) -> FrameUse {
        match self {
            SegmentKind::Text => FrameUse::Text,
            SegmentKind::Data => FrameUse::Data,
            SegmentKind::Stack => FrameUse::Stack,
        }
    }
}

/// Why [`PageTable::lookup`] could not hand back a usable mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissKind {
    /// Text or data page that is not resident
    PageFault,
    /// Stack page that is not resident
    StackFault,
}

#[derive(Debug, Clone)]
pub struct Segment {
    kind: SegmentKind,
    base: VirtAddr,
    perms: Permissions,
    pages: Vec<Pte>,
}

impl Segment {
    fn new(kind: SegmentKind, base: VirtAddr, npages: usize, perms: Permissions) -> Self {
        let pages = (0..npages)
            .map(|i| Pte::new(base + i as u64 * PAGE_SIZE))
            .collect();
        Self {
            kind,
            base,
            perms,
            pages,
        }
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn end(&self) -> VirtAddr {
        self.base + self.pages.len() as u64 * PAGE_SIZE
    }

    pub fn perms(&self) -> Permissions {
        self.perms
    }

    pub fn is_writable(&self) -> bool {
        self.perms.contains(Permissions::WRITE)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[Pte] {
        &self.pages
    }

    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        vaddr >= self.base && vaddr < self.end()
    }

    fn index_of(&self, vaddr: VirtAddr) -> usize {
        ((vaddr - self.base) / PAGE_SIZE) as usize
    }
}

/// Position of one entry inside a [`PageTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteIndex {
    pub segment: SegmentKind,
    pub index: usize,
}

fn stack_base() -> VirtAddr {
    VirtAddr::new(USER_STACK_TOP - STACK_PAGES as u64 * PAGE_SIZE)
}

#[derive(Debug, Clone, Default)]
pub struct PageTable {
    regions: ArrayVec<Segment, MAX_REGIONS>,
    stack: Option<Segment>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the next region: the first call defines text, the second data.
    ///
    /// `vaddr` is aligned down and the end aligned up to a page boundary.
    pub fn define_segment(
        &mut self,
        vaddr: VirtAddr,
        size: u64,
        perms: Permissions,
    ) -> VmResult<SegmentKind> {
        let kind = match self.regions.len() {
            0 => SegmentKind::Text,
            1 => SegmentKind::Data,
            _ => return Err(VmError::Unsupported),
        };

        let base = vaddr.align_down(PAGE_SIZE);
        let end = vaddr
            .as_u64()
            .checked_add(size)
            .and_then(|end| end.checked_add(PAGE_SIZE - 1))
            .map(|end| end & !(PAGE_SIZE - 1))
            .ok_or(VmError::InvalidAddress)?;
        if end > stack_base().as_u64() {
            return Err(VmError::InvalidAddress);
        }
        let end = VirtAddr::new(end);
        if self
            .regions
            .iter()
            .any(|region| base < region.end() && region.base() < end)
        {
            return Err(VmError::InvalidAddress);
        }

        let npages = ((end - base) / PAGE_SIZE) as usize;
        self.regions.push(Segment::new(kind, base, npages, perms));
        log::debug!("Defined {:?} segment {:?}..{:?} {:?}", kind, base, end, perms);
        Ok(kind)
    }

    /// Creates the stack segment and returns the initial stack pointer
    pub fn define_stack(&mut self) -> VirtAddr {
        if self.stack.is_none() {
            self.stack = Some(Segment::new(
                SegmentKind::Stack,
                stack_base(),
                STACK_PAGES,
                Permissions::READ | Permissions::WRITE,
            ));
        }
        VirtAddr::new(USER_STACK_TOP)
    }

    pub fn segment(&self, kind: SegmentKind) -> Option<&Segment> {
        match kind {
            SegmentKind::Text => self.regions.first(),
            SegmentKind::Data => self.regions.get(1),
            SegmentKind::Stack => self.stack.as_ref(),
        }
    }

    fn segment_mut(&mut self, kind: SegmentKind) -> Option<&mut Segment> {
        match kind {
            SegmentKind::Text => self.regions.first_mut(),
            SegmentKind::Data => self.regions.get_mut(1),
            SegmentKind::Stack => self.stack.as_mut(),
        }
    }

    /// Text, data and stack, in that order, skipping undefined ones
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.regions.iter().chain(self.stack.iter())
    }

    /// Which segment `vaddr` falls in; the stack range is fixed
    pub fn classify(&self, vaddr: VirtAddr) -> Option<SegmentKind> {
        if vaddr >= stack_base() && vaddr.as_u64() < USER_STACK_TOP {
            return Some(SegmentKind::Stack);
        }
        self.regions
            .iter()
            .find(|region| region.contains(vaddr))
            .map(Segment::kind)
    }

    pub fn locate(&self, vaddr: VirtAddr) -> VmResult<PteIndex> {
        let kind = self.classify(vaddr).ok_or(VmError::InvalidAddress)?;
        let segment = self.segment(kind).ok_or(VmError::InvalidAddress)?;
        Ok(PteIndex {
            segment: kind,
            index: segment.index_of(vaddr),
        })
    }

    pub fn pte(&self, at: PteIndex) -> Option<&Pte> {
        self.segment(at.segment)?.pages.get(at.index)
    }

    pub fn pte_mut(&mut self, at: PteIndex) -> Option<&mut Pte> {
        self.segment_mut(at.segment)?.pages.get_mut(at.index)
    }

    /// The entry for `vaddr`, plus the kind of miss if it is not resident
    pub fn lookup(&mut self, vaddr: VirtAddr) -> VmResult<(&mut Pte, Option<MissKind>)> {
        let at = self.locate(vaddr)?;
        let pte = self
            .pte_mut(at)
            .ok_or(VmError::Inconsistent("located page outside its segment"))?;
        let miss = match (pte.is_valid(), at.segment) {
            (true, _) => None,
            (false, SegmentKind::Stack) => Some(MissKind::StackFault),
            (false, _) => Some(MissKind::PageFault),
        };
        Ok((pte, miss))
    }

    /// Picks a resident page to evict on behalf of a request for `usage`.
    ///
    /// Segments are scanned in a fixed preference order, each from its first
    /// page; the first valid, modified page whose frame passes `eligible`
    /// wins. Clean pages are never chosen since they have no swap copy to
    /// fall back on. Each page is looked at once, so the scan always ends.
    pub fn select_victim<F>(&self, usage: FrameUse, eligible: F) -> Option<PteIndex>
    where
        F: Fn(PhysAddr) -> bool,
    {
        let order = match usage {
            FrameUse::Stack => [SegmentKind::Stack, SegmentKind::Data, SegmentKind::Text],
            FrameUse::Kernel | FrameUse::Text | FrameUse::Data => {
                [SegmentKind::Data, SegmentKind::Text, SegmentKind::Stack]
            }
        };

        order.into_iter().find_map(|kind| {
            let segment = self.segment(kind)?;
            segment
                .pages
                .iter()
                .position(|pte| {
                    pte.is_modified() && pte.frame().map_or(false, |frame| eligible(frame))
                })
                .map(|index| PteIndex {
                    segment: kind,
                    index,
                })
        })
    }

    /// Frames currently bound to some page of this table
    pub fn resident_frames(&self) -> Vec<PhysAddr> {
        self.segments()
            .flat_map(|segment| segment.pages.iter())
            .filter_map(Pte::frame)
            .collect()
    }
}
