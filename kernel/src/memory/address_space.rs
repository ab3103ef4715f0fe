//! Per-process address spaces.

use crate::{
    constants::memory::FRAME_SIZE,
    filesys::{FileSystem, OpenFlags, Vnode, VnodeRef},
    memory::{
        coremap::Requester,
        error::{VmError, VmResult},
        page_table::{MissKind, PageTable, Permissions, Pte, PteIndex, SegmentKind},
        stats::Stat,
        Vm,
    },
    processes::{loader::ExecutableImage, Pid},
};
use x86_64::VirtAddr;

/// The page table of one process together with the executable backing it
pub struct AddressSpace {
    pid: Pid,
    pages: PageTable,
    image: ExecutableImage,
    executable: VnodeRef,
}

impl AddressSpace {
    /// Opens the executable at `path` and reads its program headers.
    ///
    /// No regions are defined yet; see [`AddressSpace::load_executable`].
    pub fn create(fs: &dyn FileSystem, path: &str, pid: Pid) -> VmResult<Self> {
        let executable = fs.open(path, OpenFlags::new())?;
        let image = match ExecutableImage::parse(&*executable) {
            Ok(image) => image,
            Err(err) => {
                fs.close(executable);
                return Err(err);
            }
        };
        log::debug!(
            "pid {}: {} with {} loadable segments, entry {:?}",
            pid,
            path,
            image.segments.len(),
            image.entry
        );

        Ok(Self {
            pid,
            pages: PageTable::new(),
            image,
            executable,
        })
    }

    /// Defines one region per loadable segment and returns the entry point
    pub fn load_executable(&mut self) -> VmResult<VirtAddr> {
        for i in 0..self.image.segments.len() {
            let header = self.image.segments[i];
            self.define_region(header.vaddr, header.memsz, header.perms)?;
        }
        Ok(self.image.entry)
    }

    pub fn define_region(
        &mut self,
        vaddr: VirtAddr,
        size: u64,
        perms: Permissions,
    ) -> VmResult<SegmentKind> {
        self.pages.define_segment(vaddr, size, perms)
    }

    /// Sets up the user stack; returns the initial stack pointer
    pub fn define_stack(&mut self) -> VirtAddr {
        self.pages.define_stack()
    }

    pub fn classify(&self, vaddr: VirtAddr) -> Option<SegmentKind> {
        self.pages.classify(vaddr)
    }

    pub fn lookup(&mut self, vaddr: VirtAddr) -> VmResult<(&mut Pte, Option<MissKind>)> {
        self.pages.lookup(vaddr)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pages(&self) -> &PageTable {
        &self.pages
    }

    pub(crate) fn pages_mut(&mut self) -> &mut PageTable {
        &mut self.pages
    }

    pub fn image(&self) -> &ExecutableImage {
        &self.image
    }

    pub fn executable(&self) -> &dyn Vnode {
        &*self.executable
    }

    /// This process as the requester of a frame, so eviction can take from it
    pub(crate) fn requester(&mut self) -> Requester<'_> {
        Requester {
            pid: self.pid,
            pages: &mut self.pages,
        }
    }

    /// Switches the TLB over to this address space
    pub fn activate(&self, vm: &Vm) {
        vm.tlb.invalidate_all();
        vm.stats.inc(Stat::TlbInvalidate);
    }

    /// Tears the address space down; returns how many frames were released.
    ///
    /// Every resident frame goes back to the coremap zeroed, under one hold of
    /// the coremap lock, and the executable is closed.
    pub fn destroy(self, vm: &Vm, fs: &dyn FileSystem) -> usize {
        vm.tlb.invalidate_all();
        let frames = self.pages.resident_frames();
        let released = vm.coremap.release(&frames);
        if released != frames.len() {
            log::error!(
                "pid {}: released {} of {} resident frames",
                self.pid,
                released,
                frames.len()
            );
        }
        log::debug!("pid {}: address space destroyed", self.pid);
        fs.close(self.executable);
        released
    }

    /// Copies this address space for `child`.
    ///
    /// Resident pages are copied eagerly into fresh frames with their flags.
    /// Pages that are only in swap are not carried over: the child sees them
    /// as never loaded.
    pub fn duplicate(&self, vm: &Vm, fs: &dyn FileSystem, child: Pid) -> VmResult<AddressSpace> {
        let mut pages = self.pages.clone();
        for kind in [SegmentKind::Text, SegmentKind::Data, SegmentKind::Stack] {
            let count = pages.segment(kind).map_or(0, |segment| segment.page_count());
            for index in 0..count {
                if let Some(pte) = pages.pte_mut(PteIndex {
                    segment: kind,
                    index,
                }) {
                    pte.clear();
                }
            }
        }

        let mut copy = AddressSpace {
            pid: child,
            pages,
            image: self.image.clone(),
            executable: self.executable.clone(),
        };

        if let Err(err) = self.copy_resident_pages(vm, &mut copy) {
            copy.destroy(vm, fs);
            return Err(err);
        }
        log::debug!("pid {}: duplicated into pid {}", self.pid, child);
        Ok(copy)
    }

    fn copy_resident_pages(&self, vm: &Vm, copy: &mut AddressSpace) -> VmResult<()> {
        for segment in self.pages.segments() {
            let kind = segment.kind();
            for (index, pte) in segment.pages().iter().enumerate() {
                let at = PteIndex {
                    segment: kind,
                    index,
                };
                let Some(frame) = pte.frame() else {
                    if pte.in_swap() {
                        log::warn!(
                            "pid {}: swapped page {:?} not copied to pid {}",
                            self.pid,
                            pte.page(),
                            copy.pid
                        );
                    }
                    continue;
                };

                let new_frame = vm.get_frames(1, true, kind.usage(), Some(copy.requester()))?;
                vm.memory().copy(frame, new_frame, FRAME_SIZE);

                let target = copy
                    .pages
                    .pte_mut(at)
                    .ok_or(VmError::Inconsistent("copied page table lost a page"))?;
                target.bind(new_frame);
                target.insert_flags(pte.flags());
            }
        }
        Ok(())
    }
}
