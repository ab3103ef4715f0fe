//! Physical frame allocator.
//!
//! One [`CoremapEntry`] per frame of managed RAM, scanned first-fit from
//! index 0. When no run is free a single-frame request from a user process is
//! satisfied by evicting one of that process's own pages to swap.

use crate::{
    constants::memory::FRAME_SIZE,
    memory::{
        error::{VmError, VmResult},
        page_table::{PageTable, Pte},
        phys::PhysMemory,
    },
    processes::Pid,
};
use alloc::{boxed::Box, vec::Vec};
use spin::{Mutex, Once};
use x86_64::PhysAddr;

/// What a frame is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameUse {
    Kernel,
    Text,
    Data,
    Stack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameIndex(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoremapEntry {
    pub paddr: PhysAddr,
    pub occupied: bool,
    /// Frames left in the allocation, counting this one
    pub run_length: usize,
    /// Process the frame was handed to; not kept alive by this
    pub owner: Option<Pid>,
    pub swappable: bool,
    pub usage: Option<FrameUse>,
}

impl CoremapEntry {
    fn free(paddr: PhysAddr) -> Self {
        Self {
            paddr,
            occupied: false,
            run_length: 0,
            owner: None,
            swappable: false,
            usage: None,
        }
    }
}

/// A process asking for a frame, and the page table eviction may take from
pub struct Requester<'a> {
    pub pid: Pid,
    pub pages: &'a mut PageTable,
}

struct FrameTable {
    base: PhysAddr,
    entries: Vec<CoremapEntry>,
}

impl FrameTable {
    fn new(base: PhysAddr, frames: usize) -> Self {
        let entries = (0..frames)
            .map(|i| CoremapEntry::free(base + (i * FRAME_SIZE) as u64))
            .collect();
        Self { base, entries }
    }

    fn index_of(&self, paddr: PhysAddr) -> Option<usize> {
        if paddr < self.base || paddr.as_u64() % FRAME_SIZE as u64 != 0 {
            return None;
        }
        let index = ((paddr - self.base) / FRAME_SIZE as u64) as usize;
        (index < self.entries.len()).then_some(index)
    }

    fn paddr_of(&self, index: usize) -> PhysAddr {
        self.entries[index].paddr
    }

    /// Start of the lowest run of `n` free frames
    fn find_run(&self, n: usize) -> Option<usize> {
        let mut run = 0;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.occupied {
                run = 0;
                continue;
            }
            run += 1;
            if run == n {
                return Some(i + 1 - n);
            }
        }
        None
    }

    fn claim(
        &mut self,
        start: usize,
        n: usize,
        owner: Option<Pid>,
        swappable: bool,
        usage: FrameUse,
    ) {
        for (offset, entry) in self.entries[start..start + n].iter_mut().enumerate() {
            entry.occupied = true;
            entry.run_length = n - offset;
            entry.owner = owner;
            entry.swappable = swappable;
            entry.usage = Some(usage);
        }
    }

    /// Frees the run starting at `index`; returns the frames released
    fn release_run(&mut self, index: usize) -> VmResult<Run> {
        let entry = self.entries[index];
        if !entry.occupied || entry.run_length == 0 {
            return Err(VmError::Inconsistent("freeing a frame that is not allocated"));
        }
        if !self.is_run_head(index) {
            return Err(VmError::Inconsistent("freeing from the middle of a run"));
        }
        let end = (index + entry.run_length).min(self.entries.len());
        for i in index..end {
            self.entries[i] = CoremapEntry::free(self.entries[i].paddr);
        }
        Ok(Run {
            start: index,
            len: end - index,
        })
    }

    /// Whether the occupied frame at `index` starts its allocation.
    ///
    /// Run lengths count down by one across a run, so a frame continues the
    /// run before it exactly when its predecessor is occupied with a run
    /// length one greater.
    fn is_run_head(&self, index: usize) -> bool {
        let run_length = self.entries[index].run_length;
        index == 0 || {
            let prev = &self.entries[index - 1];
            !prev.occupied || prev.run_length != run_length + 1
        }
    }

    fn is_evictable(&self, paddr: PhysAddr, pid: Pid) -> bool {
        self.index_of(paddr).map_or(false, |i| {
            let entry = &self.entries[i];
            entry.occupied && entry.swappable && entry.owner == Some(pid)
        })
    }
}

struct Run {
    start: usize,
    len: usize,
}

pub struct Coremap {
    memory: Box<dyn PhysMemory>,
    table: Once<Mutex<FrameTable>>,
}

impl Coremap {
    pub fn new(memory: Box<dyn PhysMemory>) -> Self {
        Self {
            memory,
            table: Once::new(),
        }
    }

    /// The frame table, built on first use to match the installed RAM
    fn table(&self) -> &Mutex<FrameTable> {
        self.table.call_once(|| {
            let table = FrameTable::new(self.memory.base(), self.memory.frame_count());
            log::info!(
                "Coremap: {} frames at {:?}",
                table.entries.len(),
                table.base
            );
            Mutex::new(table)
        })
    }

    pub fn bootstrap(&self) {
        self.table();
    }

    pub fn memory(&self) -> &dyn PhysMemory {
        self.memory.as_ref()
    }

    /// Allocates `n` contiguous frames.
    ///
    /// Without a free run, a single-frame request that names a `requester`
    /// evicts one of the requester's swappable pages: the frame is reassigned
    /// under the table lock, the lock is dropped, and `evict` writes the old
    /// page out. If `evict` fails the frame goes back to its previous owner
    /// and the allocation fails.
    pub fn allocate<F>(
        &self,
        n: usize,
        swappable: bool,
        usage: FrameUse,
        requester: Option<Requester<'_>>,
        evict: F,
    ) -> VmResult<PhysAddr>
    where
        F: FnOnce(&mut Pte) -> VmResult<()>,
    {
        if n == 0 {
            return Err(VmError::Inconsistent("zero-frame allocation"));
        }

        let owner = requester.as_ref().map(|r| r.pid);
        let mut table = self.table().lock();
        if let Some(start) = table.find_run(n) {
            table.claim(start, n, owner, swappable, usage);
            return Ok(table.paddr_of(start));
        }

        let Some(Requester { pid, pages }) = requester else {
            return Err(VmError::OutOfMemory);
        };
        if n != 1 {
            return Err(VmError::OutOfMemory);
        }

        let victim = pages
            .select_victim(usage, |frame| table.is_evictable(frame, pid))
            .ok_or(VmError::OutOfMemory)?;
        let pte = pages
            .pte_mut(victim)
            .ok_or(VmError::Inconsistent("victim outside its segment"))?;
        let frame = pte
            .frame()
            .ok_or(VmError::Inconsistent("victim is not resident"))?;
        let index = table
            .index_of(frame)
            .ok_or(VmError::Inconsistent("victim frame is not managed"))?;

        let previous = table.entries[index];
        table.claim(index, 1, Some(pid), swappable, usage);
        drop(table);

        log::debug!(
            "Evicting {:?} from {:?} for pid {}",
            pte.page(),
            frame,
            pid
        );
        if let Err(err) = evict(pte) {
            self.table().lock().entries[index] = previous;
            return Err(err);
        }
        Ok(frame)
    }

    /// Frees the allocation starting at `paddr` and zeroes its frames
    pub fn free(&self, paddr: PhysAddr) -> VmResult<usize> {
        let mut table = self.table().lock();
        let index = table
            .index_of(paddr)
            .ok_or(VmError::Inconsistent("freeing an unmanaged frame"))?;
        let run = table.release_run(index)?;
        let start = table.paddr_of(run.start);
        self.memory.zero(start, run.len * FRAME_SIZE);
        Ok(run.len)
    }

    /// Frees every frame in `frames` under one hold of the table lock
    pub fn release(&self, frames: &[PhysAddr]) -> usize {
        let mut table = self.table().lock();
        let mut released = 0;
        for &frame in frames {
            let run = match table.index_of(frame).map(|i| table.release_run(i)) {
                Some(Ok(run)) => run,
                Some(Err(err)) => {
                    log::error!("Releasing {:?}: {}", frame, err);
                    continue;
                }
                None => {
                    log::error!("Releasing unmanaged frame {:?}", frame);
                    continue;
                }
            };
            self.memory
                .zero(table.paddr_of(run.start), run.len * FRAME_SIZE);
            released += run.len;
        }
        released
    }

    pub fn index_of(&self, paddr: PhysAddr) -> Option<FrameIndex> {
        self.table().lock().index_of(paddr).map(FrameIndex)
    }

    pub fn entry(&self, index: FrameIndex) -> Option<CoremapEntry> {
        self.table().lock().entries.get(index.0).copied()
    }

    pub fn frame_count(&self) -> usize {
        self.table().lock().entries.len()
    }

    pub fn free_count(&self) -> usize {
        self.table()
            .lock()
            .entries
            .iter()
            .filter(|entry| !entry.occupied)
            .count()
    }

    /// Logs every occupied frame
    pub fn dump(&self) {
        let table = self.table().lock();
        log::debug!(
            "Coremap: {} of {} frames free",
            table.entries.iter().filter(|e| !e.occupied).count(),
            table.entries.len()
        );
        for (i, entry) in table.entries.iter().enumerate() {
            if entry.occupied {
                log::debug!(
                    "  [{}] {:?} run={} owner={:?} swappable={} {:?}",
                    i,
                    entry.paddr,
                    entry.run_length,
                    entry.owner,
                    entry.swappable,
                    entry.usage
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        page_table::{Permissions, PteFlags},
        phys::RamMemory,
    };
    use x86_64::VirtAddr;

    const BASE: u64 = 0x10_0000;

    fn coremap(frames: usize) -> Coremap {
        Coremap::new(Box::new(RamMemory::new(PhysAddr::new(BASE), frames)))
    }

    fn frame(i: u64) -> PhysAddr {
        PhysAddr::new(BASE + i * FRAME_SIZE as u64)
    }

    fn no_evict(_: &mut Pte) -> VmResult<()> {
        panic!("eviction not expected")
    }

    fn kernel(map: &Coremap, n: usize) -> VmResult<PhysAddr> {
        map.allocate(n, false, FrameUse::Kernel, None, no_evict)
    }

    #[test]
    fn test_first_fit_takes_lowest_run() {
        let map = coremap(4);
        for _ in 0..4 {
            kernel(&map, 1).unwrap();
        }
        map.free(frame(0)).unwrap();
        map.free(frame(1)).unwrap();
        map.free(frame(3)).unwrap();

        assert_eq!(kernel(&map, 2), Ok(frame(0)));
        assert_eq!(kernel(&map, 1), Ok(frame(3)));
    }

    #[test]
    fn test_run_length_stamped_and_freed() {
        let map = coremap(5);
        kernel(&map, 1).unwrap();
        let run = kernel(&map, 3).unwrap();
        assert_eq!(run, frame(1));

        let lengths: Vec<usize> = (1..4)
            .map(|i| map.entry(FrameIndex(i)).unwrap().run_length)
            .collect();
        assert_eq!(lengths, [3, 2, 1]);
        assert_eq!(map.free_count(), 1);

        assert_eq!(map.free(run), Ok(3));
        assert_eq!(map.free_count(), 4);
        assert!(!map.entry(FrameIndex(2)).unwrap().occupied);
        assert!(matches!(map.free(run), Err(VmError::Inconsistent(_))));
    }

    #[test]
    fn test_free_inside_run_is_refused() {
        let map = coremap(4);
        let run = kernel(&map, 3).unwrap();
        assert!(matches!(map.free(frame(1)), Err(VmError::Inconsistent(_))));
        assert!(matches!(map.free(frame(2)), Err(VmError::Inconsistent(_))));
        assert_eq!(map.free_count(), 1);

        let other = kernel(&map, 1).unwrap();
        assert_eq!(other, frame(3));
        map.memory().write(other, &[0xAB; 8]);
        assert_eq!(map.free(run), Ok(3));

        let entry = map.entry(FrameIndex(3)).unwrap();
        assert!(entry.occupied);
        let mut bytes = [0u8; 8];
        map.memory().read(other, &mut bytes);
        assert_eq!(bytes, [0xAB; 8]);
    }

    #[test]
    fn test_adjacent_runs_free_independently() {
        let map = coremap(4);
        let first = kernel(&map, 2).unwrap();
        let second = kernel(&map, 1).unwrap();
        let third = kernel(&map, 1).unwrap();
        assert_eq!(map.free(second), Ok(1));
        assert_eq!(map.free(third), Ok(1));
        assert_eq!(map.free(first), Ok(2));
        assert_eq!(map.free_count(), 4);
    }

    #[test]
    fn test_free_zeroes_frames() {
        let map = coremap(2);
        let paddr = kernel(&map, 2).unwrap();
        map.memory().write(paddr + 4096u64, &[0xAA; 16]);
        map.free(paddr).unwrap();

        let mut buf = [0xFFu8; 16];
        map.memory().read(paddr + 4096u64, &mut buf);
        assert_eq!(buf, [0; 16]);
    }

    #[test]
    fn test_exhaustion_without_requester_fails() {
        let map = coremap(2);
        kernel(&map, 2).unwrap();
        assert_eq!(kernel(&map, 1), Err(VmError::OutOfMemory));
        assert_eq!(kernel(&map, 0), Err(VmError::Inconsistent("zero-frame allocation")));
    }

    fn owned_table(map: &Coremap, pid: Pid, swappable: bool) -> PageTable {
        let mut pages = PageTable::new();
        pages
            .define_segment(
                VirtAddr::new(0x1000),
                0x2000,
                Permissions::READ | Permissions::WRITE,
            )
            .unwrap();
        for i in 0..2u64 {
            let paddr = map
                .allocate(1, swappable, FrameUse::Text, None, no_evict)
                .unwrap();
            let at = pages.locate(VirtAddr::new(0x1000 + i * 0x1000)).unwrap();
            let pte = pages.pte_mut(at).unwrap();
            pte.bind(paddr);
            pte.insert_flags(PteFlags::MODIFIED);
        }
        // frames handed out before the owner was known
        let mut table = map.table().lock();
        for entry in table.entries.iter_mut() {
            entry.owner = Some(pid);
        }
        drop(table);
        pages
    }

    #[test]
    fn test_nothing_swappable_fails() {
        let map = coremap(2);
        let mut pages = owned_table(&map, 7, false);
        let result = map.allocate(
            1,
            true,
            FrameUse::Text,
            Some(Requester { pid: 7, pages: &mut pages }),
            no_evict,
        );
        assert_eq!(result, Err(VmError::OutOfMemory));
    }

    #[test]
    fn test_eviction_reassigns_frame() {
        let map = coremap(2);
        let mut pages = owned_table(&map, 7, true);
        let mut evicted = None;
        let result = map.allocate(
            1,
            true,
            FrameUse::Data,
            Some(Requester { pid: 7, pages: &mut pages }),
            |pte| {
                evicted = Some(pte.page());
                pte.swap_out(0);
                Ok(())
            },
        );
        assert_eq!(result, Ok(frame(0)));
        assert_eq!(evicted, Some(VirtAddr::new(0x1000)));

        let entry = map.entry(FrameIndex(0)).unwrap();
        assert_eq!(entry.usage, Some(FrameUse::Data));
        assert_eq!(entry.owner, Some(7));
    }

    #[test]
    fn test_table_unlocked_during_eviction() {
        let map = coremap(2);
        let mut pages = owned_table(&map, 7, true);
        let mut seen = None;
        let result = map.allocate(
            1,
            true,
            FrameUse::Stack,
            Some(Requester { pid: 7, pages: &mut pages }),
            |pte| {
                // another allocation can run while the page is written out
                assert_eq!(kernel(&map, 1), Err(VmError::OutOfMemory));
                assert_eq!(map.free_count(), 0);
                seen = map.entry(FrameIndex(0));
                pte.swap_out(0);
                Ok(())
            },
        );
        assert_eq!(result, Ok(frame(0)));

        let entry = seen.unwrap();
        assert_eq!(entry.owner, Some(7));
        assert_eq!(entry.usage, Some(FrameUse::Stack));
        assert_eq!(entry.run_length, 1);
    }

    #[test]
    fn test_failed_eviction_restores_frame() {
        let map = coremap(2);
        let mut pages = owned_table(&map, 7, true);
        let result = map.allocate(
            1,
            true,
            FrameUse::Stack,
            Some(Requester { pid: 7, pages: &mut pages }),
            |_| Err(VmError::SwapFull),
        );
        assert_eq!(result, Err(VmError::SwapFull));
        assert_eq!(map.entry(FrameIndex(0)).unwrap().usage, Some(FrameUse::Text));
        assert!(pages.pte(pages.locate(VirtAddr::new(0x1000)).unwrap()).unwrap().is_valid());
    }

    #[test]
    fn test_other_owner_not_evicted() {
        let map = coremap(2);
        let mut pages = owned_table(&map, 7, true);
        let result = map.allocate(
            1,
            true,
            FrameUse::Data,
            Some(Requester { pid: 8, pages: &mut pages }),
            no_evict,
        );
        assert_eq!(result, Err(VmError::OutOfMemory));
    }
}
