//! On-demand ELF loading.
//!
//! Program headers are parsed once when an address space is created; page
//! contents are only read from the executable when a page is first touched.

use crate::{
    constants::memory::{FRAME_SIZE, PAGE_SIZE},
    filesys::{FsError, Vnode},
    memory::{
        address_space::AddressSpace,
        error::{VmError, VmResult},
        fault::install_mapping,
        page_table::{Permissions, PteFlags, SegmentKind},
        stats::Stat,
        Vm,
    },
};
use alloc::{vec, vec::Vec};
use x86_64::{PhysAddr, VirtAddr};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u32 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

const PT_NULL: u32 = 0;
const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;
const PT_PHDR: u32 = 6;
const PT_GNU_STACK: u32 = 0x6474_e551;

/// A loadable segment as described by its program header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub vaddr: VirtAddr,
    pub offset: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub perms: Permissions,
}

impl ProgramHeader {
    pub fn is_writable(&self) -> bool {
        self.perms.contains(Permissions::WRITE)
    }

    /// Whether any byte of the page at `page` belongs to this segment
    fn overlaps_page(&self, page: VirtAddr) -> bool {
        let start = self.vaddr.as_u64();
        let end = start + self.memsz;
        page.as_u64() < end && start < page.as_u64() + PAGE_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableImage {
    pub entry: VirtAddr,
    pub segments: Vec<ProgramHeader>,
}

fn read_exact(file: &dyn Vnode, offset: u64, buf: &mut [u8]) -> VmResult<()> {
    match file.read_at(offset, buf) {
        Ok(n) if n == buf.len() => Ok(()),
        Ok(_) => Err(VmError::NotExecutable),
        Err(err) => Err(VmError::Io(err)),
    }
}

fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

impl ExecutableImage {
    /// Reads and validates the ELF header and program headers of `file`
    pub fn parse(file: &dyn Vnode) -> VmResult<Self> {
        let mut ehdr = [0u8; EHDR_SIZE];
        read_exact(file, 0, &mut ehdr)?;

        if ehdr[..4] != ELF_MAGIC
            || ehdr[4] != ELFCLASS64
            || ehdr[5] != ELFDATA2LSB
            || u32::from(ehdr[6]) != EV_CURRENT
            || u16_at(&ehdr, 16) != ET_EXEC
            || u16_at(&ehdr, 18) != EM_X86_64
            || u32_at(&ehdr, 20) != EV_CURRENT
            || usize::from(u16_at(&ehdr, 54)) != PHDR_SIZE
        {
            return Err(VmError::NotExecutable);
        }

        let entry =
            VirtAddr::try_new(u64_at(&ehdr, 24)).map_err(|_| VmError::NotExecutable)?;
        let phoff = u64_at(&ehdr, 32);
        let phnum = u16_at(&ehdr, 56);

        let mut segments = Vec::new();
        let mut phdr = [0u8; PHDR_SIZE];
        for i in 0..u64::from(phnum) {
            read_exact(file, phoff + i * PHDR_SIZE as u64, &mut phdr)?;
            match u32_at(&phdr, 0) {
                PT_NULL | PT_NOTE | PT_PHDR | PT_GNU_STACK => continue,
                PT_LOAD => {}
                other => {
                    log::warn!("Unsupported program header type {:#x}", other);
                    return Err(VmError::NotExecutable);
                }
            }

            let vaddr =
                VirtAddr::try_new(u64_at(&phdr, 16)).map_err(|_| VmError::NotExecutable)?;
            let memsz = u64_at(&phdr, 40);
            let mut filesz = u64_at(&phdr, 32);
            if filesz > memsz {
                log::warn!(
                    "Segment at {:?}: file size {:#x} exceeds memory size {:#x}",
                    vaddr,
                    filesz,
                    memsz
                );
                filesz = memsz;
            }

            segments.push(ProgramHeader {
                vaddr,
                offset: u64_at(&phdr, 8),
                filesz,
                memsz,
                perms: Permissions::from_bits_truncate(u32_at(&phdr, 4)),
            });
        }

        Ok(Self { entry, segments })
    }

    pub fn segment_containing(&self, page: VirtAddr) -> Option<&ProgramHeader> {
        self.segments
            .iter()
            .find(|header| header.overlaps_page(page))
    }
}

/// Zeroes `frame` and copies in the part of `page` backed by the file.
///
/// Returns whether anything was read; a page wholly past `filesz` is left as
/// zeros without touching the file.
fn fill_page(
    vm: &Vm,
    file: &dyn Vnode,
    header: &ProgramHeader,
    page: VirtAddr,
    frame: PhysAddr,
) -> VmResult<bool> {
    vm.memory().zero(frame, FRAME_SIZE);

    let file_end = header.vaddr + header.filesz;
    let start = page.max(header.vaddr);
    let end = (page + PAGE_SIZE).min(file_end);
    if start >= end {
        return Ok(false);
    }

    let mut buf = vec![0u8; (end - start) as usize];
    let offset = header.offset + (start - header.vaddr);
    let read = file.read_at(offset, &mut buf)?;
    if read != buf.len() {
        return Err(VmError::Io(FsError::IOError));
    }
    vm.memory().write(frame + (start - page), &buf);
    Ok(true)
}

/// Populates a text or data page from the executable and maps it.
///
/// The page is marked MODIFIED, so from here on it is only ever evicted to
/// swap. Pages of read-only segments are mapped clean, so a write to them
/// faults.
pub fn load_segment_page(vm: &Vm, space: &mut AddressSpace, vaddr: VirtAddr) -> VmResult<()> {
    let page = vaddr.align_down(PAGE_SIZE);
    let at = space.pages().locate(page)?;
    if at.segment == SegmentKind::Stack {
        return Err(VmError::Inconsistent("loading a stack page from the image"));
    }
    let header = *space
        .image()
        .segment_containing(page)
        .ok_or(VmError::NotExecutable)?;

    let frame = vm.get_frames(1, true, at.segment.usage(), Some(space.requester()))?;
    let from_file = match fill_page(vm, space.executable(), &header, page, frame) {
        Ok(from_file) => from_file,
        Err(err) => {
            if let Err(free_err) = vm.free_frames(frame) {
                log::error!("Dropping frame after failed load: {}", free_err);
            }
            return Err(err);
        }
    };
    if from_file {
        vm.stats.inc(Stat::ElfFileRead);
        vm.stats.inc(Stat::PageFaultDisk);
    } else {
        vm.stats.inc(Stat::PageFaultZero);
    }

    let pte = space
        .pages_mut()
        .pte_mut(at)
        .ok_or(VmError::Inconsistent("loaded page outside its segment"))?;
    pte.bind(frame);
    pte.insert_flags(PteFlags::MODIFIED);
    if header.is_writable() {
        pte.insert_flags(PteFlags::DIRTY);
    }
    log::trace!("Loaded {:?} into {:?}", page, frame);
    install_mapping(vm, pte)?;
    Ok(())
}

/// Handles the first write to a resident page that was never modified.
///
/// Stack pages just become writable. Text and data pages are refreshed from
/// the executable into the frame they already own, then marked MODIFIED;
/// they stay read-only unless their segment is writable.
pub fn copy_on_write(vm: &Vm, space: &mut AddressSpace, vaddr: VirtAddr) -> VmResult<()> {
    let page = vaddr.align_down(PAGE_SIZE);
    let at = space.pages().locate(page)?;
    let pte = space
        .pages()
        .pte(at)
        .ok_or(VmError::Inconsistent("faulting page outside its segment"))?;
    let frame = pte
        .frame()
        .ok_or(VmError::Inconsistent("copy-on-write of a page that is not resident"))?;

    let writable = match at.segment {
        SegmentKind::Stack => true,
        SegmentKind::Text | SegmentKind::Data => {
            let header = space
                .image()
                .segment_containing(page)
                .ok_or(VmError::NotExecutable)?;
            fill_page(vm, space.executable(), header, page, frame)?;
            header.is_writable()
        }
    };

    let pte = space
        .pages_mut()
        .pte_mut(at)
        .ok_or(VmError::Inconsistent("faulting page outside its segment"))?;
    pte.insert_flags(PteFlags::MODIFIED);
    if writable {
        pte.insert_flags(PteFlags::DIRTY);
    }
    install_mapping(vm, pte)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filesys::memfs::MemFile,
        memory::testing::{elf_image, Rig, Seg},
    };

    #[test]
    fn test_parse_skips_auxiliary_headers() {
        let bytes = elf_image(
            0x1000,
            &[
                Seg::load(0x1000, Permissions::READ | Permissions::EXECUTE, &[0x90; 16]),
                Seg::of_type(PT_NOTE),
                Seg::of_type(PT_GNU_STACK),
                Seg::load(0x2000, Permissions::READ | Permissions::WRITE, &[1, 2]).memsz(0x20),
            ],
        );
        let image = ExecutableImage::parse(&MemFile::with_contents(bytes)).unwrap();
        assert_eq!(image.entry, VirtAddr::new(0x1000));
        assert_eq!(image.segments.len(), 2);
        assert_eq!(image.segments[1].filesz, 2);
        assert_eq!(image.segments[1].memsz, 0x20);
        assert!(image.segments[1].is_writable());
        assert!(!image.segments[0].is_writable());
    }

    #[test]
    fn test_parse_rejects_bad_images() {
        let mut bytes = elf_image(0x1000, &[Seg::load(0x1000, Permissions::READ, &[0])]);
        bytes[4] = 1; // 32-bit class
        assert_eq!(
            ExecutableImage::parse(&MemFile::with_contents(bytes)),
            Err(VmError::NotExecutable)
        );

        let bytes = elf_image(0x1000, &[Seg::of_type(2)]); // PT_DYNAMIC
        assert_eq!(
            ExecutableImage::parse(&MemFile::with_contents(bytes)),
            Err(VmError::NotExecutable)
        );

        assert_eq!(
            ExecutableImage::parse(&MemFile::with_contents(vec![0x7f, b'E'])),
            Err(VmError::NotExecutable)
        );
    }

    #[test]
    fn test_oversized_filesz_is_clamped() {
        let bytes = elf_image(
            0x1000,
            &[Seg::load(0x1000, Permissions::READ, &[7; 64]).memsz(16)],
        );
        let image = ExecutableImage::parse(&MemFile::with_contents(bytes)).unwrap();
        assert_eq!(image.segments[0].filesz, 16);
    }

    #[test]
    fn test_load_zero_fills_tail() {
        let rig = Rig::new(8);
        let data = [0xABu8; 100];
        let mut space = rig.spawn(&[
            Seg::load(0x1000, Permissions::READ | Permissions::EXECUTE, &[0x90; 8]),
            Seg::load(0x2000, Permissions::READ | Permissions::WRITE, &data).memsz(0x2000),
        ]);

        load_segment_page(&rig.vm, &mut space, VirtAddr::new(0x2010)).unwrap();
        let pte = *space.lookup(VirtAddr::new(0x2000)).unwrap().0;
        assert!(pte.is_valid() && pte.is_modified() && pte.is_dirty());

        let mut page = vec![0xFFu8; FRAME_SIZE];
        rig.vm.memory().read(pte.frame().unwrap(), &mut page);
        assert_eq!(&page[..100], &data[..]);
        assert!(page[100..].iter().all(|&b| b == 0));
        assert_eq!(rig.vm.stats.get(Stat::ElfFileRead), 1);

        // second page lies wholly past the file bytes
        load_segment_page(&rig.vm, &mut space, VirtAddr::new(0x3000)).unwrap();
        assert_eq!(rig.vm.stats.get(Stat::ElfFileRead), 1);
        assert_eq!(rig.vm.stats.get(Stat::PageFaultZero), 1);
    }

    #[test]
    fn test_text_page_maps_read_only() {
        let rig = Rig::new(8);
        let mut space = rig.spawn(&[Seg::load(
            0x1000,
            Permissions::READ | Permissions::EXECUTE,
            &[0xCC; 32],
        )]);

        load_segment_page(&rig.vm, &mut space, VirtAddr::new(0x1004)).unwrap();
        let entry = rig.vm.tlb.translate(VirtAddr::new(0x1000)).unwrap();
        assert!(!entry.is_writable());
        let pte = *space.lookup(VirtAddr::new(0x1000)).unwrap().0;
        assert!(pte.is_modified() && !pte.is_dirty());
    }
}
