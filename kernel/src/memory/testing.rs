//! Helpers shared by the VM unit tests: a synthesised ELF64 image and a VM
//! over simulated RAM with an in-memory swap file.

use crate::{
    filesys::{memfs::MemFs, FileSystem, OpenFlags},
    memory::{
        address_space::AddressSpace, page_table::Permissions, phys::RamMemory, swap::SwapStore,
        tlb::Tlb, Vm,
    },
    processes::Pid,
};
use alloc::{boxed::Box, format, vec, vec::Vec};
use core::cell::Cell;
use x86_64::PhysAddr;

pub(crate) const RAM_BASE: u64 = 0x10_0000;

const PT_LOAD: u32 = 1;

/// One program header of a test image
pub(crate) struct Seg {
    kind: u32,
    vaddr: u64,
    perms: Permissions,
    data: Vec<u8>,
    memsz: u64,
}

impl Seg {
    pub(crate) fn load(vaddr: u64, perms: Permissions, data: &[u8]) -> Self {
        Self {
            kind: PT_LOAD,
            vaddr,
            perms,
            data: data.to_vec(),
            memsz: data.len() as u64,
        }
    }

    pub(crate) fn of_type(kind: u32) -> Self {
        Self {
            kind,
            vaddr: 0,
            perms: Permissions::empty(),
            data: Vec::new(),
            memsz: 0,
        }
    }

    pub(crate) fn memsz(mut self, memsz: u64) -> Self {
        self.memsz = memsz;
        self
    }
}

/// A little-endian x86-64 ELF executable holding `segs`
pub(crate) fn elf_image(entry: u64, segs: &[Seg]) -> Vec<u8> {
    let phoff = 64usize;
    let mut offset = phoff + segs.len() * 56;
    let mut image = vec![0u8; offset];

    image[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    image[4] = 2; // 64-bit
    image[5] = 1; // little endian
    image[6] = 1;
    image[16..18].copy_from_slice(&2u16.to_le_bytes());
    image[18..20].copy_from_slice(&62u16.to_le_bytes());
    image[20..24].copy_from_slice(&1u32.to_le_bytes());
    image[24..32].copy_from_slice(&entry.to_le_bytes());
    image[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
    image[52..54].copy_from_slice(&64u16.to_le_bytes());
    image[54..56].copy_from_slice(&56u16.to_le_bytes());
    image[56..58].copy_from_slice(&(segs.len() as u16).to_le_bytes());

    for (i, seg) in segs.iter().enumerate() {
        let at = phoff + i * 56;
        let phdr = &mut image[at..at + 56];
        phdr[0..4].copy_from_slice(&seg.kind.to_le_bytes());
        phdr[4..8].copy_from_slice(&seg.perms.bits().to_le_bytes());
        phdr[8..16].copy_from_slice(&(offset as u64).to_le_bytes());
        phdr[16..24].copy_from_slice(&seg.vaddr.to_le_bytes());
        phdr[24..32].copy_from_slice(&seg.vaddr.to_le_bytes());
        phdr[32..40].copy_from_slice(&(seg.data.len() as u64).to_le_bytes());
        phdr[40..48].copy_from_slice(&seg.memsz.to_le_bytes());
        phdr[48..56].copy_from_slice(&0x1000u64.to_le_bytes());
        offset += seg.data.len();
    }
    for seg in segs {
        image.extend_from_slice(&seg.data);
    }
    image
}

/// A VM over `frames` frames of simulated RAM
pub(crate) struct Rig {
    pub vm: Vm,
    pub fs: MemFs,
    next_pid: Cell<Pid>,
}

impl Rig {
    pub(crate) fn new(frames: usize) -> Self {
        Self::with_swap_slots(frames, 16)
    }

    pub(crate) fn with_swap_slots(frames: usize, slots: usize) -> Self {
        let fs = MemFs::new();
        let swap_file = fs
            .open(
                "SWAPFILE",
                OpenFlags::new().with_flags(OpenFlags::O_RDWR | OpenFlags::O_CREAT),
            )
            .unwrap();
        let memory = RamMemory::new(PhysAddr::new(RAM_BASE), frames);
        let vm = Vm::new(Box::new(memory), SwapStore::with_slots(swap_file, slots))
            .with_tlb(Tlb::with_capacity(8));
        vm.bootstrap();
        Self {
            vm,
            fs,
            next_pid: Cell::new(1),
        }
    }

    /// Creates an address space for an image made of `segs`, with a stack
    pub(crate) fn spawn(&self, segs: &[Seg]) -> AddressSpace {
        let pid = self.next_pid.get();
        self.next_pid.set(pid + 1);

        let entry = segs.first().map_or(0x1000, |seg| seg.vaddr);
        let path = format!("bin/prog{}", pid);
        self.fs.insert(&path, elf_image(entry, segs)).unwrap();

        let mut space = AddressSpace::create(&self.fs, &path, pid).unwrap();
        space.load_executable().unwrap();
        space.define_stack();
        space
    }
}
