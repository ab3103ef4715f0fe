//! Byte access to physical frames.
//!
//! The coremap hands out physical addresses; everything that has to touch the
//! contents of a frame (zero-fill, swap I/O, image loading, fork) goes through
//! [`PhysMemory`] so the same code runs against real RAM through the
//! higher-half direct map and against a simulated RAM block in tests.

use crate::constants::memory::FRAME_SIZE;
use alloc::{vec, vec::Vec};
use core::ops::Range;
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

pub trait PhysMemory: Send + Sync {
    /// First managed physical address, frame aligned
    fn base(&self) -> PhysAddr;

    /// Number of frames starting at [`PhysMemory::base`]
    fn frame_count(&self) -> usize;

    fn read(&self, paddr: PhysAddr, buf: &mut [u8]);

    fn write(&self, paddr: PhysAddr, data: &[u8]);

    fn zero(&self, paddr: PhysAddr, len: usize);

    fn copy(&self, from: PhysAddr, to: PhysAddr, len: usize) {
        let mut buf = vec![0u8; len];
        self.read(from, &mut buf);
        self.write(to, &buf);
    }
}

/// Physical memory reached through the bootloader's higher-half direct map
pub struct HhdmMemory {
    offset: VirtAddr,
    base: PhysAddr,
    frames: usize,
}

impl HhdmMemory {
    /// # Safety
    ///
    /// `[base, base + frames * FRAME_SIZE)` must be usable RAM owned by nobody
    /// else, mapped writable at `offset + paddr` for the life of the kernel.
    pub unsafe fn new(offset: VirtAddr, base: PhysAddr, frames: usize) -> Self {
        Self {
            offset,
            base: base.align_up(FRAME_SIZE as u64),
            frames,
        }
    }

    fn ptr(&self, paddr: PhysAddr, len: usize) -> *mut u8 {
        let end = self.base + (self.frames * FRAME_SIZE) as u64;
        assert!(paddr >= self.base && paddr + len as u64 <= end);
        (self.offset + paddr.as_u64()).as_mut_ptr()
    }
}

impl PhysMemory for HhdmMemory {
    fn base(&self) -> PhysAddr {
        self.base
    }

    fn frame_count(&self) -> usize {
        self.frames
    }

    fn read(&self, paddr: PhysAddr, buf: &mut [u8]) {
        let src = self.ptr(paddr, buf.len());
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
    }

    fn write(&self, paddr: PhysAddr, data: &[u8]) {
        let dst = self.ptr(paddr, data.len());
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
    }

    fn zero(&self, paddr: PhysAddr, len: usize) {
        let dst = self.ptr(paddr, len);
        unsafe { core::ptr::write_bytes(dst, 0, len) };
    }

    fn copy(&self, from: PhysAddr, to: PhysAddr, len: usize) {
        let src = self.ptr(from, len);
        let dst = self.ptr(to, len);
        unsafe { core::ptr::copy(src, dst, len) };
    }
}

/// A block of simulated RAM, zeroed at creation
pub struct RamMemory {
    base: PhysAddr,
    bytes: Mutex<Vec<u8>>,
}

impl RamMemory {
    pub fn new(base: PhysAddr, frames: usize) -> Self {
        Self {
            base: base.align_up(FRAME_SIZE as u64),
            bytes: Mutex::new(vec![0; frames * FRAME_SIZE]),
        }
    }

    fn range(&self, paddr: PhysAddr, len: usize, size: usize) -> Range<usize> {
        assert!(paddr >= self.base, "{:?} below simulated RAM", paddr);
        let start = (paddr - self.base) as usize;
        assert!(start + len <= size, "{:?}+{:#x} past simulated RAM", paddr, len);
        start..start + len
    }
}

impl PhysMemory for RamMemory {
    fn base(&self) -> PhysAddr {
        self.base
    }

    fn frame_count(&self) -> usize {
        self.bytes.lock().len() / FRAME_SIZE
    }

    fn read(&self, paddr: PhysAddr, buf: &mut [u8]) {
        let bytes = self.bytes.lock();
        let range = self.range(paddr, buf.len(), bytes.len());
        buf.copy_from_slice(&bytes[range]);
    }

    fn write(&self, paddr: PhysAddr, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        let range = self.range(paddr, data.len(), bytes.len());
        bytes[range].copy_from_slice(data);
    }

    fn zero(&self, paddr: PhysAddr, len: usize) {
        let mut bytes = self.bytes.lock();
        let range = self.range(paddr, len, bytes.len());
        bytes[range].fill(0);
    }

    fn copy(&self, from: PhysAddr, to: PhysAddr, len: usize) {
        let mut bytes = self.bytes.lock();
        let size = bytes.len();
        let src = self.range(from, len, size);
        let dst = self.range(to, len, size);
        bytes.copy_within(src, dst.start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_copy_and_zero() {
        let ram = RamMemory::new(PhysAddr::new(0x10_0000), 2);
        assert_eq!(ram.frame_count(), 2);

        let a = PhysAddr::new(0x10_0000);
        let b = a + FRAME_SIZE as u64;
        ram.write(a + 4u64, &[9, 8, 7]);
        ram.copy(a, b, FRAME_SIZE);

        let mut buf = [0u8; 8];
        ram.read(b, &mut buf);
        assert_eq!(buf, [0, 0, 0, 0, 9, 8, 7, 0]);

        ram.zero(b, FRAME_SIZE);
        ram.read(b, &mut buf);
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    #[should_panic]
    fn test_ram_rejects_out_of_range() {
        let ram = RamMemory::new(PhysAddr::new(0x10_0000), 1);
        ram.zero(PhysAddr::new(0x10_0000 + FRAME_SIZE as u64), 1);
    }
}
