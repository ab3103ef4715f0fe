//! Raw block devices exposed as vnodes.
//!
//! A dedicated swap partition has no filesystem on it; [`DeviceVnode`] lets the
//! swap store address it by byte offset like any other backing file.

use crate::filesys::{BlockDevice, FsError, Vnode};
use alloc::vec;
use spin::Mutex;

pub mod memory;

/// Byte-addressed view of a block device
pub struct DeviceVnode<D: BlockDevice> {
    device: Mutex<D>,
}

impl<D: BlockDevice> DeviceVnode<D> {
    pub fn new(device: D) -> Self {
        Self {
            device: Mutex::new(device),
        }
    }

    /// Splits `[offset, offset + len)` into (block, offset in block, length) pieces
    fn for_each_chunk<F>(&self, offset: u64, len: usize, mut f: F) -> Result<usize, FsError>
    where
        F: FnMut(&mut D, u64, usize, usize, usize) -> Result<(), FsError>,
    {
        let mut device = self.device.lock();
        let block_size = device.block_size() as u64;
        let capacity = block_size * device.total_blocks();
        if offset >= capacity {
            return Ok(0);
        }

        let len = len.min((capacity - offset) as usize);
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let block = pos / block_size;
            let in_block = (pos % block_size) as usize;
            let chunk = (block_size as usize - in_block).min(len - done);
            f(&mut device, block, in_block, done, chunk)?;
            done += chunk;
        }
        Ok(done)
    }
}

impl<D: BlockDevice> Vnode for DeviceVnode<D> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut scratch = vec![0u8; self.device.lock().block_size()];
        self.for_each_chunk(offset, buf.len(), |device, block, in_block, at, len| {
            device.read_block(block, &mut scratch)?;
            buf[at..at + len].copy_from_slice(&scratch[in_block..in_block + len]);
            Ok(())
        })
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        let mut scratch = vec![0u8; self.device.lock().block_size()];
        let written = self.for_each_chunk(offset, buf.len(), |device, block, in_block, at, len| {
            // partial blocks need a read-modify-write
            if len != scratch.len() {
                device.read_block(block, &mut scratch)?;
            }
            scratch[in_block..in_block + len].copy_from_slice(&buf[at..at + len]);
            device.write_block(block, &scratch)
        })?;

        // a device cannot grow, so a write that runs off the end is an error
        if written != buf.len() {
            return Err(FsError::IOError);
        }
        Ok(written)
    }

    fn size(&self) -> u64 {
        let device = self.device.lock();
        device.block_size() as u64 * device.total_blocks()
    }
}
