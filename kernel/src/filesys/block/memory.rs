//! In-memory block device implementation

use crate::filesys::{BlockDevice, FsError};
use alloc::vec;
use alloc::vec::Vec;
use core::result::Result;

/// Block device that stores data in memory, used as a RAM-backed swap partition
pub struct MemoryBlockDevice {
    /// Backing bytes, `total_blocks * block_size` long
    bytes: Vec<u8>,

    /// Size of each block in bytes
    block_size: usize,
}

impl MemoryBlockDevice {
    /// Creates a new zeroed memory block device with given size
    pub fn new(total_blocks: u64, block_size: usize) -> Self {
        Self {
            bytes: vec![0; total_blocks as usize * block_size],
            block_size,
        }
    }

    /// Byte range covered by `block_num`, if it is on the device
    fn block_range(&self, block_num: u64) -> Result<core::ops::Range<usize>, FsError> {
        let start = (block_num as usize)
            .checked_mul(self.block_size)
            .ok_or(FsError::IOError)?;
        if start >= self.bytes.len() {
            return Err(FsError::IOError);
        }
        Ok(start..start + self.block_size)
    }

    /// Validates buffer is correct block size
    fn validate_buffer(&self, buf: &[u8]) -> Result<(), FsError> {
        if buf.len() != self.block_size {
            return Err(FsError::IOError);
        }
        Ok(())
    }
}

impl BlockDevice for MemoryBlockDevice {
    /// Reads block into buffer
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<(), FsError> {
        self.validate_buffer(buf)?;
        let range = self.block_range(block_num)?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    /// Writes buffer to block
    fn write_block(&mut self, block_num: u64, buf: &[u8]) -> Result<(), FsError> {
        self.validate_buffer(buf)?;
        let range = self.block_range(block_num)?;
        self.bytes[range].copy_from_slice(buf);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        (self.bytes.len() / self.block_size) as u64
    }
}
