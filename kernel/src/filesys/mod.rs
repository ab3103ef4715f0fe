//! Backing-file layer used by the VM system.
//!
//! The VM core only needs positional reads and writes on two kinds of files:
//! the executable image of each process and the swap area. Both are reached
//! through [`Vnode`]; [`FileSystem`] hands them out by path.

use alloc::sync::Arc;
use core::result::Result;

pub mod block;
pub mod memfs;

// Define error types for the filesystem operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    InvalidName,
    IOError,
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::NotFound => write!(f, "No such file"),
            FsError::InvalidName => write!(f, "Invalid file name"),
            FsError::IOError => write!(f, "I/O error"),
        }
    }
}

// See https://man7.org/linux/man-pages/man2/open.2.html
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl Default for OpenFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFlags {
    pub const O_RDONLY: u32 = 0;
    pub const O_RDWR: u32 = 1 << 1;
    pub const O_CREAT: u32 = 1 << 2;
    pub const O_TRUNC: u32 = 1 << 3;

    pub const fn new() -> Self {
        OpenFlags(Self::O_RDONLY)
    }

    // creates OpenFlags with inputted flags
    pub const fn with_flags(self, flag: u32) -> Self {
        OpenFlags(self.0 | flag)
    }

    // Checks if OpenFlags contains input flags
    pub const fn contains(self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }
}

/// Represents a block device that can be read from and written to
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<(), FsError>;
    fn write_block(&mut self, block_num: u64, buf: &[u8]) -> Result<(), FsError>;
    fn block_size(&self) -> usize;
    fn total_blocks(&self) -> u64;
}

/// An open file addressed by absolute byte offset.
///
/// Offsets are passed on every call, so a vnode carries no cursor and can be
/// shared between the fault path and the syscall layer.
pub trait Vnode: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`, returning how many were read.
    /// Reading at or past the end of the file returns 0.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Writes `buf` at `offset`, returning how many bytes were written.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError>;

    /// Current length of the file in bytes.
    fn size(&self) -> u64;
}

/// Shared handle to an open vnode.
pub type VnodeRef = Arc<dyn Vnode>;

/// The part of a filesystem the VM system depends on
pub trait FileSystem: Send + Sync {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<VnodeRef, FsError>;

    /// Releases a handle returned by [`FileSystem::open`].
    fn close(&self, vnode: VnodeRef) {
        drop(vnode);
    }
}
