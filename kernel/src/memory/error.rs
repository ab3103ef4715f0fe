//! Errors raised by the VM system and their syscall-boundary errno.

use crate::filesys::FsError;

/// Errno values the trap layer surfaces to user processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EFAULT,
    ENOMEM,
    ENOEXEC,
    EIO,
    EUNIMP,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Address is outside every segment of the address space
    InvalidAddress,
    /// No frame is free and nothing could be evicted
    OutOfMemory,
    /// Every swap slot is taken
    SwapFull,
    /// A page-table entry, frame record and TLB line disagree
    Inconsistent(&'static str),
    /// Write to a page that is mapped read-only for good
    ReadOnlyWrite,
    /// The image is not an executable this kernel can run
    NotExecutable,
    /// More regions than an address space supports
    Unsupported,
    /// A page that was never modified was handed to the swap store
    CleanEviction,
    /// The executable or the swap file failed underneath us
    Io(FsError),
}

pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    pub fn errno(self) -> Errno {
        match self {
            VmError::InvalidAddress
            | VmError::Inconsistent(_)
            | VmError::ReadOnlyWrite
            | VmError::CleanEviction => Errno::EFAULT,
            VmError::OutOfMemory | VmError::SwapFull => Errno::ENOMEM,
            VmError::NotExecutable => Errno::ENOEXEC,
            VmError::Unsupported => Errno::EUNIMP,
            VmError::Io(_) => Errno::EIO,
        }
    }

    /// Whether the faulting process has to be killed rather than handed an errno
    pub fn terminates_process(self) -> bool {
        matches!(
            self,
            VmError::OutOfMemory
                | VmError::SwapFull
                | VmError::Inconsistent(_)
                | VmError::ReadOnlyWrite
                | VmError::CleanEviction
        )
    }
}

impl From<FsError> for VmError {
    fn from(err: FsError) -> Self {
        VmError::Io(err)
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::InvalidAddress => write!(f, "Address not in any segment"),
            VmError::OutOfMemory => write!(f, "Out of physical frames"),
            VmError::SwapFull => write!(f, "Swap file is full"),
            VmError::Inconsistent(what) => write!(f, "VM state inconsistent: {}", what),
            VmError::ReadOnlyWrite => write!(f, "Write to read-only page"),
            VmError::NotExecutable => write!(f, "Not an executable"),
            VmError::Unsupported => write!(f, "Too many regions"),
            VmError::CleanEviction => write!(f, "Evicting a page that was never modified"),
            VmError::Io(err) => write!(f, "Backing store error: {}", err),
        }
    }
}
