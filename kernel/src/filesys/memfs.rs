//! A flat, RAM-resident filesystem.
//!
//! Holds executables loaded from the boot image and, when no swap partition is
//! configured, the swap file itself.

use crate::filesys::{FileSystem, FsError, OpenFlags, Vnode, VnodeRef};
use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use spin::RwLock;

/// A growable in-memory file
#[derive(Debug, Default)]
pub struct MemFile {
    data: RwLock<Vec<u8>>,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(bytes: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(bytes),
        }
    }

    fn truncate(&self) {
        self.data.write().clear();
    }
}

impl Vnode for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let data = self.data.read();
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(FsError::IOError)?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }
}

/// Path-keyed set of [`MemFile`]s
#[derive(Default)]
pub struct MemFs {
    files: RwLock<BTreeMap<String, Arc<MemFile>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `bytes` at `path`, replacing any existing file
    pub fn insert(&self, path: &str, bytes: Vec<u8>) -> Result<(), FsError> {
        validate_path(path)?;
        self.files
            .write()
            .insert(String::from(path), Arc::new(MemFile::with_contents(bytes)));
        Ok(())
    }

    /// Number of handles to `path` that are open right now
    pub fn open_handles(&self, path: &str) -> usize {
        self.files
            .read()
            .get(path)
            .map_or(0, |file| Arc::strong_count(file) - 1)
    }
}

fn validate_path(path: &str) -> Result<(), FsError> {
    if path.is_empty() || path.contains('\0') {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

impl FileSystem for MemFs {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<VnodeRef, FsError> {
        validate_path(path)?;

        if let Some(file) = self.files.read().get(path) {
            if flags.contains(OpenFlags::O_TRUNC) {
                file.truncate();
            }
            let handle: VnodeRef = file.clone();
            return Ok(handle);
        }

        if !flags.contains(OpenFlags::O_CREAT) {
            return Err(FsError::NotFound);
        }

        let file = self
            .files
            .write()
            .entry(String::from(path))
            .or_insert_with(|| Arc::new(MemFile::new()))
            .clone();
        let handle: VnodeRef = file;
        Ok(handle)
    }
}
