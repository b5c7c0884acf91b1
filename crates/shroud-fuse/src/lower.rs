//! The capability interface every view implements, and the host-directory
//! adapter the views are layered on.

use std::fs::File;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::{access, AccessFlags};
use shroud_core::{AccessMask, Attributes, DirEntry, FileKind, ShroudError, ShroudResult};

use crate::paths::relative;

/// Read-only filesystem operations, addressed by paths relative to the view
/// root ("/" or "" is the root itself).
pub trait FileSystem: Send + Sync {
    fn get_attributes(&self, path: &Path) -> ShroudResult<Attributes>;

    fn open(&self, path: &Path) -> ShroudResult<Arc<dyn FileHandle>>;

    /// Entries of a directory, without "." and "..".
    fn list_directory(&self, path: &Path) -> ShroudResult<Vec<DirEntry>>;

    fn check_access(&self, path: &Path, mask: AccessMask) -> ShroudResult<()>;
}

/// An open file. Reads are positional, so one handle serves concurrent
/// readers.
pub trait FileHandle: Send + Sync {
    /// Up to `size` bytes at `offset`; fewer only at end of file.
    fn read_at(&self, offset: u64, size: usize) -> ShroudResult<Vec<u8>>;
}

/// Pass-through to a host directory.
#[derive(Debug, Clone)]
pub struct Loopback {
    root: PathBuf,
}

impl Loopback {
    pub fn new(root: impl Into<PathBuf>) -> ShroudResult<Self> {
        let root = root.into();
        let meta = std::fs::metadata(&root).map_err(|e| ShroudError::from_io(e, &root))?;
        if !meta.is_dir() {
            return Err(ShroudError::NotADirectory(root.display().to_string()));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path for a view-relative path.
    pub fn host_path(&self, path: &Path) -> ShroudResult<PathBuf> {
        Ok(self.root.join(relative(path)?))
    }

    /// Open a regular file for reading without following a final symlink.
    pub fn open_file(&self, path: &Path) -> ShroudResult<File> {
        let host = self.host_path(path)?;
        std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&host)
            .map_err(|e| ShroudError::from_io(e, path))
    }

    /// Whole content of a small file.
    pub fn read_file(&self, path: &Path) -> ShroudResult<Vec<u8>> {
        let host = self.host_path(path)?;
        std::fs::read(&host).map_err(|e| ShroudError::from_io(e, path))
    }
}

impl FileSystem for Loopback {
    fn get_attributes(&self, path: &Path) -> ShroudResult<Attributes> {
        let host = self.host_path(path)?;
        let meta = std::fs::symlink_metadata(&host).map_err(|e| ShroudError::from_io(e, path))?;
        Ok(Attributes::from_metadata(&meta))
    }

    fn open(&self, path: &Path) -> ShroudResult<Arc<dyn FileHandle>> {
        Ok(Arc::new(LoopbackFile {
            file: self.open_file(path)?,
        }))
    }

    fn list_directory(&self, path: &Path) -> ShroudResult<Vec<DirEntry>> {
        let host = self.host_path(path)?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&host).map_err(|e| ShroudError::from_io(e, path))? {
            let entry = entry?;
            let kind = FileKind::from_file_type(entry.file_type()?);
            entries.push(DirEntry::new(entry.file_name(), kind));
        }
        // deterministic order
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn check_access(&self, path: &Path, mask: AccessMask) -> ShroudResult<()> {
        let host = self.host_path(path)?;
        access(&host, AccessFlags::from_bits_truncate(mask.0 as i32))
            .map_err(|errno| ShroudError::from_io(std::io::Error::from(errno), path))
    }
}

struct LoopbackFile {
    file: File,
}

impl FileHandle for LoopbackFile {
    fn read_at(&self, offset: u64, size: usize) -> ShroudResult<Vec<u8>> {
        read_full_at(&self.file, offset, size)
    }
}

/// `pread` until `size` bytes or end of file.
pub(crate) fn read_full_at(file: &File, offset: u64, size: usize) -> ShroudResult<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}
