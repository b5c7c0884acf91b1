use std::ffi::OsString;
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Kind of a filesystem entry, as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    NamedPipe,
    CharDevice,
    BlockDevice,
    Socket,
}

impl FileKind {
    pub fn from_file_type(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_fifo() {
            FileKind::NamedPipe
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::RegularFile
        }
    }
}

/// Attributes of an entry in one of the views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub ino: u64,
    pub kind: FileKind,
    /// Permission bits only (no file type bits)
    pub perm: u16,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Attributes {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            ino: meta.ino(),
            kind: FileKind::from_file_type(meta.file_type()),
            perm: (meta.mode() & 0o7777) as u16,
            size: meta.size(),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            atime: unix_time(meta.atime(), meta.atime_nsec()),
            mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::RegularFile
    }

    /// 512-byte blocks, as `stat` reports them
    pub fn blocks(&self) -> u64 {
        self.size.div_ceil(512)
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileKind,
}

impl DirEntry {
    pub fn new(name: impl Into<OsString>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// `access(2)` request bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessMask(pub u32);

impl AccessMask {
    pub const EXISTS: AccessMask = AccessMask(libc::F_OK as u32);
    pub const READ: AccessMask = AccessMask(libc::R_OK as u32);
    pub const WRITE: AccessMask = AccessMask(libc::W_OK as u32);
    pub const EXECUTE: AccessMask = AccessMask(libc::X_OK as u32);

    pub fn wants_write(self) -> bool {
        self.0 & libc::W_OK as u32 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_from_directory_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let meta = std::fs::metadata(dir.path()).unwrap();
        let attr = Attributes::from_metadata(&meta);
        assert!(attr.is_dir());
        assert!(!attr.is_regular());
        assert!(attr.nlink >= 2);
    }

    #[test]
    fn attributes_from_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, vec![0u8; 1000]).unwrap();
        let attr = Attributes::from_metadata(&std::fs::metadata(&path).unwrap());
        assert!(attr.is_regular());
        assert_eq!(attr.size, 1000);
        assert_eq!(attr.blocks(), 2);
    }

    #[test]
    fn access_mask_write_detection() {
        assert!(AccessMask(AccessMask::READ.0 | AccessMask::WRITE.0).wants_write());
        assert!(!AccessMask::EXECUTE.wants_write());
    }
}
