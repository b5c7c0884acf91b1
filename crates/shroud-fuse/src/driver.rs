//! FUSE filesystem driver: mounts any [`FileSystem`] view read-only.
//!
//! ## Request flow
//!
//! ```text
//! kernel ──► fuse3 PathFilesystem (async) ──► spawn_blocking ──► FileSystem view
//!                                                                 (ReverseFs / ForwardFs)
//!                                                                      │
//!                                                                 Loopback (host dir)
//! ```
//!
//! View calls do host I/O and crypto, so they run on the blocking pool. Open
//! handles live in a table keyed by fh; a read clones the handle's `Arc` out
//! of the table and drops the lock before touching the file, so reads on
//! different handles never wait on each other.

#[cfg(feature = "fuse")]
mod inner {
    use std::collections::HashMap;
    use std::ffi::{OsStr, OsString};
    use std::num::NonZeroU32;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use fuse3::path::prelude::*;
    use fuse3::{Errno, FileType, MountOptions};
    use futures_util::stream;
    use shroud_core::{AccessMask, Attributes, FileKind, ShroudError, ShroudResult};
    use tokio::sync::Mutex;
    use tracing::{debug, info, warn};

    use crate::lower::{FileHandle, FileSystem};

    /// Preferred I/O size reported in attributes
    const BLKSIZE: u32 = 4096;

    fn errno(err: &ShroudError) -> Errno {
        Errno::from(err.errno())
    }

    fn file_type(kind: FileKind) -> FileType {
        match kind {
            FileKind::RegularFile => FileType::RegularFile,
            FileKind::Directory => FileType::Directory,
            FileKind::Symlink => FileType::Symlink,
            FileKind::NamedPipe => FileType::NamedPipe,
            FileKind::CharDevice => FileType::CharDevice,
            FileKind::BlockDevice => FileType::BlockDevice,
            FileKind::Socket => FileType::Socket,
        }
    }

    fn file_attr(attr: &Attributes) -> FileAttr {
        FileAttr {
            size: attr.size,
            blocks: attr.blocks(),
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            #[cfg(target_os = "macos")]
            crtime: attr.mtime,
            kind: file_type(attr.kind),
            perm: attr.perm,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: BLKSIZE,
            #[cfg(target_os = "macos")]
            flags: 0,
        }
    }

    fn join(parent: &OsStr, name: &OsStr) -> PathBuf {
        Path::new(parent).join(name)
    }

    // ── ShroudFuse ────────────────────────────────────────────────────────────

    /// The FUSE filesystem driver.
    pub struct ShroudFuse {
        fs: Arc<dyn FileSystem>,
        ttl: Duration,
        /// Open file handles: fh → view handle
        handles: Mutex<HashMap<u64, Arc<dyn FileHandle>>>,
        /// Monotonically increasing file-handle counter
        next_fh: AtomicU64,
    }

    impl ShroudFuse {
        pub fn new(fs: Arc<dyn FileSystem>, ttl: Duration) -> Self {
            ShroudFuse {
                fs,
                ttl,
                handles: Mutex::new(HashMap::new()),
                next_fh: AtomicU64::new(1),
            }
        }

        /// Run a view call on the blocking pool.
        async fn call<T, F>(&self, op: &'static str, f: F) -> fuse3::Result<T>
        where
            T: Send + 'static,
            F: FnOnce(&dyn FileSystem) -> ShroudResult<T> + Send + 'static,
        {
            let fs = self.fs.clone();
            let result = tokio::task::spawn_blocking(move || f(fs.as_ref()))
                .await
                .map_err(|e| {
                    warn!(op, "view task failed: {e}");
                    Errno::from(libc::EIO)
                })?;
            result.map_err(|e| {
                match &e {
                    ShroudError::NotFound(_) => debug!(op, "{e}"),
                    ShroudError::Authentication(_) | ShroudError::Format(_) | ShroudError::Io(_) => {
                        warn!(op, "{e}")
                    }
                    _ => debug!(op, "{e}"),
                }
                errno(&e)
            })
        }

        async fn attributes(&self, path: PathBuf) -> fuse3::Result<FileAttr> {
            let attr = self.call("getattr", move |fs| fs.get_attributes(&path)).await?;
            Ok(file_attr(&attr))
        }

        /// Directory entries with attributes, skipping entries that vanish
        /// between the listing and the stat.
        async fn list_with_attributes(
            &self,
            path: PathBuf,
        ) -> fuse3::Result<Vec<(OsString, FileKind, Option<Attributes>)>> {
            self.call("readdirplus", move |fs| {
                let entries = fs.list_directory(&path)?;
                Ok(entries
                    .into_iter()
                    .map(|e| {
                        let attr = fs.get_attributes(&path.join(&e.name)).ok();
                        (e.name, e.kind, attr)
                    })
                    .collect())
            })
            .await
        }
    }

    // ── PathFilesystem impl ────────────────────────────────────────────────────

    impl PathFilesystem for ShroudFuse {
        async fn init(&self, _req: Request) -> fuse3::Result<ReplyInit> {
            debug!("shroudfs init");
            Ok(ReplyInit {
                max_write: NonZeroU32::new(128 * 1024).ok_or(Errno::from(libc::EINVAL))?,
            })
        }

        async fn destroy(&self, _req: Request) {
            info!("shroudfs unmounted");
        }

        async fn getattr(
            &self,
            _req: Request,
            path: Option<&OsStr>,
            _fh: Option<u64>,
            _flags: u32,
        ) -> fuse3::Result<ReplyAttr> {
            let path = path.ok_or(Errno::from(libc::ENOENT))?;
            Ok(ReplyAttr {
                ttl: self.ttl,
                attr: self.attributes(PathBuf::from(path)).await?,
            })
        }

        async fn lookup(
            &self,
            _req: Request,
            parent: &OsStr,
            name: &OsStr,
        ) -> fuse3::Result<ReplyEntry> {
            Ok(ReplyEntry {
                ttl: self.ttl,
                attr: self.attributes(join(parent, name)).await?,
            })
        }

        async fn access(&self, _req: Request, path: &OsStr, mask: u32) -> fuse3::Result<()> {
            let path = PathBuf::from(path);
            self.call("access", move |fs| fs.check_access(&path, AccessMask(mask)))
                .await
        }

        // Directory entry stream types
        type DirEntryStream<'a>
            = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
        where
            Self: 'a;

        type DirEntryPlusStream<'a>
            = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
        where
            Self: 'a;

        async fn readdir<'a>(
            &'a self,
            _req: Request,
            path: &'a OsStr,
            _fh: u64,
            offset: i64,
        ) -> fuse3::Result<ReplyDirectory<Self::DirEntryStream<'a>>> {
            let dir = PathBuf::from(path);
            let listed = self.call("readdir", move |fs| fs.list_directory(&dir)).await?;

            let mut entries: Vec<fuse3::Result<DirectoryEntry>> = Vec::new();
            let dots = [(".", 1i64), ("..", 2)];
            for (name, off) in dots {
                if offset < off {
                    entries.push(Ok(DirectoryEntry {
                        kind: FileType::Directory,
                        name: name.into(),
                        offset: off,
                    }));
                }
            }
            for (i, entry) in listed.into_iter().enumerate() {
                let next_offset = i as i64 + 3;
                if next_offset > offset {
                    entries.push(Ok(DirectoryEntry {
                        kind: file_type(entry.kind),
                        name: entry.name,
                        offset: next_offset,
                    }));
                }
            }

            Ok(ReplyDirectory {
                entries: stream::iter(entries),
            })
        }

        async fn readdirplus<'a>(
            &'a self,
            _req: Request,
            path: &'a OsStr,
            _fh: u64,
            offset: u64,
            _lock_owner: u64,
        ) -> fuse3::Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
            let offset = offset as i64;
            let dir_attr = self.attributes(PathBuf::from(path)).await?;
            let listed = self.list_with_attributes(PathBuf::from(path)).await?;

            let mut entries: Vec<fuse3::Result<DirectoryEntryPlus>> = Vec::new();
            let dots = [(".", 1i64), ("..", 2)];
            for (name, off) in dots {
                if offset < off {
                    entries.push(Ok(DirectoryEntryPlus {
                        kind: FileType::Directory,
                        name: name.into(),
                        offset: off,
                        attr: dir_attr,
                        entry_ttl: self.ttl,
                        attr_ttl: self.ttl,
                    }));
                }
            }
            let mut next_offset = 3i64;
            for (name, kind, attr) in listed {
                let Some(attr) = attr else {
                    continue;
                };
                if next_offset > offset {
                    entries.push(Ok(DirectoryEntryPlus {
                        kind: file_type(kind),
                        name,
                        offset: next_offset,
                        attr: file_attr(&attr),
                        entry_ttl: self.ttl,
                        attr_ttl: self.ttl,
                    }));
                }
                next_offset += 1;
            }

            Ok(ReplyDirectoryPlus {
                entries: stream::iter(entries),
            })
        }

        async fn opendir(
            &self,
            _req: Request,
            _path: &OsStr,
            _flags: u32,
        ) -> fuse3::Result<ReplyOpen> {
            Ok(ReplyOpen { fh: 0, flags: 0 })
        }

        async fn open(&self, _req: Request, path: &OsStr, flags: u32) -> fuse3::Result<ReplyOpen> {
            if flags as i32 & libc::O_ACCMODE != libc::O_RDONLY {
                return Err(Errno::from(libc::EROFS));
            }
            let path = PathBuf::from(path);
            let handle = self.call("open", move |fs| fs.open(&path)).await?;

            let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
            self.handles.lock().await.insert(fh, handle);
            Ok(ReplyOpen { fh, flags: 0 })
        }

        async fn read(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            fh: u64,
            offset: u64,
            size: u32,
        ) -> fuse3::Result<ReplyData> {
            let handle = self
                .handles
                .lock()
                .await
                .get(&fh)
                .cloned()
                .ok_or(Errno::from(libc::EBADF))?;

            let data = tokio::task::spawn_blocking(move || handle.read_at(offset, size as usize))
                .await
                .map_err(|_| Errno::from(libc::EIO))?
                .map_err(|e| {
                    warn!(fh, offset, "read failed: {e}");
                    errno(&e)
                })?;
            Ok(ReplyData {
                data: Bytes::from(data),
            })
        }

        async fn release(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            fh: u64,
            _flags: u32,
            _lock_owner: u64,
            _flush: bool,
        ) -> fuse3::Result<()> {
            self.handles.lock().await.remove(&fh);
            Ok(())
        }

        async fn flush(
            &self,
            _req: Request,
            _path: Option<&OsStr>,
            _fh: u64,
            _lock_owner: u64,
        ) -> fuse3::Result<()> {
            Ok(())
        }

        async fn statfs(&self, _req: Request, _path: &OsStr) -> fuse3::Result<ReplyStatFs> {
            Ok(ReplyStatFs {
                blocks: 1 << 30,
                bfree: 0,
                bavail: 0,
                files: 1 << 20,
                ffree: 0,
                bsize: BLKSIZE,
                namelen: shroud_crypto::names::NAME_MAX as u32,
                frsize: BLKSIZE,
            })
        }
    }

    // ── Public mount API ──────────────────────────────────────────────────────

    /// Mount configuration
    pub struct MountConfig {
        pub fs: Arc<dyn FileSystem>,
        pub mountpoint: PathBuf,
        pub fs_name: String,
        pub attr_ttl: Duration,
        pub allow_other: bool,
    }

    /// Mount the view read-only and block until unmounted.
    ///
    /// Call from an async context. Logs a `ready` line once the kernel
    /// accepted the mount; returns when the filesystem is unmounted
    /// (e.g. via `fusermount3 -u <mountpoint>` or `shroudfs unmount`).
    pub async fn mount(cfg: MountConfig) -> std::io::Result<()> {
        let fs = ShroudFuse::new(cfg.fs, cfg.attr_ttl);

        let mut opts = MountOptions::default();
        opts.fs_name(cfg.fs_name);
        opts.read_only(true);
        opts.force_readdir_plus(true);
        if cfg.allow_other {
            opts.allow_other(true);
        }

        info!(mountpoint = %cfg.mountpoint.display(), "mounting shroudfs (unprivileged via fusermount3)");

        let handle = Session::new(opts)
            .mount_with_unprivileged(fs, &cfg.mountpoint)
            .await?;

        info!(mountpoint = %cfg.mountpoint.display(), "ready");
        handle.await
    }
}

#[cfg(feature = "fuse")]
pub use inner::{mount, MountConfig, ShroudFuse};
