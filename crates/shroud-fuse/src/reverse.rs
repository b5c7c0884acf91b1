//! Reverse mode: an encrypted, read-only view of a plaintext tree
//!
//! ```text
//! plaintext root                     encrypted view
//!   notes.txt            ──►          <enc(notes.txt)>          (header + blocks)
//!   photos/              ──►          <enc(photos)>/
//!     <240-byte name>    ──►            shroudfs.longname.<hash>
//!                                       shroudfs.longname.<hash>.name
//!                                       shroudfs.diriv
//!   shroudfs.conf        ──►          (hidden)
//!                                     shroudfs.diriv
//! ```
//!
//! The host hands us ciphertext-view paths. Each component is decrypted with
//! the IV of its parent directory, and the IV is derived from the parent's
//! plaintext path, so nothing is ever written into the plaintext tree.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use shroud_core::{AccessMask, Attributes, DirEntry, FileKind, ShroudError, ShroudResult};
use shroud_crypto::names::{is_long_name, LONGNAME_SUFFIX};
use shroud_crypto::{
    ContentCodec, EncryptedName, MasterKey, NameCodec, NoLongNames, PathIvDeriver, DIRIV_FILENAME,
    DIRIV_LEN,
};
use tracing::{debug, warn};

use crate::handle::{MemoryFile, ReverseFile};
use crate::lower::{FileHandle, FileSystem, Loopback};
use crate::paths::{
    is_dir_iv_name, is_excluded_path, is_long_name_record_name, relative, ExcludePolicy,
};

/// Mode of virtual files (directory IVs, long-name records)
const VIRTUAL_FILE_PERM: u16 = 0o400;

/// Name handling shared by both view directions.
#[derive(Debug, Clone)]
pub struct ViewOptions {
    pub plaintext_names: bool,
    pub long_names: bool,
    /// Extra glob patterns hidden from the view
    pub exclude: Vec<String>,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            plaintext_names: false,
            long_names: true,
            exclude: Vec::new(),
        }
    }
}

/// What a ciphertext-view path refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReverseNode {
    /// A real entry at this plaintext path
    Entry(PathBuf),
    /// The IV file of the plaintext directory
    DirIv(PathBuf),
    /// Side record holding the full encoding of a long name in `dir`
    LongNameRecord { dir: PathBuf, encoded: String },
}

pub struct ReverseFs {
    lower: Loopback,
    content: Arc<ContentCodec>,
    /// `None` when names are passed through
    names: Option<NameCodec>,
    ivs: PathIvDeriver,
    exclude: ExcludePolicy,
    span: tracing::Span,
}

impl ReverseFs {
    pub fn new(lower: Loopback, master: &MasterKey, opts: &ViewOptions) -> ShroudResult<Self> {
        let names = if opts.plaintext_names {
            None
        } else {
            Some(NameCodec::new(master, opts.long_names)?)
        };
        let span = tracing::info_span!("reverse", root = %lower.root().display());
        Ok(Self {
            content: Arc::new(ContentCodec::new(master)?),
            names,
            ivs: PathIvDeriver::new(master)?,
            exclude: ExcludePolicy::new(&opts.exclude)?,
            lower,
            span,
        })
    }

    pub fn content_codec(&self) -> &Arc<ContentCodec> {
        &self.content
    }

    /// Map a ciphertext-view path to what it names in the plaintext tree.
    ///
    /// Undecodable components are reported as not found; a failed name
    /// authentication is passed through as such.
    pub fn resolve(&self, cipher_path: &Path) -> ShroudResult<ReverseNode> {
        let rel = relative(cipher_path)?;
        let components: Vec<&OsStr> = rel.iter().collect();
        let mut plain = PathBuf::new();

        for (i, component) in components.iter().enumerate() {
            let last = i + 1 == components.len();
            let Some(names) = &self.names else {
                plain.push(component);
                self.check_not_excluded(&plain)?;
                continue;
            };

            if is_dir_iv_name(component) {
                if !last {
                    return Err(ShroudError::NotADirectory(cipher_path.display().to_string()));
                }
                return Ok(ReverseNode::DirIv(plain));
            }

            if is_long_name_record_name(component) {
                if !last {
                    return Err(ShroudError::NotADirectory(cipher_path.display().to_string()));
                }
                let hashed = component
                    .to_str()
                    .and_then(|s| s.strip_suffix(LONGNAME_SUFFIX))
                    .ok_or_else(|| ShroudError::NotFound(cipher_path.display().to_string()))?;
                let (_, encoded) = self.find_long_name(&plain, hashed)?;
                return Ok(ReverseNode::LongNameRecord { dir: plain, encoded });
            }

            let name = if is_long_name(component) {
                let hashed = component
                    .to_str()
                    .ok_or_else(|| ShroudError::NotFound(cipher_path.display().to_string()))?;
                self.find_long_name(&plain, hashed)?.0
            } else {
                let iv = self.ivs.dir_iv(&plain);
                match names.decrypt_name(component, &iv, &NoLongNames) {
                    Ok(name) => name,
                    Err(ShroudError::Format(reason)) => {
                        debug!(parent: &self.span, path = %cipher_path.display(), %reason, "undecodable component");
                        return Err(ShroudError::NotFound(cipher_path.display().to_string()));
                    }
                    Err(e) => return Err(e),
                }
            };
            plain.push(name);
            self.check_not_excluded(&plain)?;
        }

        Ok(ReverseNode::Entry(plain))
    }

    /// Map a plaintext path to its ciphertext-view path.
    pub fn encrypt_path(&self, plain_path: &Path) -> ShroudResult<PathBuf> {
        let rel = relative(plain_path)?;
        let Some(names) = &self.names else {
            return Ok(rel);
        };
        let mut parent = PathBuf::new();
        let mut out = PathBuf::new();
        for component in rel.iter() {
            let encrypted = names.encrypt_name(component, &self.ivs.dir_iv(&parent))?;
            out.push(encrypted.file_name());
            parent.push(component);
        }
        Ok(out)
    }

    fn check_not_excluded(&self, plain: &Path) -> ShroudResult<()> {
        if is_excluded_path(plain, &self.exclude) {
            debug!(parent: &self.span, path = %plain.display(), "excluded");
            return Err(ShroudError::PermissionDenied(plain.display().to_string()));
        }
        Ok(())
    }

    /// Find the entry of `dir` whose long encoding hashes to `hashed`.
    fn find_long_name(&self, dir: &Path, hashed: &str) -> ShroudResult<(OsString, String)> {
        let Some(names) = &self.names else {
            return Err(ShroudError::NotFound(hashed.to_string()));
        };
        let iv = self.ivs.dir_iv(dir);
        for entry in self.lower.list_directory(dir)? {
            if is_excluded_path(&dir.join(&entry.name), &self.exclude) {
                continue;
            }
            if let Ok(EncryptedName::Long { hashed: h, encoded }) = names.encrypt_name(&entry.name, &iv) {
                if h == hashed {
                    return Ok((entry.name, encoded));
                }
            }
        }
        Err(ShroudError::NotFound(dir.join(hashed).display().to_string()))
    }

    /// Attributes of the directory owning a virtual file. It must be a
    /// directory the caller may traverse.
    fn virtual_parent_attributes(&self, dir: &Path) -> ShroudResult<Attributes> {
        let attr = self.lower.get_attributes(dir)?;
        if !attr.is_dir() {
            return Err(ShroudError::NotADirectory(dir.display().to_string()));
        }
        if attr.perm & 0o100 == 0 {
            return Err(ShroudError::PermissionDenied(dir.display().to_string()));
        }
        Ok(attr)
    }

    fn virtual_file_attributes(&self, dir: &Path, size: u64) -> ShroudResult<Attributes> {
        let parent = self.virtual_parent_attributes(dir)?;
        Ok(Attributes {
            ino: 0,
            kind: FileKind::RegularFile,
            perm: VIRTUAL_FILE_PERM,
            size,
            nlink: 1,
            rdev: 0,
            ..parent
        })
    }
}

impl FileSystem for ReverseFs {
    fn get_attributes(&self, path: &Path) -> ShroudResult<Attributes> {
        let _enter = self.span.enter();
        match self.resolve(path)? {
            ReverseNode::Entry(plain) => {
                let mut attr = self.lower.get_attributes(&plain)?;
                if attr.is_regular() {
                    attr.size = self.content.plain_to_cipher_size(attr.size);
                }
                Ok(attr)
            }
            ReverseNode::DirIv(dir) => self.virtual_file_attributes(&dir, DIRIV_LEN as u64),
            ReverseNode::LongNameRecord { dir, encoded } => {
                self.virtual_file_attributes(&dir, encoded.len() as u64)
            }
        }
    }

    fn open(&self, path: &Path) -> ShroudResult<Arc<dyn FileHandle>> {
        let _enter = self.span.enter();
        match self.resolve(path)? {
            ReverseNode::Entry(plain) => {
                let attr = self.lower.get_attributes(&plain)?;
                if !attr.is_regular() {
                    return Err(ShroudError::PermissionDenied(format!(
                        "{}: not a regular file",
                        path.display()
                    )));
                }
                let file = self.lower.open_file(&plain)?;
                debug!(path = %plain.display(), "open");
                Ok(Arc::new(ReverseFile::new(
                    file,
                    self.content.clone(),
                    self.ivs.file_id(&plain),
                )))
            }
            ReverseNode::DirIv(dir) => {
                self.virtual_parent_attributes(&dir)?;
                Ok(Arc::new(MemoryFile::new(self.ivs.dir_iv(&dir).to_vec())))
            }
            ReverseNode::LongNameRecord { dir, encoded } => {
                self.virtual_parent_attributes(&dir)?;
                Ok(Arc::new(MemoryFile::new(encoded.into_bytes())))
            }
        }
    }

    fn list_directory(&self, path: &Path) -> ShroudResult<Vec<DirEntry>> {
        let _enter = self.span.enter();
        let plain = match self.resolve(path)? {
            ReverseNode::Entry(plain) => plain,
            _ => return Err(ShroudError::NotADirectory(path.display().to_string())),
        };

        let lower_entries = self.lower.list_directory(&plain)?;
        let mut entries = Vec::with_capacity(lower_entries.len() + 1);
        let iv = self.ivs.dir_iv(&plain);

        for entry in lower_entries {
            if is_excluded_path(&plain.join(&entry.name), &self.exclude) {
                continue;
            }
            let Some(names) = &self.names else {
                entries.push(entry);
                continue;
            };
            match names.encrypt_name(&entry.name, &iv) {
                Ok(EncryptedName::Short(name)) => entries.push(DirEntry::new(name, entry.kind)),
                Ok(long @ EncryptedName::Long { .. }) => {
                    entries.push(DirEntry::new(long.file_name(), entry.kind));
                    if let Some((record, _)) = long.side_record() {
                        entries.push(DirEntry::new(record, FileKind::RegularFile));
                    }
                }
                Err(ShroudError::NameTooLong(name)) => {
                    warn!(dir = %plain.display(), %name, "name too long without LongNames, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        if self.names.is_some() {
            entries.push(DirEntry::new(DIRIV_FILENAME, FileKind::RegularFile));
        }
        Ok(entries)
    }

    fn check_access(&self, path: &Path, mask: AccessMask) -> ShroudResult<()> {
        let _enter = self.span.enter();
        match self.resolve(path)? {
            ReverseNode::Entry(plain) if mask.wants_write() => {
                self.lower.get_attributes(&plain)?;
            }
            ReverseNode::Entry(plain) => return self.lower.check_access(&plain, mask),
            ReverseNode::DirIv(dir) | ReverseNode::LongNameRecord { dir, .. } => {
                self.virtual_parent_attributes(&dir)?;
            }
        }
        if mask.wants_write() {
            return Err(ShroudError::PermissionDenied(format!(
                "{}: read-only view",
                path.display()
            )));
        }
        Ok(())
    }
}
