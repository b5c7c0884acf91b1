//! Forward mode: a decrypted, read-only view of an encrypted tree, such as a
//! copy of a reverse view restored from backup.
//!
//! Plaintext paths are mapped outward one component at a time, encrypting
//! each name with the IV stored in its parent's `shroudfs.diriv`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use shroud_core::{AccessMask, Attributes, DirEntry, ShroudError, ShroudResult};
use shroud_crypto::names::LONGNAME_SUFFIX;
use shroud_crypto::{
    ContentCodec, DirIv, LongNameLookup, MasterKey, NameCodec, DIRIV_FILENAME, DIRIV_LEN,
};
use tracing::{debug, warn};

use crate::handle::ForwardFile;
use crate::lower::{FileHandle, FileSystem, Loopback};
use crate::paths::{
    is_dir_iv_name, is_excluded_path, is_long_name_record_name, is_root_config_path, relative,
    ExcludePolicy,
};
use crate::reverse::ViewOptions;

pub struct ForwardFs {
    lower: Loopback,
    content: Arc<ContentCodec>,
    names: Option<NameCodec>,
    exclude: ExcludePolicy,
    span: tracing::Span,
}

/// Long-name records stored next to the entries of one ciphertext directory.
struct DirRecords<'a> {
    lower: &'a Loopback,
    dir: &'a Path,
}

impl LongNameLookup for DirRecords<'_> {
    fn long_name_encoding(&self, hashed: &str) -> ShroudResult<String> {
        let record = self.dir.join(format!("{hashed}{LONGNAME_SUFFIX}"));
        let raw = self.lower.read_file(&record)?;
        let text = String::from_utf8(raw)
            .map_err(|_| ShroudError::Format(format!("{}: not UTF-8", record.display())))?;
        Ok(text.trim_end().to_string())
    }
}

impl ForwardFs {
    pub fn new(lower: Loopback, master: &MasterKey, opts: &ViewOptions) -> ShroudResult<Self> {
        let names = if opts.plaintext_names {
            None
        } else {
            Some(NameCodec::new(master, opts.long_names)?)
        };
        let span = tracing::info_span!("forward", root = %lower.root().display());
        Ok(Self {
            content: Arc::new(ContentCodec::new(master)?),
            names,
            exclude: ExcludePolicy::new(&opts.exclude)?,
            lower,
            span,
        })
    }

    fn dir_iv(&self, cipher_dir: &Path) -> ShroudResult<DirIv> {
        let raw = self.lower.read_file(&cipher_dir.join(DIRIV_FILENAME))?;
        raw.try_into().map_err(|raw: Vec<u8>| {
            ShroudError::Format(format!(
                "{}: directory IV is {} bytes, expected {DIRIV_LEN}",
                cipher_dir.display(),
                raw.len()
            ))
        })
    }

    /// Ciphertext path of a plaintext-view path.
    pub fn cipher_path(&self, plain_path: &Path) -> ShroudResult<PathBuf> {
        let rel = relative(plain_path)?;
        let mut plain = PathBuf::new();
        let mut cipher = PathBuf::new();
        for component in rel.iter() {
            plain.push(component);
            if is_excluded_path(&plain, &self.exclude) {
                return Err(ShroudError::PermissionDenied(plain.display().to_string()));
            }
            match &self.names {
                None => cipher.push(component),
                Some(names) => {
                    let iv = self.dir_iv(&cipher)?;
                    cipher.push(names.encrypt_name(component, &iv)?.file_name());
                }
            }
        }
        Ok(cipher)
    }

    fn is_hidden(&self, cipher_dir: &Path, name: &OsStr) -> bool {
        if cipher_dir.as_os_str().is_empty() && is_root_config_path(Path::new(name)) {
            return true;
        }
        self.names.is_some() && (is_dir_iv_name(name) || is_long_name_record_name(name))
    }
}

impl FileSystem for ForwardFs {
    fn get_attributes(&self, path: &Path) -> ShroudResult<Attributes> {
        let _enter = self.span.enter();
        let cipher = self.cipher_path(path)?;
        let mut attr = self.lower.get_attributes(&cipher)?;
        if attr.is_regular() {
            attr.size = self.content.cipher_to_plain_size(attr.size)?;
        }
        Ok(attr)
    }

    fn open(&self, path: &Path) -> ShroudResult<Arc<dyn FileHandle>> {
        let _enter = self.span.enter();
        let cipher = self.cipher_path(path)?;
        if !self.lower.get_attributes(&cipher)?.is_regular() {
            return Err(ShroudError::PermissionDenied(format!(
                "{}: not a regular file",
                path.display()
            )));
        }
        let file = self.lower.open_file(&cipher)?;
        debug!(path = %path.display(), "open");
        Ok(Arc::new(ForwardFile::open(file, self.content.clone())?))
    }

    fn list_directory(&self, path: &Path) -> ShroudResult<Vec<DirEntry>> {
        let _enter = self.span.enter();
        let plain_dir = relative(path)?;
        let cipher_dir = self.cipher_path(&plain_dir)?;
        let lower_entries = self.lower.list_directory(&cipher_dir)?;

        let iv = match &self.names {
            Some(_) => Some(self.dir_iv(&cipher_dir)?),
            None => None,
        };
        let records = DirRecords {
            lower: &self.lower,
            dir: &cipher_dir,
        };

        let mut entries = Vec::with_capacity(lower_entries.len());
        for entry in lower_entries {
            if self.is_hidden(&cipher_dir, &entry.name) {
                continue;
            }
            let name = match (&self.names, &iv) {
                (Some(names), Some(iv)) => match names.decrypt_name(&entry.name, iv, &records) {
                    Ok(name) => name,
                    Err(e) => {
                        warn!(
                            dir = %plain_dir.display(),
                            name = %entry.name.to_string_lossy(),
                            "skipping undecodable entry: {e}"
                        );
                        continue;
                    }
                },
                _ => entry.name,
            };
            if is_excluded_path(&plain_dir.join(&name), &self.exclude) {
                continue;
            }
            entries.push(DirEntry::new(name, entry.kind));
        }
        Ok(entries)
    }

    fn check_access(&self, path: &Path, mask: AccessMask) -> ShroudResult<()> {
        let _enter = self.span.enter();
        let cipher = self.cipher_path(path)?;
        if mask.wants_write() {
            self.lower.get_attributes(&cipher)?;
            return Err(ShroudError::PermissionDenied(format!(
                "{}: read-only view",
                path.display()
            )));
        }
        self.lower.check_access(&cipher, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> MasterKey {
        MasterKey::from_bytes([0x24; 32])
    }

    #[test]
    fn missing_diriv_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ForwardFs::new(Loopback::new(dir.path()).unwrap(), &master(), &ViewOptions::default())
            .unwrap();
        assert!(fs.list_directory(Path::new("/")).unwrap_err().is_not_found());
    }

    #[test]
    fn short_diriv_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DIRIV_FILENAME), b"short").unwrap();
        let fs = ForwardFs::new(Loopback::new(dir.path()).unwrap(), &master(), &ViewOptions::default())
            .unwrap();
        assert!(matches!(
            fs.list_directory(Path::new("/")),
            Err(ShroudError::Format(_))
        ));
    }

    #[test]
    fn foreign_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DIRIV_FILENAME), [1u8; DIRIV_LEN]).unwrap();
        std::fs::write(dir.path().join("not-encrypted.txt"), b"x").unwrap();
        std::fs::write(dir.path().join(shroud_crypto::CONFIG_FILENAME), b"{}").unwrap();
        let fs = ForwardFs::new(Loopback::new(dir.path()).unwrap(), &master(), &ViewOptions::default())
            .unwrap();
        assert!(fs.list_directory(Path::new("/")).unwrap().is_empty());
    }

    #[test]
    fn access_resolves_before_refusing_writes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        let opts = ViewOptions {
            plaintext_names: true,
            ..ViewOptions::default()
        };
        let fs = ForwardFs::new(Loopback::new(dir.path()).unwrap(), &master(), &opts).unwrap();
        assert!(fs.check_access(Path::new("/missing"), AccessMask::WRITE).unwrap_err().is_not_found());
        assert!(matches!(
            fs.check_access(Path::new("/a"), AccessMask::WRITE),
            Err(ShroudError::PermissionDenied(_))
        ));
        fs.check_access(Path::new("/a"), AccessMask::READ).unwrap();
    }

    #[test]
    fn plaintext_names_hide_only_the_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join(shroud_crypto::CONFIG_FILENAME), b"{}").unwrap();
        let opts = ViewOptions {
            plaintext_names: true,
            ..ViewOptions::default()
        };
        let fs = ForwardFs::new(Loopback::new(dir.path()).unwrap(), &master(), &opts).unwrap();
        let entries = fs.list_directory(Path::new("/")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a");
        assert_eq!(fs.get_attributes(Path::new("/a")).unwrap().size, 0);
    }
}
