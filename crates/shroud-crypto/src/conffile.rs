//! On-disk volume config: KDF parameters, wrapped master key, feature flags
//!
//! Stored as JSON next to the ciphertext root (forward mode) or inside the
//! plaintext root (reverse mode), mode 0400:
//! ```text
//! {
//!   "creator": "shroudfs 0.1.0",
//!   "version": 1,
//!   "kdf": { "salt": "<base64>", "mem_cost_kib": 65536, "time_cost": 3, "parallelism": 4 },
//!   "encrypted_key": "<base64: nonce || wrapped key || tag>",
//!   "feature_flags": ["LongNames"]
//! }
//! ```

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use shroud_core::{ShroudError, ShroudResult};

use crate::kdf::{derive_wrapping_key, KdfParams};
use crate::keys::{unwrap_master_key, wrap_master_key, MasterKey};
use crate::SALT_SIZE;

pub const CONFIG_FILENAME: &str = "shroudfs.conf";

/// The only config format this build reads or writes
pub const FORMAT_VERSION: u16 = 1;

const CONFIG_FILE_MODE: u32 = 0o400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureFlag {
    /// Over-length encrypted names are hashed into a side record
    LongNames,
    /// Names are passed through unencrypted; no directory IV files
    PlaintextNames,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfSection {
    /// base64
    pub salt: String,
    #[serde(flatten)]
    pub params: KdfParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub creator: String,
    pub version: u16,
    pub kdf: KdfSection,
    pub encrypted_key: String,
    pub feature_flags: Vec<FeatureFlag>,
}

/// Options fixed at creation time.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub plaintext_names: bool,
    pub long_names: bool,
    pub kdf: KdfParams,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            plaintext_names: false,
            long_names: true,
            kdf: KdfParams::default(),
        }
    }
}

impl ConfigFile {
    pub fn has_flag(&self, flag: FeatureFlag) -> bool {
        self.feature_flags.contains(&flag)
    }

    pub fn plaintext_names(&self) -> bool {
        self.has_flag(FeatureFlag::PlaintextNames)
    }

    pub fn long_names(&self) -> bool {
        self.has_flag(FeatureFlag::LongNames)
    }

    /// Parse a config file without unlocking it.
    ///
    /// Unknown versions and unknown feature flags are config errors.
    pub fn read(path: &Path) -> ShroudResult<Self> {
        let data = std::fs::read(path).map_err(|e| ShroudError::from_io(e, path))?;
        let file: ConfigFile = serde_json::from_slice(&data)
            .map_err(|e| ShroudError::Config(format!("{}: {e}", path.display())))?;
        if file.version != FORMAT_VERSION {
            return Err(ShroudError::Config(format!(
                "{}: unsupported config version {} (this build reads version {FORMAT_VERSION})",
                path.display(),
                file.version
            )));
        }
        Ok(file)
    }

    /// Derive the wrapping key from `password` and unwrap the master key.
    pub fn unlock(&self, password: &SecretString) -> ShroudResult<MasterKey> {
        let salt = self.salt()?;
        let wrapping = derive_wrapping_key(password, &salt, &self.kdf.params)?;
        // a mangled blob is indistinguishable from a wrong password
        let wrapped = STANDARD
            .decode(&self.encrypted_key)
            .map_err(|_| ShroudError::WrongPassword)?;
        unwrap_master_key(&wrapping, &wrapped, &version_aad())
    }

    fn salt(&self) -> ShroudResult<[u8; SALT_SIZE]> {
        let raw = STANDARD
            .decode(&self.kdf.salt)
            .map_err(|e| ShroudError::Config(format!("invalid KDF salt: {e}")))?;
        raw.try_into()
            .map_err(|_| ShroudError::Config(format!("KDF salt must be {SALT_SIZE} bytes")))
    }

    fn wrap(
        master: &MasterKey,
        password: &SecretString,
        params: KdfParams,
        feature_flags: Vec<FeatureFlag>,
    ) -> ShroudResult<Self> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let wrapping = derive_wrapping_key(password, &salt, &params)?;
        let wrapped = wrap_master_key(&wrapping, master, &version_aad())?;

        Ok(Self {
            creator: concat!("shroudfs ", env!("CARGO_PKG_VERSION")).to_string(),
            version: FORMAT_VERSION,
            kdf: KdfSection {
                salt: STANDARD.encode(salt),
                params,
            },
            encrypted_key: STANDARD.encode(wrapped),
            feature_flags,
        })
    }

    /// Atomic replace: temp file in the same directory, then rename.
    fn write(&self, path: &Path) -> ShroudResult<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| anyhow::anyhow!("config serialization: {e}"))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ShroudError::from_io(e, dir))?;
        tmp.write_all(&json)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(CONFIG_FILE_MODE))?;
        tmp.persist(path)
            .map_err(|e| ShroudError::from_io(e.error, path))?;
        Ok(())
    }
}

fn version_aad() -> [u8; 2] {
    FORMAT_VERSION.to_be_bytes()
}

/// Write a new config at `path` around a fresh random master key.
///
/// Fails with [`ShroudError::PreconditionFailed`] if a non-empty file is
/// already there.
pub fn create(path: &Path, password: &SecretString, opts: &CreateOptions) -> ShroudResult<MasterKey> {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() > 0 {
            return Err(ShroudError::PreconditionFailed(format!(
                "config file {} already exists",
                path.display()
            )));
        }
    }

    let mut flags = Vec::new();
    if opts.long_names {
        flags.push(FeatureFlag::LongNames);
    }
    if opts.plaintext_names {
        flags.push(FeatureFlag::PlaintextNames);
    }

    let master = MasterKey::generate();
    let file = ConfigFile::wrap(&master, password, opts.kdf.clone(), flags)?;
    file.write(path)?;
    tracing::info!(path = %path.display(), flags = ?file.feature_flags, "created config");
    Ok(master)
}

/// Read the config at `path` and unlock it with `password`.
pub fn load(path: &Path, password: &SecretString) -> ShroudResult<(MasterKey, ConfigFile)> {
    let file = ConfigFile::read(path)?;
    let master = file.unlock(password)?;
    tracing::debug!(path = %path.display(), "unlocked config");
    Ok((master, file))
}

/// Change the password. The master key, flags, and cost parameters stay the
/// same; only the salt and the wrapped key change.
pub fn rewrap(path: &Path, old: &SecretString, new: &SecretString) -> ShroudResult<()> {
    let (master, file) = load(path, old)?;
    let rewrapped = ConfigFile::wrap(&master, new, file.kdf.params.clone(), file.feature_flags.clone())?;
    rewrapped.write(path)?;
    tracing::info!(path = %path.display(), "password changed");
    Ok(())
}

/// Forward-mode `init` refuses to initialize over existing content.
pub fn ensure_dir_empty(dir: &Path) -> ShroudResult<()> {
    let mut entries = std::fs::read_dir(dir).map_err(|e| ShroudError::from_io(e, dir))?;
    if entries.next().is_some() {
        return Err(ShroudError::PreconditionFailed(format!(
            "directory {} is not empty",
            dir.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::fast_params;

    fn opts() -> CreateOptions {
        CreateOptions {
            kdf: fast_params(),
            ..CreateOptions::default()
        }
    }

    fn pw(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn test_create_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);

        let created = create(&path, &pw("correct-password"), &opts()).unwrap();
        let (loaded, file) = load(&path, &pw("correct-password")).unwrap();

        assert_eq!(created.as_bytes(), loaded.as_bytes());
        assert_eq!(file.version, FORMAT_VERSION);
        assert!(file.long_names());
        assert!(!file.plaintext_names());
        assert_eq!(file.kdf.params, fast_params());
    }

    #[test]
    fn test_config_file_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        create(&path, &pw("pw"), &opts()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, CONFIG_FILE_MODE);
    }

    #[test]
    fn test_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        create(&path, &pw("right"), &opts()).unwrap();

        assert!(matches!(load(&path, &pw("wrong")), Err(ShroudError::WrongPassword)));
    }

    #[test]
    fn test_corrupted_key_reports_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        create(&path, &pw("pw"), &opts()).unwrap();

        let mut file = ConfigFile::read(&path).unwrap();
        let mut raw = STANDARD.decode(&file.encrypted_key).unwrap();
        raw[40] ^= 0x80;
        file.encrypted_key = STANDARD.encode(raw);
        assert!(matches!(file.unlock(&pw("pw")), Err(ShroudError::WrongPassword)));

        file.encrypted_key = "!!not base64!!".into();
        assert!(matches!(file.unlock(&pw("pw")), Err(ShroudError::WrongPassword)));
    }

    #[test]
    fn test_create_refuses_existing_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        create(&path, &pw("pw"), &opts()).unwrap();

        let err = create(&path, &pw("pw"), &opts()).unwrap_err();
        assert!(matches!(err, ShroudError::PreconditionFailed(_)));
    }

    #[test]
    fn test_create_over_empty_file_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(&path, b"").unwrap();
        create(&path, &pw("pw"), &opts()).unwrap();
        assert!(load(&path, &pw("pw")).is_ok());
    }

    #[test]
    fn test_unknown_version_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        create(&path, &pw("pw"), &opts()).unwrap();

        let mut file = ConfigFile::read(&path).unwrap();
        file.version = 99;
        let other = dir.path().join("v99.conf");
        std::fs::write(&other, serde_json::to_vec(&file).unwrap()).unwrap();

        assert!(matches!(ConfigFile::read(&other), Err(ShroudError::Config(_))));
    }

    #[test]
    fn test_unknown_feature_flag_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        create(&path, &pw("pw"), &opts()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let tampered = text.replace("\"LongNames\"", "\"Compression\"");
        let other = dir.path().join("flags.conf");
        std::fs::write(&other, tampered).unwrap();

        assert!(matches!(ConfigFile::read(&other), Err(ShroudError::Config(_))));
    }

    #[test]
    fn test_missing_config_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigFile::read(&dir.path().join("absent.conf")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rewrap_keeps_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        let master = create(&path, &pw("old"), &opts()).unwrap();
        let before = ConfigFile::read(&path).unwrap();

        rewrap(&path, &pw("old"), &pw("new")).unwrap();

        assert!(matches!(load(&path, &pw("old")), Err(ShroudError::WrongPassword)));
        let (after_key, after) = load(&path, &pw("new")).unwrap();
        assert_eq!(after_key.as_bytes(), master.as_bytes());
        assert_ne!(after.kdf.salt, before.kdf.salt, "rewrap must use a fresh salt");
        assert_eq!(after.kdf.params, before.kdf.params);
        assert_eq!(after.feature_flags, before.feature_flags);
    }

    #[test]
    fn test_rewrap_with_wrong_password_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        create(&path, &pw("old"), &opts()).unwrap();
        let before = std::fs::read(&path).unwrap();

        assert!(rewrap(&path, &pw("nope"), &pw("new")).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_plaintext_names_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        let o = CreateOptions {
            plaintext_names: true,
            ..opts()
        };
        create(&path, &pw("pw"), &o).unwrap();
        assert!(ConfigFile::read(&path).unwrap().plaintext_names());
    }

    #[test]
    fn test_ensure_dir_empty() {
        let dir = tempfile::tempdir().unwrap();
        ensure_dir_empty(dir.path()).unwrap();

        std::fs::write(dir.path().join("file"), b"x").unwrap();
        assert!(matches!(
            ensure_dir_empty(dir.path()),
            Err(ShroudError::PreconditionFailed(_))
        ));
    }
}
