//! AES-SIV filename encryption
//!
//! Deterministic encryption (same plaintext + key + directory IV = same
//! ciphertext) is required for filenames: a lookup of a plaintext name must
//! land on exactly one ciphertext name. AES-SIV provides this with
//! authentication (SIV = Synthetic Initialization Vector). The directory IV is
//! bound as associated data, so equal names in different directories encrypt
//! differently.
//!
//! Encoded names longer than [`NAME_MAX`] are replaced by
//! `shroudfs.longname.<base64url(SHA-256(encoding))>`, and the full encoding is
//! kept in a side record named `<that name>.name`.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use aes_siv::{
    aead::{Aead, KeyInit, Payload},
    Aes256SivAead, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use shroud_core::{ShroudError, ShroudResult};
use zeroize::Zeroize;

use crate::keys::{MasterKey, NAME_KEY_INFO};

/// Per-directory IV file name
pub const DIRIV_FILENAME: &str = "shroudfs.diriv";
pub const DIRIV_LEN: usize = 16;

pub const LONGNAME_PREFIX: &str = "shroudfs.longname.";
pub const LONGNAME_SUFFIX: &str = ".name";

/// Host limit for a single path component
pub const NAME_MAX: usize = 255;

/// AES-SIV synthetic IV prepended to every encrypted name
const SIV_TAG_LEN: usize = 16;

const SIV_KEY_INFO: &[u8] = b"shroudfs-name-aes-siv";

pub type DirIv = [u8; DIRIV_LEN];

/// Result of encrypting one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptedName {
    /// Fits in one path component as-is
    Short(String),
    /// Over-length: `hashed` is the on-disk name, `encoded` goes in the side
    /// record
    Long { hashed: String, encoded: String },
}

impl EncryptedName {
    /// The name that appears in the ciphertext directory.
    pub fn file_name(&self) -> &str {
        match self {
            EncryptedName::Short(name) => name,
            EncryptedName::Long { hashed, .. } => hashed,
        }
    }

    /// Name and content of the side record, for long names.
    pub fn side_record(&self) -> Option<(String, &str)> {
        match self {
            EncryptedName::Short(_) => None,
            EncryptedName::Long { hashed, encoded } => {
                Some((format!("{hashed}{LONGNAME_SUFFIX}"), encoded.as_str()))
            }
        }
    }
}

/// `shroudfs.longname.*` without the `.name` suffix
pub fn is_long_name(name: &OsStr) -> bool {
    let bytes = name.as_bytes();
    bytes.starts_with(LONGNAME_PREFIX.as_bytes()) && !bytes.ends_with(LONGNAME_SUFFIX.as_bytes())
}

/// `shroudfs.longname.*.name`
pub fn is_long_name_record(name: &OsStr) -> bool {
    let bytes = name.as_bytes();
    bytes.starts_with(LONGNAME_PREFIX.as_bytes()) && bytes.ends_with(LONGNAME_SUFFIX.as_bytes())
}

/// Hashed on-disk name for a long encoding.
pub fn hash_long_name(encoded: &str) -> String {
    let digest = Sha256::digest(encoded.as_bytes());
    format!("{LONGNAME_PREFIX}{}", URL_SAFE_NO_PAD.encode(digest))
}

/// Reject names that can never be a single path component.
pub fn validate_plain_name(name: &[u8]) -> ShroudResult<()> {
    if name.is_empty() || name == b"." || name == b".." {
        return Err(ShroudError::Format(format!(
            "{:?} is not a valid file name",
            String::from_utf8_lossy(name)
        )));
    }
    if name.contains(&b'/') || name.contains(&0) {
        return Err(ShroudError::Format(format!(
            "file name {:?} contains '/' or NUL",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

/// Source of the full encoding behind a hashed long name.
pub trait LongNameLookup {
    fn long_name_encoding(&self, hashed: &str) -> ShroudResult<String>;
}

impl LongNameLookup for HashMap<String, String> {
    fn long_name_encoding(&self, hashed: &str) -> ShroudResult<String> {
        self.get(hashed)
            .cloned()
            .ok_or_else(|| ShroudError::NotFound(format!("{hashed}{LONGNAME_SUFFIX}")))
    }
}

/// For contexts where no side records exist.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLongNames;

impl LongNameLookup for NoLongNames {
    fn long_name_encoding(&self, hashed: &str) -> ShroudResult<String> {
        Err(ShroudError::NotFound(format!("{hashed}{LONGNAME_SUFFIX}")))
    }
}

pub struct NameCodec {
    cipher: Aes256SivAead,
    long_names: bool,
}

impl NameCodec {
    /// `long_names` selects whether over-length encodings are hashed or
    /// rejected with [`ShroudError::NameTooLong`].
    pub fn new(master: &MasterKey, long_names: bool) -> ShroudResult<Self> {
        // AES-256-SIV takes a 64-byte key (two 32-byte sub-keys)
        let mut name_key = master.derive(NAME_KEY_INFO)?;
        let mut double_key = [0u8; 64];
        let hkdf = hkdf::Hkdf::<sha2::Sha256>::new(None, &name_key);
        hkdf.expand(SIV_KEY_INFO, &mut double_key)
            .map_err(|e| anyhow::anyhow!("HKDF expand for AES-SIV: {e}"))?;
        name_key.zeroize();

        let cipher = Aes256SivAead::new((&double_key).into());
        double_key.zeroize();
        Ok(Self { cipher, long_names })
    }

    pub fn encrypt_name(&self, name: &OsStr, dir_iv: &DirIv) -> ShroudResult<EncryptedName> {
        validate_plain_name(name.as_bytes())?;

        // zero nonce: determinism comes from SIV, uniqueness from the AAD
        let nonce = Nonce::default();
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: name.as_bytes(),
                    aad: dir_iv,
                },
            )
            .map_err(|e| anyhow::anyhow!("filename encryption failed: {e}"))?;

        let encoded = URL_SAFE_NO_PAD.encode(&ciphertext);
        if encoded.len() <= NAME_MAX {
            return Ok(EncryptedName::Short(encoded));
        }
        if !self.long_names {
            return Err(ShroudError::NameTooLong(name.to_string_lossy().into_owned()));
        }
        Ok(EncryptedName::Long {
            hashed: hash_long_name(&encoded),
            encoded,
        })
    }

    /// Decrypt one ciphertext name. Hashed long names are resolved through
    /// `lookup`, and the record's content must hash back to the name.
    pub fn decrypt_name(
        &self,
        cipher_name: &OsStr,
        dir_iv: &DirIv,
        lookup: &dyn LongNameLookup,
    ) -> ShroudResult<OsString> {
        let name = cipher_name.to_str().ok_or_else(|| {
            ShroudError::Format(format!("{} is not an encrypted name", cipher_name.to_string_lossy()))
        })?;

        let encoded = if is_long_name(cipher_name) {
            let encoded = lookup.long_name_encoding(name)?;
            if hash_long_name(&encoded) != name {
                return Err(ShroudError::Format(format!(
                    "long name record for {name} does not match its hash"
                )));
            }
            encoded
        } else {
            name.to_string()
        };

        let ciphertext = URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map_err(|e| ShroudError::Format(format!("{name}: invalid base64: {e}")))?;
        if ciphertext.len() <= SIV_TAG_LEN {
            return Err(ShroudError::Format(format!("{name}: ciphertext too short")));
        }

        let nonce = Nonce::default();
        let plaintext = self
            .cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: &ciphertext,
                    aad: dir_iv,
                },
            )
            .map_err(|_| ShroudError::Authentication(format!("file name {name}")))?;

        validate_plain_name(&plaintext)?;
        Ok(OsString::from_vec(plaintext))
    }
}

impl std::fmt::Debug for NameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameCodec")
            .field("long_names", &self.long_names)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const IV_A: DirIv = [0x11; DIRIV_LEN];
    const IV_B: DirIv = [0x22; DIRIV_LEN];

    fn codec() -> NameCodec {
        NameCodec::new(&MasterKey::from_bytes([0x55; 32]), true).unwrap()
    }

    fn short(name: &EncryptedName) -> &str {
        match name {
            EncryptedName::Short(s) => s,
            other => panic!("expected a short name, got {other:?}"),
        }
    }

    #[test]
    fn test_encrypt_decrypt_name_roundtrip() {
        let c = codec();
        let encrypted = c.encrypt_name(OsStr::new("my-photo.jpg"), &IV_A).unwrap();
        let decrypted = c
            .decrypt_name(OsStr::new(short(&encrypted)), &IV_A, &NoLongNames)
            .unwrap();
        assert_eq!(decrypted, "my-photo.jpg");
    }

    #[test]
    fn test_deterministic_encryption() {
        let c = codec();
        let enc1 = c.encrypt_name(OsStr::new("report.pdf"), &IV_A).unwrap();
        let enc2 = c.encrypt_name(OsStr::new("report.pdf"), &IV_A).unwrap();
        assert_eq!(enc1, enc2, "AES-SIV must be deterministic");
    }

    #[test]
    fn test_dir_iv_changes_ciphertext() {
        let c = codec();
        let a = c.encrypt_name(OsStr::new("same.txt"), &IV_A).unwrap();
        let b = c.encrypt_name(OsStr::new("same.txt"), &IV_B).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_dir_iv_fails_authentication() {
        let c = codec();
        let enc = c.encrypt_name(OsStr::new("secret.txt"), &IV_A).unwrap();
        let err = c
            .decrypt_name(OsStr::new(short(&enc)), &IV_B, &NoLongNames)
            .unwrap_err();
        assert!(matches!(err, ShroudError::Authentication(_)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let other = NameCodec::new(&MasterKey::from_bytes([0x66; 32]), true).unwrap();
        let enc = codec().encrypt_name(OsStr::new("secret.txt"), &IV_A).unwrap();
        assert!(other
            .decrypt_name(OsStr::new(short(&enc)), &IV_A, &NoLongNames)
            .is_err());
    }

    #[test]
    fn test_output_is_url_safe() {
        let c = codec();
        for name in ["a", "résumé.pdf", "name with spaces", "?><|*"] {
            let enc = c.encrypt_name(OsStr::new(name), &IV_A).unwrap();
            assert!(short(&enc)
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
        }
    }

    #[test]
    fn test_long_name_boundary() {
        let c = codec();
        // 175 + 16 = 191 bytes -> 255 base64 chars
        let fits = "x".repeat(175);
        let over = "x".repeat(176);
        assert!(matches!(
            c.encrypt_name(OsStr::new(&fits), &IV_A).unwrap(),
            EncryptedName::Short(s) if s.len() == NAME_MAX
        ));
        assert!(matches!(
            c.encrypt_name(OsStr::new(&over), &IV_A).unwrap(),
            EncryptedName::Long { .. }
        ));
    }

    #[test]
    fn test_long_name_roundtrip_through_record() {
        let c = codec();
        let plain = "L".repeat(240);
        let enc = c.encrypt_name(OsStr::new(&plain), &IV_A).unwrap();

        let hashed = enc.file_name().to_string();
        assert!(hashed.starts_with(LONGNAME_PREFIX));
        assert!(hashed.len() <= NAME_MAX);
        assert!(is_long_name(OsStr::new(&hashed)));

        let (record_name, content) = enc.side_record().unwrap();
        assert_eq!(record_name, format!("{hashed}.name"));
        assert!(is_long_name_record(OsStr::new(&record_name)));

        let mut records = HashMap::new();
        records.insert(hashed.clone(), content.to_string());
        let decrypted = c.decrypt_name(OsStr::new(&hashed), &IV_A, &records).unwrap();
        assert_eq!(decrypted, OsString::from(plain));
    }

    #[test]
    fn test_long_name_without_record_is_not_found() {
        let c = codec();
        let enc = c.encrypt_name(OsStr::new(&"L".repeat(240)), &IV_A).unwrap();
        let err = c
            .decrypt_name(OsStr::new(enc.file_name()), &IV_A, &NoLongNames)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_mismatched_long_name_record_is_format_error() {
        let c = codec();
        let enc = c.encrypt_name(OsStr::new(&"L".repeat(240)), &IV_A).unwrap();
        let mut records = HashMap::new();
        records.insert(enc.file_name().to_string(), "AAAA".to_string());
        let err = c
            .decrypt_name(OsStr::new(enc.file_name()), &IV_A, &records)
            .unwrap_err();
        assert!(matches!(err, ShroudError::Format(_)));
    }

    #[test]
    fn test_long_names_disabled() {
        let c = NameCodec::new(&MasterKey::from_bytes([0x55; 32]), false).unwrap();
        let err = c.encrypt_name(OsStr::new(&"x".repeat(200)), &IV_A).unwrap_err();
        assert!(matches!(err, ShroudError::NameTooLong(_)));
    }

    #[test]
    fn test_invalid_plain_names_rejected() {
        let c = codec();
        for bad in ["", ".", "..", "a/b"] {
            assert!(
                matches!(c.encrypt_name(OsStr::new(bad), &IV_A), Err(ShroudError::Format(_))),
                "{bad:?} must be rejected"
            );
        }
        assert!(validate_plain_name(b"nul\0byte").is_err());
    }

    #[test]
    fn test_garbage_cipher_names_are_format_errors() {
        let c = codec();
        for bad in ["not*base64", "AAAA", "c2hvcnQ"] {
            assert!(
                matches!(
                    c.decrypt_name(OsStr::new(bad), &IV_A, &NoLongNames),
                    Err(ShroudError::Format(_))
                ),
                "{bad:?} must be a format error"
            );
        }
        let non_utf8 = OsStr::from_bytes(&[0xff, 0xfe]);
        assert!(matches!(
            c.decrypt_name(non_utf8, &IV_A, &NoLongNames),
            Err(ShroudError::Format(_))
        ));
    }

    #[test]
    fn test_non_utf8_plain_name_roundtrip() {
        let c = codec();
        let plain = OsStr::from_bytes(b"caf\xe9.txt");
        let enc = c.encrypt_name(plain, &IV_A).unwrap();
        let dec = c
            .decrypt_name(OsStr::new(enc.file_name()), &IV_A, &NoLongNames)
            .unwrap();
        assert_eq!(dec, plain);
    }

    proptest! {
        #[test]
        fn prop_name_roundtrip(name in "[^/\\x00]{1,120}", iv in any::<[u8; DIRIV_LEN]>()) {
            prop_assume!(name != "." && name != "..");
            let c = codec();
            let enc = c.encrypt_name(OsStr::new(&name), &iv).unwrap();
            let mut records = HashMap::new();
            if let Some((_, content)) = enc.side_record() {
                records.insert(enc.file_name().to_string(), content.to_string());
            }
            let dec = c.decrypt_name(OsStr::new(enc.file_name()), &iv, &records).unwrap();
            prop_assert_eq!(dec, OsString::from(name));
        }
    }
}
