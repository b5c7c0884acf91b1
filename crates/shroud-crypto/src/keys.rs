//! Key hierarchy: master key generation, subkey derivation, master key wrapping
//!
//! ```text
//! Password ──Argon2id──► Wrapping Key ──XChaCha20-Poly1305──► wrapped Master Key (config file)
//!
//! Master Key (256-bit random, memory-resident only)
//!   ├── Content Key     (HKDF, "shroudfs-content")     XChaCha20-Poly1305 blocks
//!   ├── Block Nonce Key (HKDF, "shroudfs-block-nonce") keyed BLAKE3 synthetic nonces
//!   ├── Name Key        (HKDF, "shroudfs-names")       AES-256-SIV file names
//!   └── Path IV Key     (HKDF, "shroudfs-path-iv")     reverse-mode directory IVs / file IDs
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use shroud_core::{ShroudError, ShroudResult};
use zeroize::Zeroize;

use crate::kdf::WrappingKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

pub(crate) const CONTENT_KEY_INFO: &[u8] = b"shroudfs-content";
pub(crate) const BLOCK_NONCE_KEY_INFO: &[u8] = b"shroudfs-block-nonce";
pub(crate) const NAME_KEY_INFO: &[u8] = b"shroudfs-names";
pub(crate) const PATH_IV_KEY_INFO: &[u8] = b"shroudfs-path-iv";

/// The 256-bit root secret of a mounted tree. Zeroized on drop.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Generate a fresh random master key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// All-zero key. Provides no security; for testing only.
    pub fn zero() -> Self {
        Self {
            bytes: [0u8; KEY_SIZE],
        }
    }

    /// Parse a hex master key. Dashes and whitespace are ignored, so the
    /// grouped form printed by [`MasterKey::to_grouped_hex`] parses back.
    pub fn from_hex(text: &str) -> ShroudResult<Self> {
        let mut digits: Vec<u8> = text
            .bytes()
            .filter(|b| *b != b'-' && !b.is_ascii_whitespace())
            .collect();
        if digits.len() != KEY_SIZE * 2 {
            let found = digits.len();
            digits.zeroize();
            return Err(ShroudError::Format(format!(
                "master key must be {} hex digits, got {found}",
                KEY_SIZE * 2
            )));
        }

        let mut bytes = [0u8; KEY_SIZE];
        for (i, pair) in digits.chunks(2).enumerate() {
            match (hex_value(pair[0]), hex_value(pair[1])) {
                (Some(hi), Some(lo)) => bytes[i] = (hi << 4) | lo,
                _ => {
                    digits.zeroize();
                    bytes.zeroize();
                    return Err(ShroudError::Format("master key contains non-hex characters".into()));
                }
            }
        }
        digits.zeroize();
        Ok(Self { bytes })
    }

    /// Lowercase hex in dash-separated groups of 8 digits.
    pub fn to_grouped_hex(&self) -> String {
        let mut out = String::with_capacity(KEY_SIZE * 2 + KEY_SIZE / 4);
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 && i % 4 == 0 {
                out.push('-');
            }
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    pub(crate) fn derive(&self, info: &[u8]) -> ShroudResult<[u8; KEY_SIZE]> {
        hkdf_derive(&self.bytes, info)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

fn hex_value(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|v| v as u8)
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub(crate) fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> ShroudResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}

/// Wrap (encrypt) the master key under the password-derived key.
///
/// Uses XChaCha20-Poly1305 with a random nonce; `aad` binds the blob to the
/// config format version.
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`
pub fn wrap_master_key(wrapping: &WrappingKey, master: &MasterKey, aad: &[u8]) -> ShroudResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(wrapping.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: &master.as_bytes()[..],
                aad,
            },
        )
        .map_err(|e| anyhow::anyhow!("key wrapping failed: {e}"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Unwrap (decrypt) the master key.
///
/// Every failure, truncated blob included, is reported as
/// [`ShroudError::WrongPassword`].
pub fn unwrap_master_key(wrapping: &WrappingKey, wrapped: &[u8], aad: &[u8]) -> ShroudResult<MasterKey> {
    if wrapped.len() != NONCE_SIZE + KEY_SIZE + TAG_SIZE {
        return Err(ShroudError::WrongPassword);
    }

    let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(wrapping.as_bytes().into());

    let mut plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| ShroudError::WrongPassword)?;

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(MasterKey::from_bytes(key_bytes))
}
