//! Key derivation: Argon2id password → key-wrapping key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use shroud_core::{ShroudError, ShroudResult};
use zeroize::Zeroize;

use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit key derived from the user's password. Used only to wrap and
/// unwrap the master key; never touches file content.
///
/// Zeroized on drop to prevent secrets lingering in memory.
pub struct WrappingKey {
    bytes: [u8; KEY_SIZE],
}

impl WrappingKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for WrappingKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for KDF
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&shroud_core::config::KdfConfig> for KdfParams {
    fn from(cfg: &shroud_core::config::KdfConfig) -> Self {
        Self {
            mem_cost_kib: cfg.mem_cost_kib,
            time_cost: cfg.time_cost,
            parallelism: cfg.parallelism,
        }
    }
}

/// Derive the key-wrapping key from a password and salt using Argon2id.
///
/// Invalid cost parameters are a config error: they can only come from a
/// damaged config file or bad settings.
pub fn derive_wrapping_key(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> ShroudResult<WrappingKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| ShroudError::Config(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| ShroudError::Config(format!("Argon2id KDF failed: {e}")))?;

    Ok(WrappingKey { bytes: key })
}

#[cfg(test)]
pub(crate) fn fast_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn test_kdf_deterministic() {
        let password = SecretString::from("test-passphrase-123");
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_wrapping_key(&password, &salt, &fast_params()).unwrap();
        let key2 = derive_wrapping_key(&password, &salt, &fast_params()).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_passwords() {
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_wrapping_key(&SecretString::from("password-a"), &salt, &fast_params()).unwrap();
        let key2 = derive_wrapping_key(&SecretString::from("password-b"), &salt, &fast_params()).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_different_salts() {
        let password = SecretString::from("same-password");

        let key1 = derive_wrapping_key(&password, &[1u8; SALT_SIZE], &fast_params()).unwrap();
        let key2 = derive_wrapping_key(&password, &[2u8; SALT_SIZE], &fast_params()).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_rejects_invalid_params() {
        let params = KdfParams {
            mem_cost_kib: 1,
            time_cost: 0,
            parallelism: 0,
        };
        let err = derive_wrapping_key(&SecretString::from("x"), &[0u8; SALT_SIZE], &params).unwrap_err();
        assert!(matches!(err, ShroudError::Config(_)));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = derive_wrapping_key(&SecretString::from("pw"), &[3u8; SALT_SIZE], &fast_params()).unwrap();
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
