//! shroud-crypto: key handling and codecs for shroudfs
//!
//! Architecture: fixed-size blocks, each sealed with XChaCha20-Poly1305
//!
//! Pipeline (reverse mode): plaintext file → 4 KiB blocks → encrypt per block → header + blocks
//!
//! Key hierarchy:
//! ```text
//! Password ──Argon2id──► Wrapping Key ──► Master Key (wrapped in shroudfs.conf)
//!   ├── Content Key     (HKDF, "shroudfs-content")     block AEAD, AAD = block_idx || file_id
//!   ├── Block Nonce Key (HKDF, "shroudfs-block-nonce") synthetic per-block nonces
//!   ├── Name Key        (HKDF, "shroudfs-names")       AES-SIV, AAD = directory IV
//!   └── Path IV Key     (HKDF, "shroudfs-path-iv")     reverse-mode directory IVs and file IDs
//! ```

pub mod conffile;
pub mod content;
pub mod kdf;
pub mod keys;
pub mod names;
pub mod pathiv;

pub use conffile::{ConfigFile, CreateOptions, FeatureFlag, CONFIG_FILENAME};
pub use content::{ContentCodec, FileHeader, DEFAULT_BLOCK_SIZE, FILE_ID_LEN, HEADER_LEN};
pub use kdf::{derive_wrapping_key, KdfParams, WrappingKey};
pub use keys::MasterKey;
pub use names::{
    DirIv, EncryptedName, LongNameLookup, NameCodec, NoLongNames, DIRIV_FILENAME, DIRIV_LEN,
};
pub use pathiv::PathIvDeriver;

/// Size of a master key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the Argon2id salt
pub const SALT_SIZE: usize = 16;
