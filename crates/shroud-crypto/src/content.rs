//! Block-structured file content encryption
//!
//! Encrypted file layout (binary):
//! ```text
//! [2 bytes: version, BE][16 bytes: file ID]          file header
//! [24 bytes: nonce][<= 4096 bytes: ciphertext][16 bytes: tag]   block 0
//! [24 bytes: nonce][<= 4096 bytes: ciphertext][16 bytes: tag]   block 1
//! ...
//! AAD   = block_index (8 bytes, BE) || file_id (16 bytes)
//! nonce = keyed BLAKE3(nonce_key; file_id || block_index || plaintext)[..24]
//! ```
//!
//! Only the last block may be short. A zero-length plaintext file is a
//! zero-length ciphertext file: no header is written for it.
//!
//! The AAD binds every block to its position and file, so blocks cannot be
//! reordered or moved between files. The nonce is synthetic: the same
//! (key, nonce) pair can only occur again for the same file, index and
//! plaintext, which produces the same block. Reverse mode re-encrypts on every
//! read and has no place to remember random nonces, so this is what keeps it
//! from ever reusing a nonce when the underlying plaintext changes.

use std::ops::Range;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use shroud_core::{ShroudError, ShroudResult};
use zeroize::Zeroize;

use crate::keys::{MasterKey, BLOCK_NONCE_KEY_INFO, CONTENT_KEY_INFO};
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Plaintext bytes per block
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Current file header version
pub const HEADER_VERSION: u16 = 1;

pub const FILE_ID_LEN: usize = 16;

/// Version (2) + file ID (16)
pub const HEADER_LEN: u64 = 2 + FILE_ID_LEN as u64;

/// Per-block overhead: nonce + tag
pub const BLOCK_OVERHEAD: u64 = (NONCE_SIZE + TAG_SIZE) as u64;

/// The per-file header. The file ID is the file's identity in every block's
/// AAD and nonce derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub file_id: [u8; FILE_ID_LEN],
}

impl FileHeader {
    pub fn new(file_id: [u8; FILE_ID_LEN]) -> Self {
        Self { file_id }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN as usize] {
        let mut out = [0u8; HEADER_LEN as usize];
        out[..2].copy_from_slice(&HEADER_VERSION.to_be_bytes());
        out[2..].copy_from_slice(&self.file_id);
        out
    }

    pub fn parse(data: &[u8]) -> ShroudResult<Self> {
        if data.len() != HEADER_LEN as usize {
            return Err(ShroudError::Format(format!(
                "file header is {} bytes, expected {HEADER_LEN}",
                data.len()
            )));
        }
        let version = u16::from_be_bytes([data[0], data[1]]);
        if version != HEADER_VERSION {
            return Err(ShroudError::Format(format!(
                "unsupported file header version {version}"
            )));
        }
        let mut file_id = [0u8; FILE_ID_LEN];
        file_id.copy_from_slice(&data[2..]);
        Ok(Self { file_id })
    }
}

/// Maps plaintext byte ranges onto the block layout and encrypts/decrypts
/// individual blocks. Immutable after construction; safe to share between
/// threads.
pub struct ContentCodec {
    cipher: XChaCha20Poly1305,
    nonce_key: [u8; KEY_SIZE],
    block_size: u64,
}

impl ContentCodec {
    pub fn new(master: &MasterKey) -> ShroudResult<Self> {
        Self::with_block_size(master, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(master: &MasterKey, block_size: u64) -> ShroudResult<Self> {
        if block_size == 0 {
            return Err(ShroudError::Config("block size must be non-zero".into()));
        }
        let mut content_key = master.derive(CONTENT_KEY_INFO)?;
        let cipher = XChaCha20Poly1305::new((&content_key).into());
        content_key.zeroize();
        Ok(Self {
            cipher,
            nonce_key: master.derive(BLOCK_NONCE_KEY_INFO)?,
            block_size,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Size of a full block on disk
    pub fn cipher_block_size(&self) -> u64 {
        self.block_size + BLOCK_OVERHEAD
    }

    /// Ciphertext file size for a plaintext size. Zero maps to zero (no
    /// header); otherwise header + plaintext + per-block overhead.
    pub fn plain_to_cipher_size(&self, plain_size: u64) -> u64 {
        if plain_size == 0 {
            return 0;
        }
        let blocks = plain_size.div_ceil(self.block_size);
        HEADER_LEN + plain_size + blocks * BLOCK_OVERHEAD
    }

    /// Exact inverse of [`plain_to_cipher_size`](Self::plain_to_cipher_size).
    ///
    /// A header-only file is accepted as empty. Sizes inside the header, or
    /// with a trailing block too short to carry a payload, are format errors.
    pub fn cipher_to_plain_size(&self, cipher_size: u64) -> ShroudResult<u64> {
        if cipher_size == 0 {
            return Ok(0);
        }
        if cipher_size < HEADER_LEN {
            return Err(ShroudError::Format(format!(
                "ciphertext size {cipher_size} is smaller than the {HEADER_LEN}-byte header"
            )));
        }
        let body = cipher_size - HEADER_LEN;
        let full_blocks = body / self.cipher_block_size();
        let tail = body % self.cipher_block_size();
        if tail == 0 {
            return Ok(full_blocks * self.block_size);
        }
        if tail <= BLOCK_OVERHEAD {
            return Err(ShroudError::Format(format!(
                "ciphertext size {cipher_size}: trailing block of {tail} bytes has no payload"
            )));
        }
        Ok(full_blocks * self.block_size + tail - BLOCK_OVERHEAD)
    }

    /// Plaintext offset of the first byte of block `index`
    pub fn block_plain_offset(&self, index: u64) -> u64 {
        index * self.block_size
    }

    /// Ciphertext offset of the first byte of block `index`
    pub fn block_cipher_offset(&self, index: u64) -> u64 {
        HEADER_LEN + index * self.cipher_block_size()
    }

    /// Block indices covering the plaintext range `[offset, offset + len)`.
    pub fn plain_range_blocks(&self, offset: u64, len: u64) -> Range<u64> {
        let first = offset / self.block_size;
        if len == 0 {
            return first..first;
        }
        let last = (offset + len - 1) / self.block_size;
        first..last + 1
    }

    /// Block indices covering the ciphertext range `[offset, offset + len)`.
    /// A range lying entirely inside the header covers no blocks.
    pub fn cipher_range_blocks(&self, offset: u64, len: u64) -> Range<u64> {
        let end = offset + len;
        if len == 0 || end <= HEADER_LEN {
            return 0..0;
        }
        let first = offset.saturating_sub(HEADER_LEN) / self.cipher_block_size();
        let last = (end - 1 - HEADER_LEN) / self.cipher_block_size();
        first..last + 1
    }

    /// Encrypt one block.
    ///
    /// Returns: `[24-byte nonce][ciphertext][16-byte tag]`
    pub fn encrypt_block(
        &self,
        file_id: &[u8; FILE_ID_LEN],
        block_index: u64,
        plaintext: &[u8],
    ) -> ShroudResult<Vec<u8>> {
        if plaintext.is_empty() || plaintext.len() as u64 > self.block_size {
            return Err(ShroudError::Format(format!(
                "block {block_index}: plaintext of {} bytes does not fit a {}-byte block",
                plaintext.len(),
                self.block_size
            )));
        }

        let nonce_bytes = self.synthetic_nonce(file_id, block_index, plaintext);
        let nonce = XNonce::from_slice(&nonce_bytes);
        let aad = build_aad(block_index, file_id);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| anyhow::anyhow!("block {block_index} encryption failed: {e}"))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt one block produced by [`encrypt_block`](Self::encrypt_block).
    ///
    /// Structural problems are [`ShroudError::Format`]; a tag mismatch is
    /// [`ShroudError::Authentication`]. No plaintext is returned on failure.
    pub fn decrypt_block(
        &self,
        file_id: &[u8; FILE_ID_LEN],
        block_index: u64,
        block: &[u8],
    ) -> ShroudResult<Vec<u8>> {
        let len = block.len() as u64;
        if len <= BLOCK_OVERHEAD || len > self.cipher_block_size() {
            return Err(ShroudError::Format(format!(
                "block {block_index}: {len} bytes is not a valid encrypted block"
            )));
        }

        let (nonce_bytes, ciphertext) = block.split_at(NONCE_SIZE);
        let nonce = XNonce::from_slice(nonce_bytes);
        let aad = build_aad(block_index, file_id);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| ShroudError::Authentication(format!("block {block_index}")))
    }

    fn synthetic_nonce(
        &self,
        file_id: &[u8; FILE_ID_LEN],
        block_index: u64,
        plaintext: &[u8],
    ) -> [u8; NONCE_SIZE] {
        let mut hasher = blake3::Hasher::new_keyed(&self.nonce_key);
        hasher.update(file_id);
        hasher.update(&block_index.to_be_bytes());
        hasher.update(plaintext);
        let mut nonce = [0u8; NONCE_SIZE];
        hasher.finalize_xof().fill(&mut nonce);
        nonce
    }
}

impl Drop for ContentCodec {
    fn drop(&mut self) {
        self.nonce_key.zeroize();
    }
}

impl std::fmt::Debug for ContentCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCodec")
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

/// Build AAD: block_index (8 bytes BE) || file_id (16 bytes)
fn build_aad(block_index: u64, file_id: &[u8; FILE_ID_LEN]) -> [u8; 8 + FILE_ID_LEN] {
    let mut aad = [0u8; 8 + FILE_ID_LEN];
    aad[..8].copy_from_slice(&block_index.to_be_bytes());
    aad[8..].copy_from_slice(file_id);
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn codec() -> ContentCodec {
        ContentCodec::new(&MasterKey::from_bytes([7u8; KEY_SIZE])).unwrap()
    }

    #[test]
    fn test_zero_length_has_no_header() {
        let c = codec();
        assert_eq!(c.plain_to_cipher_size(0), 0);
        assert_eq!(c.cipher_to_plain_size(0).unwrap(), 0);
    }

    #[test]
    fn test_header_only_file_is_empty() {
        assert_eq!(codec().cipher_to_plain_size(HEADER_LEN).unwrap(), 0);
    }

    #[test]
    fn test_known_sizes() {
        let c = codec();
        assert_eq!(c.plain_to_cipher_size(1), 18 + 1 + 40);
        assert_eq!(c.plain_to_cipher_size(4096), 18 + 4096 + 40);
        assert_eq!(c.plain_to_cipher_size(4097), 18 + 4097 + 80);
        assert_eq!(c.plain_to_cipher_size(10000), 18 + 10000 + 3 * 40);
    }

    #[test]
    fn test_invalid_cipher_sizes() {
        let c = codec();
        for bad in [1, 17, HEADER_LEN + 1, HEADER_LEN + BLOCK_OVERHEAD] {
            assert!(
                matches!(c.cipher_to_plain_size(bad), Err(ShroudError::Format(_))),
                "size {bad} must be rejected"
            );
        }
        let after_full_block = HEADER_LEN + c.cipher_block_size() + 10;
        assert!(c.cipher_to_plain_size(after_full_block).is_err());
    }

    proptest! {
        #[test]
        fn prop_size_roundtrip(n in 0u64..(1u64 << 40)) {
            let c = codec();
            prop_assert_eq!(c.cipher_to_plain_size(c.plain_to_cipher_size(n)).unwrap(), n);
        }

        #[test]
        fn prop_size_monotonic(n in 0u64..(1u64 << 40), step in 0u64..100_000) {
            let c = codec();
            prop_assert!(c.plain_to_cipher_size(n) <= c.plain_to_cipher_size(n + step));
        }
    }

    #[test]
    fn test_block_roundtrip() {
        let c = codec();
        let file_id = [0xABu8; FILE_ID_LEN];
        let plaintext = b"hello, encrypted world!";

        let block = c.encrypt_block(&file_id, 0, plaintext).unwrap();
        assert_eq!(block.len() as u64, plaintext.len() as u64 + BLOCK_OVERHEAD);
        assert_eq!(c.decrypt_block(&file_id, 0, &block).unwrap(), plaintext);
    }

    #[test]
    fn test_full_block_roundtrip() {
        let c = codec();
        let file_id = [1u8; FILE_ID_LEN];
        let plaintext: Vec<u8> = (0..DEFAULT_BLOCK_SIZE).map(|i| (i % 251) as u8).collect();

        let block = c.encrypt_block(&file_id, 9, &plaintext).unwrap();
        assert_eq!(block.len() as u64, c.cipher_block_size());
        assert_eq!(c.decrypt_block(&file_id, 9, &block).unwrap(), plaintext);
    }

    #[test]
    fn test_every_bit_flip_fails_authentication() {
        let c = codec();
        let file_id = [2u8; FILE_ID_LEN];
        let block = c.encrypt_block(&file_id, 3, b"0123456789abcdef").unwrap();

        for byte in 0..block.len() {
            for bit in 0..8 {
                let mut tampered = block.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    matches!(
                        c.decrypt_block(&file_id, 3, &tampered),
                        Err(ShroudError::Authentication(_))
                    ),
                    "flip at byte {byte} bit {bit} must fail"
                );
            }
        }
    }

    #[test]
    fn test_wrong_block_index_fails() {
        let c = codec();
        let file_id = [0u8; FILE_ID_LEN];
        let block = c.encrypt_block(&file_id, 0, b"secret data").unwrap();

        assert!(matches!(
            c.decrypt_block(&file_id, 1, &block),
            Err(ShroudError::Authentication(_))
        ));
    }

    #[test]
    fn test_wrong_file_id_fails() {
        let c = codec();
        let block = c.encrypt_block(&[0xAA; FILE_ID_LEN], 0, b"secret data").unwrap();

        assert!(c.decrypt_block(&[0xBB; FILE_ID_LEN], 0, &block).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let other = ContentCodec::new(&MasterKey::from_bytes([8u8; KEY_SIZE])).unwrap();
        let file_id = [0u8; FILE_ID_LEN];
        let block = codec().encrypt_block(&file_id, 0, b"secret data").unwrap();

        assert!(other.decrypt_block(&file_id, 0, &block).is_err());
    }

    #[test]
    fn test_nonces_are_bound_to_file_and_index() {
        let c = codec();
        let plaintext = b"same plaintext";
        let a = c.encrypt_block(&[1; FILE_ID_LEN], 0, plaintext).unwrap();
        let b = c.encrypt_block(&[1; FILE_ID_LEN], 1, plaintext).unwrap();
        let d = c.encrypt_block(&[2; FILE_ID_LEN], 0, plaintext).unwrap();

        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a[..NONCE_SIZE], d[..NONCE_SIZE]);
    }

    #[test]
    fn test_changed_plaintext_changes_nonce() {
        let c = codec();
        let file_id = [4; FILE_ID_LEN];
        let v1 = c.encrypt_block(&file_id, 0, b"version one").unwrap();
        let v2 = c.encrypt_block(&file_id, 0, b"version two").unwrap();
        let again = c.encrypt_block(&file_id, 0, b"version one").unwrap();

        assert_ne!(v1[..NONCE_SIZE], v2[..NONCE_SIZE]);
        assert_eq!(v1, again, "encryption is deterministic per (file, index, plaintext)");
    }

    #[test]
    fn test_block_bounds_rejected() {
        let c = codec();
        let file_id = [0u8; FILE_ID_LEN];
        assert!(matches!(c.encrypt_block(&file_id, 0, b""), Err(ShroudError::Format(_))));
        let oversized = vec![0u8; DEFAULT_BLOCK_SIZE as usize + 1];
        assert!(matches!(c.encrypt_block(&file_id, 0, &oversized), Err(ShroudError::Format(_))));
        assert!(matches!(
            c.decrypt_block(&file_id, 0, &[0u8; 40]),
            Err(ShroudError::Format(_))
        ));
    }

    #[test]
    fn test_header_roundtrip_and_version_check() {
        let header = FileHeader::new(*b"0123456789abcdef");
        let bytes = header.to_bytes();
        assert_eq!(FileHeader::parse(&bytes).unwrap(), header);

        let mut bad = bytes;
        bad[1] = 9;
        assert!(matches!(FileHeader::parse(&bad), Err(ShroudError::Format(_))));
        assert!(FileHeader::parse(&bytes[..10]).is_err());
    }

    #[test]
    fn test_plain_range_blocks() {
        let c = codec();
        assert_eq!(c.plain_range_blocks(0, 1), 0..1);
        assert_eq!(c.plain_range_blocks(4000, 500), 0..2);
        assert_eq!(c.plain_range_blocks(4096, 4096), 1..2);
        assert_eq!(c.plain_range_blocks(8192, 0), 2..2);
    }

    #[test]
    fn test_cipher_range_blocks() {
        let c = codec();
        let cbs = c.cipher_block_size();
        assert_eq!(c.cipher_range_blocks(0, HEADER_LEN), 0..0);
        assert_eq!(c.cipher_range_blocks(0, HEADER_LEN + 1), 0..1);
        assert_eq!(c.cipher_range_blocks(HEADER_LEN + cbs - 1, 2), 0..2);
        assert_eq!(c.cipher_range_blocks(HEADER_LEN + cbs, cbs), 1..2);
        assert_eq!(c.block_cipher_offset(2), HEADER_LEN + 2 * cbs);
    }
}
