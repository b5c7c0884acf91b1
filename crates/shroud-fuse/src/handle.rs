//! Open-file handles for the views.

use std::fs::File;
use std::sync::Arc;

use shroud_core::ShroudResult;
use shroud_crypto::{ContentCodec, FileHeader, FILE_ID_LEN, HEADER_LEN};

use crate::lower::{read_full_at, FileHandle};

/// Virtual file served from memory (directory IVs, long-name records).
pub struct MemoryFile {
    data: Vec<u8>,
}

impl MemoryFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl FileHandle for MemoryFile {
    fn read_at(&self, offset: u64, size: usize) -> ShroudResult<Vec<u8>> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(Vec::new());
        }
        let end = (offset + size as u64).min(len);
        Ok(self.data[offset as usize..end as usize].to_vec())
    }
}

/// Plaintext file presented as ciphertext. Blocks are encrypted on demand
/// for each read; nothing is cached.
pub struct ReverseFile {
    file: File,
    content: Arc<ContentCodec>,
    header: FileHeader,
}

impl ReverseFile {
    pub fn new(file: File, content: Arc<ContentCodec>, file_id: [u8; FILE_ID_LEN]) -> Self {
        Self {
            file,
            content,
            header: FileHeader::new(file_id),
        }
    }
}

impl FileHandle for ReverseFile {
    fn read_at(&self, offset: u64, size: usize) -> ShroudResult<Vec<u8>> {
        // sized per read: the plaintext may change while open
        let plain_size = self.file.metadata()?.len();
        let cipher_size = self.content.plain_to_cipher_size(plain_size);
        if size == 0 || offset >= cipher_size {
            return Ok(Vec::new());
        }
        let end = (offset + size as u64).min(cipher_size);

        let blocks = self.content.cipher_range_blocks(offset, end - offset);
        let cover_start = if offset < HEADER_LEN {
            0
        } else {
            self.content.block_cipher_offset(blocks.start)
        };

        let mut covered = Vec::with_capacity((end - cover_start) as usize);
        if cover_start == 0 {
            covered.extend_from_slice(&self.header.to_bytes());
        }
        for index in blocks {
            let plain = read_full_at(
                &self.file,
                self.content.block_plain_offset(index),
                self.content.block_size() as usize,
            )?;
            if plain.is_empty() {
                // truncated since the size was taken
                break;
            }
            let short = (plain.len() as u64) < self.content.block_size();
            covered.extend(self.content.encrypt_block(&self.header.file_id, index, &plain)?);
            if short {
                break;
            }
        }

        let from = (offset - cover_start) as usize;
        let to = ((end - cover_start) as usize).min(covered.len());
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(covered[from..to].to_vec())
    }
}

/// Ciphertext file presented as plaintext.
pub struct ForwardFile {
    file: File,
    content: Arc<ContentCodec>,
    /// `None` for an empty (headerless) file
    header: Option<FileHeader>,
}

impl ForwardFile {
    pub fn open(file: File, content: Arc<ContentCodec>) -> ShroudResult<Self> {
        let raw = read_full_at(&file, 0, HEADER_LEN as usize)?;
        let header = if raw.is_empty() {
            None
        } else {
            Some(FileHeader::parse(&raw)?)
        };
        Ok(Self {
            file,
            content,
            header,
        })
    }
}

impl FileHandle for ForwardFile {
    fn read_at(&self, offset: u64, size: usize) -> ShroudResult<Vec<u8>> {
        let Some(header) = &self.header else {
            return Ok(Vec::new());
        };
        let plain_size = self
            .content
            .cipher_to_plain_size(self.file.metadata()?.len())?;
        if size == 0 || offset >= plain_size {
            return Ok(Vec::new());
        }
        let end = (offset + size as u64).min(plain_size);

        let blocks = self.content.plain_range_blocks(offset, end - offset);
        let cover_start = self.content.block_plain_offset(blocks.start);
        let mut covered = Vec::with_capacity((end - cover_start) as usize);
        for index in blocks {
            let block = read_full_at(
                &self.file,
                self.content.block_cipher_offset(index),
                self.content.cipher_block_size() as usize,
            )?;
            if block.is_empty() {
                break;
            }
            covered.extend(self.content.decrypt_block(&header.file_id, index, &block)?);
        }

        let from = (offset - cover_start) as usize;
        let to = ((end - cover_start) as usize).min(covered.len());
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(covered[from..to].to_vec())
    }
}
