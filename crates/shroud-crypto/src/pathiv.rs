//! Deterministic IVs for reverse mode
//!
//! A reverse view cannot store directory IVs or file headers next to the
//! plaintext, so both are derived from the plaintext path relative to the
//! root. The same tree under the same key always yields the same encrypted
//! view; renaming a file changes its file ID and therefore its ciphertext.

use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path};

use shroud_core::ShroudResult;
use zeroize::Zeroize;

use crate::content::FILE_ID_LEN;
use crate::keys::{MasterKey, PATH_IV_KEY_INFO};
use crate::names::{DirIv, DIRIV_LEN};
use crate::KEY_SIZE;

const DIR_IV_LABEL: &[u8] = b"diriv\0";
const FILE_ID_LABEL: &[u8] = b"fileid\0";

pub struct PathIvDeriver {
    key: [u8; KEY_SIZE],
}

impl PathIvDeriver {
    pub fn new(master: &MasterKey) -> ShroudResult<Self> {
        Ok(Self {
            key: master.derive(PATH_IV_KEY_INFO)?,
        })
    }

    /// IV of the directory at `plain_rel` ("" or "/" for the root).
    pub fn dir_iv(&self, plain_rel: &Path) -> DirIv {
        self.derive(DIR_IV_LABEL, plain_rel)
    }

    /// File ID used in the synthesized header of the file at `plain_rel`.
    pub fn file_id(&self, plain_rel: &Path) -> [u8; FILE_ID_LEN] {
        self.derive(FILE_ID_LABEL, plain_rel)
    }

    fn derive(&self, label: &[u8], path: &Path) -> [u8; 16] {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(label);
        // "a/b", "/a/b" and "./a/b/" all name the same entry
        let mut first = true;
        for component in path.components() {
            if let Component::Normal(part) = component {
                if !first {
                    hasher.update(b"/");
                }
                hasher.update(part.as_bytes());
                first = false;
            }
        }
        let mut out = [0u8; DIRIV_LEN];
        hasher.finalize_xof().fill(&mut out);
        out
    }
}

impl Drop for PathIvDeriver {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for PathIvDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathIvDeriver").finish_non_exhaustive()
    }
}
