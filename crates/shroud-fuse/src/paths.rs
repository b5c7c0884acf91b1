//! Path predicates shared by the views.
//!
//! Every handler normalizes its path with [`relative`] and asks these
//! predicates before touching the host tree.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use shroud_core::{ShroudError, ShroudResult};
use shroud_crypto::names::is_long_name_record;
use shroud_crypto::{CONFIG_FILENAME, DIRIV_FILENAME};

/// Strip the root and `.` components: "/a/./b" → "a/b", "/" → "".
///
/// `..` is rejected; the kernel never sends it and a view must not escape
/// its root.
pub fn relative(path: &Path) -> ShroudResult<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ShroudError::PermissionDenied(path.display().to_string()))
            }
        }
    }
    Ok(out)
}

/// A single path component naming the per-directory IV file.
pub fn is_dir_iv_name(name: &OsStr) -> bool {
    name == OsStr::new(DIRIV_FILENAME)
}

/// A single path component naming a long-name side record.
pub fn is_long_name_record_name(name: &OsStr) -> bool {
    is_long_name_record(name)
}

/// Last component is the per-directory IV file.
pub fn is_dir_iv_path(path: &Path) -> bool {
    path.file_name().is_some_and(is_dir_iv_name)
}

/// Last component is a long-name side record.
pub fn is_long_name_record_path(path: &Path) -> bool {
    path.file_name().is_some_and(is_long_name_record_name)
}

/// The config file sitting directly in the view root.
pub fn is_root_config_path(rel: &Path) -> bool {
    rel == Path::new(CONFIG_FILENAME)
}

/// Plaintext paths hidden from a view: the root config file plus any
/// configured glob patterns.
#[derive(Debug, Clone, Default)]
pub struct ExcludePolicy {
    patterns: Vec<glob::Pattern>,
}

impl ExcludePolicy {
    pub fn new(patterns: &[String]) -> ShroudResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| ShroudError::Config(format!("invalid exclude pattern {p:?}: {e}")))
            })
            .collect::<ShroudResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }
}

/// Whether `rel` (relative to the plaintext root) is hidden.
///
/// A pattern matches either the whole relative path or the entry's own name,
/// so `cache/**` hides a subtree and `*.tmp` hides matching files anywhere.
/// Callers check every prefix of a path, so hiding a directory hides its
/// contents.
pub fn is_excluded_path(rel: &Path, policy: &ExcludePolicy) -> bool {
    if is_root_config_path(rel) {
        return true;
    }
    let name = rel.file_name().and_then(OsStr::to_str);
    policy.patterns.iter().any(|p| {
        p.matches_path(rel) || name.is_some_and(|n| p.matches(n))
    })
}
