use std::io;
use std::path::Path;

use thiserror::Error;

pub type ShroudResult<T> = Result<T, ShroudError>;

#[derive(Debug, Error)]
pub enum ShroudError {
    /// Malformed or unsupported config file.
    #[error("config error: {0}")]
    Config(String),

    /// Authenticated unwrap of the master key failed. Deliberately carries no
    /// detail: a bad password and a corrupted key blob look the same.
    #[error("wrong password")]
    WrongPassword,

    #[error("format error: {0}")]
    Format(String),

    /// A block or name failed its integrity tag.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShroudError {
    /// Classify a host I/O error into the pass-through variants.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        let shown = path.display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => ShroudError::NotFound(shown),
            io::ErrorKind::PermissionDenied => ShroudError::PermissionDenied(shown),
            _ if err.raw_os_error() == Some(libc::ENOTDIR) => ShroudError::NotADirectory(shown),
            _ => ShroudError::Io(err),
        }
    }

    /// Host status code for this error, as reported through FUSE.
    pub fn errno(&self) -> i32 {
        match self {
            ShroudError::NotFound(_) => libc::ENOENT,
            ShroudError::PermissionDenied(_) => libc::EPERM,
            ShroudError::NotADirectory(_) => libc::ENOTDIR,
            ShroudError::NameTooLong(_) => libc::ENAMETOOLONG,
            ShroudError::PreconditionFailed(_) => libc::EEXIST,
            ShroudError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            ShroudError::Config(_)
            | ShroudError::WrongPassword
            | ShroudError::Format(_)
            | ShroudError::Authentication(_)
            | ShroudError::Other(_) => libc::EIO,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ShroudError::NotFound(_))
    }
}
