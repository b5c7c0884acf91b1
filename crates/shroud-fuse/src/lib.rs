//! shroud-fuse: encrypted and decrypted views over a host directory, and the
//! async FUSE driver that mounts them
//!
//! Reverse mode: plaintext tree → encrypted read-only view (backups)
//! Forward mode: encrypted tree → plaintext read-only view (restores)
//!
//! Both views implement [`FileSystem`] over a [`Loopback`] of the host
//! directory; the driver is generic over that trait.

pub mod driver;
pub mod forward;
pub mod handle;
pub mod lower;
pub mod paths;
pub mod reverse;

// Re-export the mount API when the fuse feature is enabled
#[cfg(feature = "fuse")]
pub use driver::{mount, MountConfig, ShroudFuse};

pub use forward::ForwardFs;
pub use lower::{FileHandle, FileSystem, Loopback};
pub use paths::{
    is_dir_iv_name, is_dir_iv_path, is_excluded_path, is_long_name_record_name,
    is_long_name_record_path, ExcludePolicy,
};
pub use reverse::{ReverseFs, ReverseNode, ViewOptions};
