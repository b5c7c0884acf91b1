pub mod config;
pub mod error;
pub mod types;

pub use config::ShroudSettings;
pub use error::{ShroudError, ShroudResult};
pub use types::{AccessMask, Attributes, DirEntry, FileKind};
