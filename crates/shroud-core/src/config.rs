use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ShroudError, ShroudResult};

/// Top-level application settings (loaded from settings.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShroudSettings {
    pub log: LogConfig,
    pub kdf: KdfConfig,
    pub mount: MountConfig,
    pub reverse: ReverseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or EnvFilter directive (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Argon2id cost parameters used when creating a new config file.
/// Existing config files keep the parameters they were created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Kernel attribute/entry cache TTL in seconds (default: 1)
    pub attr_ttl_secs: u64,
    /// Allow other users to access the mount
    pub allow_other: bool,
    /// Filesystem name shown by `df` (default: shroudfs)
    pub fs_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverseConfig {
    /// Glob patterns (relative to the plaintext root) hidden from the
    /// encrypted view, in addition to the config file itself
    pub exclude: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            attr_ttl_secs: 1,
            allow_other: false,
            fs_name: "shroudfs".into(),
        }
    }
}

impl ShroudSettings {
    /// Load settings from `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> ShroudResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "settings file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ShroudError::from_io(e, path))?;
        toml::from_str(&content)
            .map_err(|e| ShroudError::Config(format!("parsing {}: {e}", path.display())))
    }
}
