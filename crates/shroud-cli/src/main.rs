//! shroudfs: encrypted overlay filesystem CLI
//!
//! Commands:
//!   init <dir> [--reverse]          - create a config (forward: empty cipher dir; reverse: plaintext dir)
//!   passwd <dir>                    - change the config password
//!   show-key <dir>                  - print the master key for offline recovery
//!   mount <dir> <mountpoint>        - mount the decrypted (forward) or encrypted (reverse) view
//!   unmount <mountpoint>            - unmount a shroudfs mountpoint

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use shroud_core::ShroudSettings;
use shroud_crypto::conffile::{self, ConfigFile, CreateOptions};
use shroud_crypto::{KdfParams, MasterKey, CONFIG_FILENAME, DIRIV_FILENAME, DIRIV_LEN};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "shroudfs",
    version,
    about = "Encrypted overlay filesystem",
    long_about = "shroudfs: per-file authenticated encryption as a FUSE overlay, \
                  forward (decrypt a cipher tree) or reverse (encrypt a plaintext tree)"
)]
struct Cli {
    /// Path to settings.toml
    #[arg(
        long,
        short = 's',
        env = "SHROUDFS_SETTINGS",
        default_value = "/etc/shroudfs/settings.toml"
    )]
    settings: PathBuf,

    /// Log level or filter directive (overrides settings)
    #[arg(long, env = "SHROUDFS_LOG")]
    log: Option<String>,

    /// Log format (overrides settings)
    #[arg(long, env = "SHROUDFS_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new config and master key
    ///
    /// Forward mode requires an empty directory. Reverse mode stores the
    /// config inside the plaintext directory; it is hidden from the view.
    Init {
        dir: PathBuf,
        /// Initialize for reverse mode
        #[arg(long)]
        reverse: bool,
        /// Do not encrypt file names
        #[arg(long)]
        plaintext_names: bool,
        /// Reject names whose encryption exceeds 255 bytes instead of hashing them
        #[arg(long)]
        no_long_names: bool,
        /// Config file location (default: <dir>/shroudfs.conf)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Change the password protecting the master key
    Passwd {
        dir: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the master key, for writing down and keeping offline
    #[command(name = "show-key")]
    ShowKey {
        dir: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Mount a view of <dir> (requires FUSE); runs in the foreground
    #[cfg(feature = "fuse")]
    Mount {
        dir: PathBuf,
        mountpoint: PathBuf,
        /// Serve an encrypted view of a plaintext directory
        #[arg(long)]
        reverse: bool,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Use this master key (hex, dashes allowed) instead of the config password
        #[arg(long, conflicts_with = "zerokey")]
        masterkey: Option<String>,
        /// Use an all-zero master key (testing only, no security)
        #[arg(long)]
        zerokey: bool,
        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount a shroudfs mountpoint (requires FUSE)
    #[cfg(feature = "fuse")]
    Unmount { mountpoint: PathBuf },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = ShroudSettings::load(&cli.settings)
        .with_context(|| format!("loading settings {}", cli.settings.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| settings.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match settings.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        settings = %cli.settings.display(),
        "shroudfs starting"
    );

    match cli.command {
        Commands::Init {
            dir,
            reverse,
            plaintext_names,
            no_long_names,
            config,
        } => cmd_init(&settings, &dir, reverse, plaintext_names, !no_long_names, config),
        Commands::Passwd { dir, config } => cmd_passwd(&dir, config),
        Commands::ShowKey { dir, config } => cmd_show_key(&dir, config),
        #[cfg(feature = "fuse")]
        Commands::Mount {
            dir,
            mountpoint,
            reverse,
            config,
            masterkey,
            zerokey,
            allow_other,
        } => {
            let source = KeySource::from_flags(masterkey, zerokey);
            cmd_mount(&settings, &dir, &mountpoint, reverse, config, source, allow_other).await
        }
        #[cfg(feature = "fuse")]
        Commands::Unmount { mountpoint } => cmd_unmount(&mountpoint),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout is reserved for command output (e.g. show-key)
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn config_path(dir: &Path, custom: Option<PathBuf>) -> PathBuf {
    match custom {
        Some(path) => {
            info!(config = %path.display(), "using custom config location");
            path
        }
        None => dir.join(CONFIG_FILENAME),
    }
}

// ── Passwords ─────────────────────────────────────────────────────────────────

const PASSWORD_ENV: &str = "SHROUDFS_PASSWORD";

fn read_password(prompt: &str) -> Result<SecretString> {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        return Ok(SecretString::from(pw));
    }
    let pw = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(SecretString::from(pw))
}

/// Prompt twice for a new password; both entries must match and be non-empty.
fn read_new_password(prompt: &str) -> Result<SecretString> {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        anyhow::ensure!(!pw.is_empty(), "{PASSWORD_ENV} is empty");
        return Ok(SecretString::from(pw));
    }
    let first = rpassword::prompt_password(prompt).context("reading password")?;
    let second = rpassword::prompt_password("Repeat: ").context("reading password")?;
    check_new_password(SecretString::from(first), SecretString::from(second))
}

fn check_new_password(first: SecretString, second: SecretString) -> Result<SecretString> {
    anyhow::ensure!(!first.expose_secret().is_empty(), "password must not be empty");
    anyhow::ensure!(
        first.expose_secret() == second.expose_secret(),
        "passwords do not match"
    );
    Ok(first)
}

// ── `shroudfs init` ───────────────────────────────────────────────────────────

fn cmd_init(
    settings: &ShroudSettings,
    dir: &Path,
    reverse: bool,
    plaintext_names: bool,
    long_names: bool,
    config: Option<PathBuf>,
) -> Result<()> {
    if !reverse {
        conffile::ensure_dir_empty(dir)?;
    }
    let path = config_path(dir, config);

    let opts = CreateOptions {
        plaintext_names,
        long_names,
        kdf: KdfParams::from(&settings.kdf),
    };
    let password = read_new_password("New password: ")?;
    let master = conffile::create(&path, &password, &opts)?;

    // forward trees keep their IVs on disk; the root needs one up front
    if !reverse && !plaintext_names {
        write_root_dir_iv(dir)?;
    }

    println!("Created {} config at {}", if reverse { "reverse" } else { "forward" }, path.display());
    println!();
    println!("Your master key is:");
    println!();
    println!("    {}", master.to_grouped_hex());
    println!();
    println!("If the config file is lost or damaged, this key is the only way to");
    println!("recover your data. Keep a copy somewhere safe and offline.");
    Ok(())
}

fn write_root_dir_iv(dir: &Path) -> Result<()> {
    use rand::RngCore;
    use std::os::unix::fs::PermissionsExt;

    let mut iv = [0u8; DIRIV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let path = dir.join(DIRIV_FILENAME);
    std::fs::write(&path, iv).with_context(|| format!("writing {}", path.display()))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o440))
        .with_context(|| format!("chmod {}", path.display()))?;
    Ok(())
}

// ── `shroudfs passwd` / `shroudfs show-key` ───────────────────────────────────

fn cmd_passwd(dir: &Path, config: Option<PathBuf>) -> Result<()> {
    let path = config_path(dir, config);
    let old = read_password("Old password: ")?;
    // fail fast on a wrong old password, before asking for the new one
    ConfigFile::read(&path)?.unlock(&old)?;
    let new = read_new_password("New password: ")?;
    conffile::rewrap(&path, &old, &new)?;
    println!("Password changed.");
    Ok(())
}

fn cmd_show_key(dir: &Path, config: Option<PathBuf>) -> Result<()> {
    let path = config_path(dir, config);
    let password = read_password("Password: ")?;
    let (master, _) = conffile::load(&path, &password)?;
    println!("{}", master.to_grouped_hex());
    Ok(())
}

// ── `shroudfs mount` (requires fuse feature) ──────────────────────────────────

/// Where the master key comes from.
#[derive(Debug, PartialEq)]
enum KeySource {
    Password,
    Hex(String),
    Zero,
}

impl KeySource {
    fn from_flags(masterkey: Option<String>, zerokey: bool) -> Self {
        match (masterkey, zerokey) {
            (_, true) => KeySource::Zero,
            (Some(hex), false) => KeySource::Hex(hex),
            (None, false) => KeySource::Password,
        }
    }
}

/// Resolve the master key and the config flags.
///
/// With an explicit key the config is optional: its flags are honored when
/// present, defaults are used otherwise.
fn unlock(path: &Path, source: KeySource) -> Result<(MasterKey, Option<ConfigFile>)> {
    let config = match ConfigFile::read(path) {
        Ok(file) => Some(file),
        Err(e) if e.is_not_found() && source != KeySource::Password => None,
        Err(e) => return Err(e).with_context(|| format!("reading config {}", path.display())),
    };

    let master = match source {
        KeySource::Zero => {
            warn!("using the all-zero master key: this provides NO security");
            MasterKey::zero()
        }
        KeySource::Hex(hex) => {
            warn!("using a master key from the command line; it may be visible in the process list");
            MasterKey::from_hex(&hex)?
        }
        KeySource::Password => {
            let password = read_password("Password: ")?;
            match &config {
                Some(file) => file.unlock(&password)?,
                None => anyhow::bail!("config {} not found", path.display()),
            }
        }
    };
    Ok((master, config))
}

#[cfg(feature = "fuse")]
async fn cmd_mount(
    settings: &ShroudSettings,
    dir: &Path,
    mountpoint: &Path,
    reverse: bool,
    config: Option<PathBuf>,
    source: KeySource,
    allow_other: bool,
) -> Result<()> {
    use shroud_fuse::{FileSystem, ForwardFs, Loopback, ReverseFs, ViewOptions};
    use std::sync::Arc;
    use std::time::Duration;

    let path = config_path(dir, config);
    let (master, file) = unlock(&path, source)?;

    let opts = ViewOptions {
        plaintext_names: file.as_ref().is_some_and(ConfigFile::plaintext_names),
        long_names: file.as_ref().map_or(true, ConfigFile::long_names),
        exclude: if reverse {
            settings.reverse.exclude.clone()
        } else {
            Vec::new()
        },
    };

    let lower = Loopback::new(dir)?;
    let fs: Arc<dyn FileSystem> = if reverse {
        Arc::new(ReverseFs::new(lower, &master, &opts)?)
    } else {
        Arc::new(ForwardFs::new(lower, &master, &opts)?)
    };
    drop(master);

    // Ensure mountpoint exists
    tokio::fs::create_dir_all(mountpoint)
        .await
        .with_context(|| format!("creating mountpoint: {}", mountpoint.display()))?;

    println!(
        "Mounting {} view of {} → {}",
        if reverse { "encrypted" } else { "decrypted" },
        dir.display(),
        mountpoint.display()
    );
    println!("Press Ctrl-C or run `shroudfs unmount {}` to stop.", mountpoint.display());

    shroud_fuse::mount(shroud_fuse::MountConfig {
        fs,
        mountpoint: mountpoint.to_path_buf(),
        fs_name: settings.mount.fs_name.clone(),
        attr_ttl: Duration::from_secs(settings.mount.attr_ttl_secs),
        allow_other: allow_other || settings.mount.allow_other,
    })
    .await
    .context("FUSE mount failed")
}

// ── `shroudfs unmount` (requires fuse feature) ────────────────────────────────

/// Unmount helpers to try, in order.
#[cfg(all(feature = "fuse", target_os = "macos"))]
const UNMOUNTERS: &[(&str, &[&str])] = &[("umount", &[]), ("diskutil", &["unmount"])];
#[cfg(all(feature = "fuse", not(target_os = "macos")))]
const UNMOUNTERS: &[(&str, &[&str])] = &[("fusermount3", &["-u"]), ("umount", &[])];

#[cfg(feature = "fuse")]
fn cmd_unmount(mountpoint: &Path) -> Result<()> {
    let mut failures = Vec::new();
    for (program, args) in UNMOUNTERS {
        match std::process::Command::new(program)
            .args(*args)
            .arg(mountpoint)
            .status()
        {
            Ok(status) if status.success() => {
                info!(mountpoint = %mountpoint.display(), program, "unmounted");
                println!("Unmounted {}", mountpoint.display());
                return Ok(());
            }
            Ok(status) => failures.push(format!("{program}: {status}")),
            Err(e) => failures.push(format!("{program}: {e}")),
        }
    }
    anyhow::bail!(
        "could not unmount {} ({})",
        mountpoint.display(),
        failures.join("; ")
    )
}
