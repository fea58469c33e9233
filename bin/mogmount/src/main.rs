//! mogmount - mounts a MogileFS domain as a local filesystem.
//!
//! Configuration comes from a TOML file layered under command-line flags;
//! flags always win. The process blocks inside the FUSE event loop and
//! exits 0 once the kernel unmounts.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::FmtSubscriber;

use mog_fs::{LogLevel, MountConfig};

#[derive(Parser)]
#[command(name = "mogmount")]
#[command(author, version, about = "Mount a MogileFS domain as a local filesystem")]
struct Cli {
    /// Tracker host:port endpoints, comma separated
    #[arg(long, value_delimiter = ',')]
    trackers: Vec<String>,

    /// Domain to mount
    #[arg(long)]
    domain: Option<String>,

    /// Storage class for newly written files
    #[arg(long)]
    class: Option<String>,

    /// Extra FUSE mount options, comma separated
    #[arg(short = 'o', long)]
    mountopts: Option<String>,

    /// Mount read-only
    #[arg(long)]
    readonly: bool,

    /// Disable write coalescing
    #[arg(long)]
    no_buffered: bool,

    /// Stream checksums over sequential writes and commit them
    #[arg(long)]
    checksums: bool,

    /// Serve kernel callbacks on the session thread only
    #[arg(long)]
    single_threaded: bool,

    /// Disable the directory listing cache
    #[arg(long)]
    no_dircache: bool,

    /// Directory cache TTL in seconds
    #[arg(long)]
    dircache_ttl: Option<u64>,

    /// Numeric log level: -1 off, 0 notice, 1 error, 2..4 debug
    #[arg(long)]
    loglevel: Option<i32>,

    /// Verbosity (-v info, -vv debug, -vvv trace); overrides --loglevel
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file
    #[arg(short, long, default_value = "~/.mogfs/mount.toml")]
    config: PathBuf,

    /// Where to mount
    mountpoint: Option<PathBuf>,
}

/// Expand ~ to the home directory.
fn expand_tilde(path: &PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.clone()
}

/// Load configuration defaults from a TOML file, if present.
fn load_config(path: &PathBuf) -> Result<MountConfig> {
    let path = expand_tilde(path);
    let mut config = MountConfig::default();

    if !path.exists() {
        return Ok(config);
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    let toml: toml::Value = content.parse().context("Failed to parse config file")?;

    if let Some(tracker) = toml.get("tracker") {
        if let Some(hosts) = tracker.get("hosts").and_then(|v| v.as_array()) {
            config.trackers = hosts
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
        }
        if let Some(domain) = tracker.get("domain").and_then(|v| v.as_str()) {
            config.domain = domain.to_string();
        }
        if let Some(class) = tracker.get("class").and_then(|v| v.as_str()) {
            config.class = Some(class.to_string());
        }
    }

    if let Some(mount) = toml.get("mount") {
        if let Some(mountpoint) = mount.get("mountpoint").and_then(|v| v.as_str()) {
            config.mountpoint = PathBuf::from(mountpoint);
        }
        if let Some(options) = mount.get("options").and_then(|v| v.as_str()) {
            config.mountopts = Some(options.to_string());
        }
        if let Some(readonly) = mount.get("readonly").and_then(|v| v.as_bool()) {
            config.readonly = readonly;
        }
        if let Some(buffered) = mount.get("buffered").and_then(|v| v.as_bool()) {
            config.buffered = buffered;
        }
        if let Some(checksums) = mount.get("checksums").and_then(|v| v.as_bool()) {
            config.checksums = checksums;
        }
        if let Some(threaded) = mount.get("threaded").and_then(|v| v.as_bool()) {
            config.threaded = threaded;
        }
        if let Some(loglevel) = mount.get("loglevel").and_then(|v| v.as_integer()) {
            config.loglevel = LogLevel::from_i32(loglevel as i32);
        }
    }

    if let Some(cache) = toml.get("cache") {
        if let Some(enabled) = cache.get("dircache").and_then(|v| v.as_bool()) {
            config.dircache = enabled;
        }
        if let Some(duration) = cache.get("duration").and_then(|v| v.as_integer()) {
            config.dircache_ttl = Duration::from_secs(duration.max(0) as u64);
        }
    }

    Ok(config)
}

/// Layer command-line flags over the file-derived configuration.
fn apply_cli(mut config: MountConfig, cli: &Cli) -> MountConfig {
    if !cli.trackers.is_empty() {
        config.trackers = cli.trackers.clone();
    }
    if let Some(domain) = &cli.domain {
        config.domain = domain.clone();
    }
    if let Some(class) = &cli.class {
        config.class = Some(class.clone());
    }
    if let Some(mountpoint) = &cli.mountpoint {
        config.mountpoint = expand_tilde(mountpoint);
    }
    if let Some(mountopts) = &cli.mountopts {
        config.mountopts = Some(mountopts.clone());
    }
    if cli.readonly {
        config.readonly = true;
    }
    if cli.no_buffered {
        config.buffered = false;
    }
    if cli.checksums {
        config.checksums = true;
    }
    if cli.single_threaded {
        config.threaded = false;
    }
    if cli.no_dircache {
        config.dircache = false;
    }
    if let Some(secs) = cli.dircache_ttl {
        config.dircache_ttl = Duration::from_secs(secs);
    }
    if let Some(level) = cli.loglevel {
        config.loglevel = LogLevel::from_i32(level);
    }
    if cli.verbose > 0 {
        config.loglevel = LogLevel::from_i32(1 + i32::from(cli.verbose));
    }
    config
}

fn setup_logging(level: LogLevel) -> Result<()> {
    let Some(max_level) = level.max_tracing_level() else {
        return Ok(());
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    let config = apply_cli(config, &cli);

    setup_logging(config.loglevel)?;

    if config.trackers.is_empty() {
        bail!("no trackers configured (use --trackers or the config file)");
    }
    if config.domain.is_empty() {
        bail!("no domain configured (use --domain or the config file)");
    }
    if config.mountpoint.as_os_str().is_empty() {
        bail!("no mountpoint given");
    }

    mog_fs::ops::mount(config).context("Mount failed")?;
    Ok(())
}
