//! Mount configuration.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::checksum::ChecksumKind;
use crate::FsError;

/// Log verbosity understood by the mount, in the tracker client's numeric
/// scheme (`-1` off through `4` kernel-callback tracing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// No output at all
    Off,
    /// Operational notices
    Notice,
    /// Errors only
    Error,
    /// Core operation tracing
    Debug,
    /// Adds tracker and storage-node traffic
    DebugBackend,
    /// Adds every kernel callback with arguments
    DebugFuse,
}

impl LogLevel {
    /// Decodes the numeric form used by config files and the CLI.
    pub fn from_i32(level: i32) -> Self {
        match level {
            i if i < 0 => Self::Off,
            0 => Self::Notice,
            1 => Self::Error,
            2 => Self::Debug,
            3 => Self::DebugBackend,
            _ => Self::DebugFuse,
        }
    }

    /// Maximum tracing level this verbosity admits; `None` disables output.
    pub fn max_tracing_level(self) -> Option<tracing::Level> {
        match self {
            Self::Off => None,
            Self::Notice => Some(tracing::Level::INFO),
            Self::Error => Some(tracing::Level::WARN),
            Self::Debug => Some(tracing::Level::DEBUG),
            Self::DebugBackend | Self::DebugFuse => Some(tracing::Level::TRACE),
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Notice
    }
}

/// Mount configuration. Immutable once the mount is created.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Tracker `host:port` endpoints (required)
    pub trackers: Vec<String>,
    /// Domain the mount serves (required)
    pub domain: String,
    /// Storage class for new objects; `None` uses the server default
    pub class: Option<String>,
    /// Where to mount (required)
    pub mountpoint: PathBuf,
    /// Extra FUSE mount options, comma separated
    pub mountopts: Option<String>,
    /// Serve callbacks on a worker pool instead of the session thread
    pub threaded: bool,
    /// Refuse every mutating operation with EACCES
    pub readonly: bool,
    /// Coalesce adjacent small writes before PUTting them
    pub buffered: bool,
    /// Stream a checksum over sequential writes and commit it
    pub checksums: bool,
    /// Digest family used when `checksums` is on
    pub checksum_kind: ChecksumKind,
    /// Log verbosity
    pub loglevel: LogLevel,
    /// Cache directory listings
    pub dircache: bool,
    /// How long a cached listing stays fresh
    pub dircache_ttl: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            trackers: Vec::new(),
            domain: String::new(),
            class: None,
            mountpoint: PathBuf::new(),
            mountopts: None,
            threaded: true,
            readonly: false,
            buffered: true,
            checksums: false,
            checksum_kind: ChecksumKind::Md5,
            loglevel: LogLevel::default(),
            dircache: true,
            dircache_ttl: Duration::from_secs(2),
        }
    }
}

impl MountConfig {
    /// Checks that the required fields are present.
    pub fn validate(&self) -> Result<(), FsError> {
        if self.trackers.is_empty() {
            return Err(FsError::Io("no trackers configured".to_string()));
        }
        if self.domain.is_empty() {
            return Err(FsError::Io("no domain configured".to_string()));
        }
        if self.mountpoint.as_os_str().is_empty() {
            return Err(FsError::Io("no mountpoint configured".to_string()));
        }
        Ok(())
    }

    /// Resolves option interactions. Streaming checksums cannot run on the
    /// worker pool (the digest state is not mergeable across threads), so
    /// `threaded` wins and checksumming is downgraded.
    pub fn normalized(mut self) -> Self {
        if self.threaded && self.checksums {
            warn!("checksums disabled: not supported on a threaded mount");
            self.checksums = false;
        }
        self
    }
}
