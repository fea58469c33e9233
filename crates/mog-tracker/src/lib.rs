//! Mog Tracker - typed client for the MogileFS tracker RPC protocol.
//!
//! This crate provides:
//! - The line-based wire encoding shared by every tracker verb
//! - A TCP client with tracker failover and reconnect
//! - Typed records for paths, directory listings, devices, and commits

#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod proto;

pub use client::TcpTracker;

use thiserror::Error;

/// Tracker errors.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The tracker answered `ERR errcode errstr`
    #[error("Tracker error {errcode}: {errstr}")]
    Tracker {
        /// Machine-readable error code from the tracker
        errcode: String,
        /// Human-readable message from the tracker
        errstr: String,
    },

    /// Response line the client could not interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// None of the configured trackers accepted a connection
    #[error("No tracker reachable")]
    NoTrackerReachable,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrackerError {
    /// True when the tracker reported that the key (or path) does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Tracker { errcode, .. }
            if errcode == "unknown_key" || errcode == "invalid_key" || errcode == "unknown_file")
    }

    /// True when the tracker reported that the target key already exists.
    pub fn is_key_exists(&self) -> bool {
        matches!(self, Self::Tracker { errcode, .. } if errcode == "key_exists")
    }
}

/// One entry of a FilePaths directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (no path components)
    pub name: String,
    /// Object size in bytes; zero for directories
    pub size: u64,
    /// Modification time in unix seconds, when the tracker has one
    pub modified: Option<u64>,
    /// True for directory entries
    pub is_directory: bool,
}

/// Destination allocated by `create_open`: a device slot plus its PUT URL.
#[derive(Debug, Clone)]
pub struct NewDest {
    /// Newly allocated file id
    pub fid: u64,
    /// Device the tracker placed the object on
    pub devid: u64,
    /// Storage-node URL accepting ranged PUTs
    pub url: String,
}

/// Arguments for `create_close`, committing (or discarding) a destination.
#[derive(Debug, Clone)]
pub struct CommitArgs {
    /// File id from `create_open`
    pub fid: u64,
    /// Device id from `create_open`
    pub devid: u64,
    /// Key to commit under; empty asks the tracker to discard the object
    pub key: String,
    /// Storage-node URL the bytes were written to
    pub url: String,
    /// Final object size in bytes
    pub size: u64,
    /// Modification time recorded as `plugin.meta` metadata, unix seconds
    pub mtime: u64,
    /// Optional `KIND:<hex>` digest the tracker should verify and record
    pub checksum: Option<String>,
}

/// Metadata returned by `file_info`.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    /// File id
    pub fid: Option<u64>,
    /// Object length in bytes
    pub length: Option<u64>,
    /// Storage class name
    pub class: Option<String>,
    /// Recorded `KIND:<hex>` checksum, if any
    pub checksum: Option<String>,
    /// Replica count
    pub devcount: Option<u64>,
}

/// Per-device record from `get_devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Device id
    pub devid: u64,
    /// Administrative status (`alive`, `down`, ...)
    pub status: String,
    /// Monitor-observed state (`writeable`, `readable`, ...)
    pub observed_state: Option<String>,
    /// Free space in megabytes
    pub mb_free: u64,
    /// Total space in megabytes
    pub mb_total: u64,
}

impl Device {
    /// True when the device is alive and the monitor saw it accepting writes.
    pub fn is_writeable(&self) -> bool {
        self.status == "alive" && self.observed_state.as_deref() == Some("writeable")
    }
}

/// The tracker verbs the filesystem consumes, as a seam for test backends.
///
/// Implementations are per-thread: methods take `&mut self` so a backend may
/// own a connection, and `Send` is required so a worker can be handed one.
pub trait TrackerBackend: Send {
    /// FilePaths listing of one directory. Unknown directories list empty.
    fn list(&mut self, dir: &str) -> Result<Vec<DirEntry>, TrackerError>;

    /// Replica URLs for a key, best first. Empty when the key is unknown.
    fn get_paths(&mut self, key: &str) -> Result<Vec<String>, TrackerError>;

    /// Metadata for a key.
    fn file_info(&mut self, key: &str) -> Result<FileInfo, TrackerError>;

    /// Allocates a new destination for a key.
    fn create_open(&mut self, key: &str, class: Option<&str>) -> Result<NewDest, TrackerError>;

    /// Commits or discards a destination.
    fn create_close(&mut self, args: &CommitArgs) -> Result<(), TrackerError>;

    /// Deletes a key.
    fn delete(&mut self, key: &str) -> Result<(), TrackerError>;

    /// Renames a key.
    fn rename(&mut self, from: &str, to: &str) -> Result<(), TrackerError>;

    /// Changes the storage class of a key.
    fn update_class(&mut self, key: &str, class: &str) -> Result<(), TrackerError>;

    /// Lists all storage devices in the cluster.
    fn get_devices(&mut self) -> Result<Vec<Device>, TrackerError>;
}
