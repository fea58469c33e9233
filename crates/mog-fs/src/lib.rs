//! Mog FS - mounts a MogileFS-style object store as a POSIX filesystem.
//!
//! The hard part lives in [`handle::FileHandle`]: a stateful POSIX file
//! handle rendered as stateless ranged HTTP against remote blobs, with
//! copy-on-write staging, write coalescing, and an optional streaming
//! checksum. [`dispatch::MogFilesystem`] wires the kernel callbacks onto
//! that core and owns the error-to-errno boundary.

#![warn(missing_docs, rust_2018_idioms)]

pub mod buffer;
pub mod checksum;
pub mod config;
pub mod dircache;
pub mod dispatch;
pub mod handle;
pub mod inode;
pub mod mount;
pub mod ops;
pub mod path;

pub use config::{LogLevel, MountConfig};
pub use handle::{FileHandle, OpenMode};
pub use mount::{Attr, Connector, Mount, StatFs};

use mog_http::HttpError;
use mog_tracker::TrackerError;
use thiserror::Error;

/// Filesystem errors surfaced at the FUSE boundary.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path not present
    #[error("Not found")]
    NotFound,

    /// Target already exists
    #[error("Already exists")]
    Exists,

    /// Mutation attempted on a read-only mount
    #[error("Access denied")]
    Access,

    /// Operation not implemented by this filesystem
    #[error("Operation not supported")]
    Unsupported,

    /// Tracker failure, storage-node failure, or invariant breach
    #[error("I/O error: {0}")]
    Io(String),
}

impl FsError {
    /// The errno handed to the FUSE reply for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::Access => libc::EACCES,
            Self::Unsupported => libc::EOPNOTSUPP,
            Self::Io(_) => libc::EIO,
        }
    }
}

impl From<TrackerError> for FsError {
    fn from(e: TrackerError) -> Self {
        if e.is_not_found() {
            Self::NotFound
        } else if e.is_key_exists() {
            Self::Exists
        } else {
            Self::Io(e.to_string())
        }
    }
}

impl From<HttpError> for FsError {
    fn from(e: HttpError) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::Exists.errno(), libc::EEXIST);
        assert_eq!(FsError::Access.errno(), libc::EACCES);
        assert_eq!(FsError::Unsupported.errno(), libc::EOPNOTSUPP);
        assert_eq!(FsError::Io("x".into()).errno(), libc::EIO);
    }

    #[test]
    fn test_tracker_error_conversion() {
        let not_found = TrackerError::Tracker {
            errcode: "unknown_key".into(),
            errstr: "unknown_key".into(),
        };
        assert!(matches!(FsError::from(not_found), FsError::NotFound));

        let exists = TrackerError::Tracker {
            errcode: "key_exists".into(),
            errstr: "target exists".into(),
        };
        assert!(matches!(FsError::from(exists), FsError::Exists));

        let other = TrackerError::NoTrackerReachable;
        assert!(matches!(FsError::from(other), FsError::Io(_)));
    }
}
