//! Mount state: handle registry, directory cache, and per-thread backends.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mog_http::{AgentConfig, HttpAgent, HttpError, NodeAgent};
use mog_tracker::{DirEntry, TcpTracker, TrackerBackend, TrackerError};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::MountConfig;
use crate::dircache::DirCache;
use crate::handle::{FileHandle, OpenMode};
use crate::{path, FsError};

/// Extended attribute exposing the storage class.
pub const XATTR_CLASS: &str = "MogileFS.class";
/// Extended attribute exposing the recorded checksum.
pub const XATTR_CHECKSUM: &str = "MogileFS.checksum";

/// Produces per-thread tracker and storage-node backends.
///
/// Neither backend is shareable across workers (connections, pools), so the
/// mount builds one of each per thread through this seam. Test harnesses
/// substitute in-memory backends here.
pub trait Connector: Send + Sync + 'static {
    /// Builds a tracker client for the calling thread.
    fn tracker(&self) -> Result<Box<dyn TrackerBackend>, FsError>;

    /// Builds a storage-node agent for the calling thread.
    fn agent(&self) -> Result<Box<dyn NodeAgent>, FsError>;
}

/// Connector dialing real trackers and storage nodes.
pub struct NetConnector {
    config: Arc<MountConfig>,
}

impl NetConnector {
    /// Creates a connector for the given configuration.
    pub fn new(config: Arc<MountConfig>) -> Self {
        Self { config }
    }
}

impl Connector for NetConnector {
    fn tracker(&self) -> Result<Box<dyn TrackerBackend>, FsError> {
        Ok(Box::new(TcpTracker::new(
            self.config.trackers.clone(),
            self.config.domain.clone(),
        )))
    }

    fn agent(&self) -> Result<Box<dyn NodeAgent>, FsError> {
        Ok(Box::new(HttpAgent::new(AgentConfig::default())?))
    }
}

struct ThreadBackends {
    tracker: Box<dyn TrackerBackend>,
    agent: Box<dyn NodeAgent>,
}

thread_local! {
    /// Per-thread backends keyed by mount id; lazily rebuilt on new threads.
    static BACKENDS: RefCell<HashMap<u64, ThreadBackends>> = RefCell::new(HashMap::new());
}

/// State shared by every handle and callback of one mount.
pub(crate) struct Shared {
    id: u64,
    pub(crate) config: Arc<MountConfig>,
    pub(crate) dircache: DirCache,
    connector: Box<dyn Connector>,
}

impl Shared {
    fn with_backends<R>(
        &self,
        f: impl FnOnce(&mut ThreadBackends) -> Result<R, FsError>,
    ) -> Result<R, FsError> {
        BACKENDS.with(|cell| {
            let mut map = cell.borrow_mut();
            if !map.contains_key(&self.id) {
                let tracker = self.connector.tracker()?;
                let agent = self.connector.agent()?;
                map.insert(self.id, ThreadBackends { tracker, agent });
            }
            match map.get_mut(&self.id) {
                Some(backends) => f(backends),
                None => Err(FsError::Io("per-thread backends unavailable".to_string())),
            }
        })
    }

    /// Runs `f` against this thread's tracker client.
    pub(crate) fn tracker<R>(
        &self,
        f: impl FnOnce(&mut dyn TrackerBackend) -> Result<R, TrackerError>,
    ) -> Result<R, FsError> {
        self.with_backends(|backends| f(backends.tracker.as_mut()).map_err(FsError::from))
    }

    /// Runs `f` against this thread's storage-node agent.
    pub(crate) fn agent<R>(
        &self,
        f: impl FnOnce(&mut dyn NodeAgent) -> Result<R, HttpError>,
    ) -> Result<R, FsError> {
        self.with_backends(|backends| f(backends.agent.as_mut()).map_err(FsError::from))
    }

    /// Directory listing through the cache.
    pub(crate) fn list_dir(&self, dir: &str) -> Result<HashMap<String, DirEntry>, FsError> {
        if let Some(files) = self.dircache.get(dir) {
            return Ok(files);
        }
        let entries = self.tracker(|t| t.list(dir))?;
        self.dircache.put(dir, entries.clone());
        Ok(entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect())
    }

    /// Drops the cache entries covering the directory containing `p`.
    pub(crate) fn invalidate_for(&self, p: &str) {
        match path::parent(p) {
            Some(dir) => self.dircache.invalidate(dir, true),
            None => self.dircache.invalidate("/", false),
        }
    }
}

/// Attributes synthesized for `getattr`.
#[derive(Debug, Clone)]
pub struct Attr {
    /// Directory flag
    pub is_dir: bool,
    /// Size in bytes
    pub size: u64,
    /// Modification time in unix seconds, when known
    pub mtime: Option<u64>,
}

/// Filesystem-level usage figures for `statfs`, in 1 MiB blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFs {
    /// Total blocks across all devices
    pub blocks: u64,
    /// Free blocks on devices currently accepting writes
    pub bfree: u64,
    /// Same as `bfree`; no reservation model exists
    pub bavail: u64,
    /// Block size in bytes
    pub bsize: u32,
    /// Maximum file name length
    pub namelen: u32,
}

/// One mounted filesystem: configuration, caches, and live handles.
pub struct Mount {
    shared: Arc<Shared>,
    handles: RwLock<HashMap<u64, Arc<FileHandle>>>,
    mounted: AtomicBool,
}

impl Mount {
    /// Creates a mount over the given connector.
    pub fn new(config: MountConfig, connector: Box<dyn Connector>) -> Self {
        static NEXT_MOUNT_ID: AtomicU64 = AtomicU64::new(1);
        let config = Arc::new(config);
        let dircache = DirCache::new(config.dircache, config.dircache_ttl);
        Self {
            shared: Arc::new(Shared {
                id: NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed),
                config,
                dircache,
                connector,
            }),
            handles: RwLock::new(HashMap::new()),
            mounted: AtomicBool::new(false),
        }
    }

    /// Creates a mount dialing real trackers and storage nodes.
    pub fn new_net(config: MountConfig) -> Self {
        let shared_config = Arc::new(config.clone());
        Self::new(config, Box::new(NetConnector::new(shared_config)))
    }

    /// Marks the mount active; a mount may only be activated once.
    pub fn mark_mounted(&self) -> Result<(), FsError> {
        if self.mounted.swap(true, Ordering::SeqCst) {
            return Err(FsError::Io("already mounted".to_string()));
        }
        Ok(())
    }

    /// The mount configuration.
    pub fn config(&self) -> &MountConfig {
        &self.shared.config
    }

    fn check_writable(&self) -> Result<(), FsError> {
        if self.shared.config.readonly {
            Err(FsError::Access)
        } else {
            Ok(())
        }
    }

    /// Opens `path`, registering the handle under its id.
    pub fn open(&self, p: &str, mode: OpenMode, excl: bool) -> Result<Arc<FileHandle>, FsError> {
        if mode.write {
            self.check_writable()?;
        }
        let p = path::normalize(p);
        let handle = FileHandle::open(Arc::clone(&self.shared), p, mode, excl)?
            .ok_or(FsError::NotFound)?;
        self.handles.write().insert(handle.id(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Looks up a live handle by id.
    pub fn handle(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.read().get(&fh).cloned()
    }

    /// Number of live handles in the registry.
    pub fn open_handles(&self) -> usize {
        self.handles.read().len()
    }

    fn handle_by_path(&self, p: &str) -> Option<Arc<FileHandle>> {
        self.handles
            .read()
            .values()
            .find(|handle| handle.path() == p && handle.mode().write)
            .cloned()
    }

    /// Flushes and unregisters a handle.
    pub fn release(&self, fh: u64) -> Result<(), FsError> {
        let handle = self
            .handles
            .write()
            .remove(&fh)
            .ok_or_else(|| FsError::Io(format!("release of unknown handle {fh}")))?;
        handle.release()
    }

    /// Materializes an empty object at `path` (the `mknod` reduction).
    pub fn create_empty(&self, p: &str, excl: bool) -> Result<(), FsError> {
        self.check_writable()?;
        let handle = self.open(p, OpenMode::WRITE_ONLY, excl)?;
        let result = handle.flush();
        let released = self.release(handle.id());
        result.and(released)
    }

    /// `create`: materialize an empty object, then open it with `mode`.
    pub fn create(&self, p: &str, mode: OpenMode, excl: bool) -> Result<Arc<FileHandle>, FsError> {
        self.create_empty(p, excl)?;
        self.open(p, mode, false)
    }

    /// Removes the object at `path`.
    pub fn unlink(&self, p: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let p = path::normalize(p);
        self.shared.tracker(|t| t.delete(&p))?;
        self.shared.invalidate_for(&p);
        Ok(())
    }

    /// Renames a key; the target must not exist.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let from = path::normalize(from);
        let to = path::normalize(to);
        self.shared.tracker(|t| t.rename(&from, &to))?;
        self.shared.invalidate_for(&from);
        self.shared.invalidate_for(&to);
        Ok(())
    }

    /// Materializes a directory by creating and deleting a probe object
    /// beneath it; FilePaths keeps the directory row alive afterwards.
    pub fn mkdir(&self, dir: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let dir = path::normalize(dir);
        let probe = path::join(&dir, &format!(".mogfs-mkdir-{:08x}", rand::random::<u32>()));
        self.create_empty(&probe, false)?;
        let result = self.shared.tracker(|t| t.delete(&probe));
        self.shared.dircache.invalidate(&dir, true);
        result
    }

    /// Attributes for a path, resolved through the directory cache. A live
    /// dirty handle on the same path answers with its fresher size.
    pub fn getattr(&self, p: &str) -> Result<Attr, FsError> {
        let p = path::normalize(p);
        if p == "/" {
            return Ok(Attr {
                is_dir: true,
                size: 0,
                mtime: None,
            });
        }
        if let Some(handle) = self.handle_by_path(&p) {
            if handle.is_dirty() {
                return Ok(Attr {
                    is_dir: false,
                    size: handle.size()?,
                    mtime: None,
                });
            }
        }
        let (dir, name) = path::split(&p).ok_or(FsError::NotFound)?;
        let files = self.shared.list_dir(dir)?;
        let entry = files.get(name).ok_or(FsError::NotFound)?;
        Ok(Attr {
            is_dir: entry.is_directory,
            size: entry.size,
            mtime: entry.modified,
        })
    }

    /// Attributes synthesized from a live handle (`fgetattr`).
    pub fn getattr_handle(&self, fh: u64) -> Result<Attr, FsError> {
        let handle = self.handle(fh).ok_or(FsError::NotFound)?;
        Ok(Attr {
            is_dir: false,
            size: handle.size()?,
            mtime: None,
        })
    }

    /// Sorted directory listing (without `.` and `..`).
    pub fn readdir(&self, dir: &str) -> Result<Vec<DirEntry>, FsError> {
        let files = self.shared.list_dir(&path::normalize(dir))?;
        let mut entries: Vec<DirEntry> = files.into_values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Path-level truncate: open write-only, truncate, release.
    pub fn truncate_path(&self, p: &str, size: u64) -> Result<(), FsError> {
        self.check_writable()?;
        let handle = self.open(p, OpenMode::WRITE_ONLY, false)?;
        let result = handle.truncate(size);
        let released = self.release(handle.id());
        result.and(released)
    }

    /// Cluster capacity, counting free space only on writeable devices.
    pub fn statfs(&self) -> Result<StatFs, FsError> {
        let devices = self.shared.tracker(|t| t.get_devices())?;
        let blocks = devices.iter().map(|d| d.mb_total).sum();
        let free = devices
            .iter()
            .filter(|d| d.is_writeable())
            .map(|d| d.mb_free)
            .sum();
        Ok(StatFs {
            blocks,
            bfree: free,
            bavail: free,
            bsize: 1024 * 1024,
            namelen: 255,
        })
    }

    /// Reads one of the two well-known extended attributes.
    pub fn getxattr(&self, p: &str, name: &str) -> Result<Vec<u8>, FsError> {
        if name != XATTR_CLASS && name != XATTR_CHECKSUM {
            return Err(FsError::Unsupported);
        }
        let p = path::normalize(p);
        let info = self.shared.tracker(|t| t.file_info(&p))?;
        let value = if name == XATTR_CLASS {
            info.class
        } else {
            info.checksum
        };
        Ok(value.unwrap_or_default().into_bytes())
    }

    /// The extended attribute names every object carries.
    pub fn listxattr(&self) -> &'static [&'static str] {
        &[XATTR_CHECKSUM, XATTR_CLASS]
    }

    /// Writes the storage-class attribute; everything else is unsupported.
    pub fn setxattr(&self, p: &str, name: &str, value: &[u8]) -> Result<(), FsError> {
        self.check_writable()?;
        if name != XATTR_CLASS {
            return Err(FsError::Unsupported);
        }
        let class = std::str::from_utf8(value)
            .map_err(|_| FsError::Io("class value is not utf-8".to_string()))?;
        let p = path::normalize(p);
        self.shared.tracker(|t| t.update_class(&p, class))
    }

    /// Permission bits synthesized for `getattr`.
    pub fn perm(&self, is_dir: bool) -> u16 {
        let mut mode = 0o444;
        if !self.shared.config.readonly {
            mode |= 0o222;
        }
        if is_dir {
            mode |= 0o111;
        }
        mode
    }

    /// Releases every surviving handle, swallowing and logging failures.
    /// Called when the kernel session ends.
    pub fn shutdown(&self) {
        let handles: Vec<Arc<FileHandle>> = {
            let mut map = self.handles.write();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            if let Err(e) = handle.release() {
                warn!(path = handle.path(), error = %e, "Release on unmount failed");
            }
        }
        let stats = self.shared.dircache.stats();
        debug!(
            hits = stats.hits,
            misses = stats.misses,
            invalidations = stats.invalidations,
            "Directory cache statistics"
        );
    }
}
