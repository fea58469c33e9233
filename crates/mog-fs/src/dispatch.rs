//! FUSE callback dispatcher.
//!
//! Every callback logs its arguments at DEBUG (write bodies as a byte
//! count), runs either inline or on the worker pool, and converts
//! [`FsError`] values to errnos at this single boundary. Operations the
//! store cannot express answer EOPNOTSUPP.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_queue::SegQueue;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::handle::OpenMode;
use crate::inode::{PathTable, ROOT_INO};
use crate::mount::{Attr, Mount};
use crate::path;

/// How long the kernel may cache attributes and entries.
const TTL: Duration = Duration::from_secs(1);

/// Block size reported in stat results.
const BLKSIZE: u32 = 1024;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool draining callback jobs when the mount is threaded.
struct WorkerPool {
    queue: Arc<SegQueue<Job>>,
    signal: Arc<(Mutex<()>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(threads: usize) -> Self {
        let queue: Arc<SegQueue<Job>> = Arc::new(SegQueue::new());
        let signal = Arc::new((Mutex::new(()), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let queue = Arc::clone(&queue);
            let signal = Arc::clone(&signal);
            let shutdown = Arc::clone(&shutdown);
            workers.push(thread::spawn(move || loop {
                match queue.pop() {
                    Some(job) => job(),
                    None => {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        let (lock, cvar) = &*signal;
                        let mut guard = lock.lock();
                        let _ = cvar.wait_for(&mut guard, Duration::from_millis(5));
                    }
                }
            }));
        }
        Self {
            queue,
            signal,
            shutdown,
            workers,
        }
    }

    fn submit(&self, job: Job) {
        self.queue.push(job);
        self.signal.1.notify_one();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.signal.1.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// The FUSE-facing filesystem.
pub struct MogFilesystem {
    mount: Arc<Mount>,
    paths: Arc<PathTable>,
    pool: Option<WorkerPool>,
}

impl MogFilesystem {
    /// Wires a mount to the kernel callback surface.
    pub fn new(mount: Arc<Mount>) -> Self {
        let pool = mount.config().threaded.then(|| {
            let threads = thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1)
                .max(2);
            WorkerPool::new(threads)
        });
        Self {
            mount,
            paths: Arc::new(PathTable::new()),
            pool,
        }
    }

    /// Runs a callback body inline or on the worker pool.
    fn exec(&self, job: impl FnOnce() + Send + 'static) {
        match &self.pool {
            Some(pool) => pool.submit(Box::new(job)),
            None => job(),
        }
    }

    fn file_attr(mount: &Mount, ino: u64, attr: &Attr) -> FileAttr {
        let mtime = attr
            .mtime
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap_or_else(SystemTime::now);
        FileAttr {
            ino,
            size: attr.size,
            blocks: (attr.size + u64::from(BLKSIZE) - 1) / u64::from(BLKSIZE),
            atime: SystemTime::now(),
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: if attr.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: mount.perm(attr.is_dir),
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: BLKSIZE,
            flags: 0,
        }
    }
}

impl Filesystem for MogFilesystem {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_string_lossy().into_owned();
        let mount = Arc::clone(&self.mount);
        let paths = Arc::clone(&self.paths);
        self.exec(move || {
            debug!(parent, %name, "lookup");
            let Some(dir) = paths.path_of(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let child = path::join(&dir, &name);
            match mount.getattr(&child) {
                Ok(attr) => {
                    let ino = paths.ino_for(&child);
                    reply.entry(&TTL, &Self::file_attr(&mount, ino, &attr), 0);
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let mount = Arc::clone(&self.mount);
        let paths = Arc::clone(&self.paths);
        self.exec(move || {
            debug!(ino, "getattr");
            let Some(p) = paths.path_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match mount.getattr(&p) {
                Ok(attr) => reply.attr(&TTL, &Self::file_attr(&mount, ino, &attr)),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let mount = Arc::clone(&self.mount);
        let paths = Arc::clone(&self.paths);
        self.exec(move || {
            debug!(ino, ?size, ?fh, "setattr");
            let Some(p) = paths.path_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let Some(size) = size else {
                // chmod/chown/utimens are intentionally inert.
                if mode.is_some() || uid.is_some() || gid.is_some() || atime.is_some()
                    || mtime.is_some()
                {
                    reply.error(libc::EOPNOTSUPP);
                } else {
                    match mount.getattr(&p) {
                        Ok(attr) => reply.attr(&TTL, &Self::file_attr(&mount, ino, &attr)),
                        Err(e) => reply.error(e.errno()),
                    }
                }
                return;
            };
            let result = match fh.and_then(|fh| mount.handle(fh)) {
                Some(handle) => handle.truncate(size),
                None => mount.truncate_path(&p, size),
            };
            match result {
                Ok(()) => {
                    let attr = Attr {
                        is_dir: false,
                        size,
                        mtime: None,
                    };
                    reply.attr(&TTL, &Self::file_attr(&mount, ino, &attr));
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_string_lossy().into_owned();
        let mount = Arc::clone(&self.mount);
        let paths = Arc::clone(&self.paths);
        self.exec(move || {
            debug!(parent, %name, mode, "mknod");
            let Some(dir) = paths.path_of(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let p = path::join(&dir, &name);
            match mount.create_empty(&p, false) {
                Ok(()) => {
                    let ino = paths.ino_for(&p);
                    let attr = Attr {
                        is_dir: false,
                        size: 0,
                        mtime: None,
                    };
                    reply.entry(&TTL, &Self::file_attr(&mount, ino, &attr), 0);
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_string_lossy().into_owned();
        let mount = Arc::clone(&self.mount);
        let paths = Arc::clone(&self.paths);
        self.exec(move || {
            debug!(parent, %name, "mkdir");
            let Some(dir) = paths.path_of(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let p = path::join(&dir, &name);
            match mount.mkdir(&p) {
                Ok(()) => {
                    let ino = paths.ino_for(&p);
                    let attr = Attr {
                        is_dir: true,
                        size: 0,
                        mtime: None,
                    };
                    reply.entry(&TTL, &Self::file_attr(&mount, ino, &attr), 0);
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy().into_owned();
        let mount = Arc::clone(&self.mount);
        let paths = Arc::clone(&self.paths);
        self.exec(move || {
            debug!(parent, %name, "unlink");
            let Some(dir) = paths.path_of(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let p = path::join(&dir, &name);
            match mount.unlink(&p) {
                Ok(()) => {
                    paths.remove(&p);
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!(parent, name = %name.to_string_lossy(), "rmdir (unsupported)");
        reply.error(libc::EOPNOTSUPP);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_string_lossy().into_owned();
        let newname = newname.to_string_lossy().into_owned();
        let mount = Arc::clone(&self.mount);
        let paths = Arc::clone(&self.paths);
        self.exec(move || {
            debug!(parent, %name, newparent, %newname, "rename");
            let (Some(from_dir), Some(to_dir)) = (paths.path_of(parent), paths.path_of(newparent))
            else {
                reply.error(libc::ENOENT);
                return;
            };
            let from = path::join(&from_dir, &name);
            let to = path::join(&to_dir, &newname);
            match mount.rename(&from, &to) {
                Ok(()) => {
                    paths.rename(&from, &to);
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let mount = Arc::clone(&self.mount);
        let paths = Arc::clone(&self.paths);
        self.exec(move || {
            debug!(ino, flags, "open");
            let Some(p) = paths.path_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let mode = OpenMode::from_flags(flags);
            let excl = flags & libc::O_EXCL != 0;
            match mount.open(&p, mode, excl) {
                Ok(handle) => reply.opened(handle.id(), 0),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let name = name.to_string_lossy().into_owned();
        let mount = Arc::clone(&self.mount);
        let paths = Arc::clone(&self.paths);
        self.exec(move || {
            debug!(parent, %name, flags, "create");
            let Some(dir) = paths.path_of(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let p = path::join(&dir, &name);
            let mode = OpenMode::from_flags(flags);
            let excl = flags & libc::O_EXCL != 0;
            match mount.create(&p, mode, excl) {
                Ok(handle) => {
                    let ino = paths.ino_for(&p);
                    let attr = Attr {
                        is_dir: false,
                        size: 0,
                        mtime: None,
                    };
                    reply.created(&TTL, &Self::file_attr(&mount, ino, &attr), 0, handle.id(), 0);
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let mount = Arc::clone(&self.mount);
        self.exec(move || {
            debug!(ino, fh, offset, size, "read");
            let Some(handle) = mount.handle(fh) else {
                reply.error(libc::EBADF);
                return;
            };
            match handle.read(offset.max(0) as u64, u64::from(size)) {
                Ok(data) => reply.data(&data),
                Err(e) => {
                    warn!(path = handle.path(), error = %e, "read failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        let mount = Arc::clone(&self.mount);
        self.exec(move || {
            debug!(ino, fh, offset, len = data.len(), "write");
            let Some(handle) = mount.handle(fh) else {
                reply.error(libc::EBADF);
                return;
            };
            match handle.write(offset.max(0) as u64, &data) {
                Ok(written) => reply.written(written as u32),
                Err(e) => {
                    warn!(path = handle.path(), error = %e, "write failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let mount = Arc::clone(&self.mount);
        self.exec(move || {
            debug!(ino, fh, "flush");
            let Some(handle) = mount.handle(fh) else {
                reply.error(libc::EBADF);
                return;
            };
            match handle.flush() {
                Ok(()) => reply.ok(),
                Err(e) => {
                    warn!(path = handle.path(), error = %e, "flush failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let mount = Arc::clone(&self.mount);
        self.exec(move || {
            debug!(ino, fh, "fsync");
            let Some(handle) = mount.handle(fh) else {
                reply.error(libc::EBADF);
                return;
            };
            match handle.fsync() {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let mount = Arc::clone(&self.mount);
        self.exec(move || {
            debug!(ino, fh, "release");
            match mount.release(fh) {
                Ok(()) => reply.ok(),
                Err(e) => {
                    warn!(fh, error = %e, "release failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let mount = Arc::clone(&self.mount);
        let paths = Arc::clone(&self.paths);
        self.exec(move || {
            debug!(ino, offset, "readdir");
            let Some(dir) = paths.path_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let listed = match mount.readdir(&dir) {
                Ok(listed) => listed,
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            };
            let parent_ino = path::parent(&dir)
                .map(|p| paths.ino_for(p))
                .unwrap_or(ROOT_INO);
            let mut entries: Vec<(u64, FileType, String)> = vec![
                (ino, FileType::Directory, ".".to_string()),
                (parent_ino, FileType::Directory, "..".to_string()),
            ];
            for entry in listed {
                let child = path::join(&dir, &entry.name);
                let kind = if entry.is_directory {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                };
                entries.push((paths.ino_for(&child), kind, entry.name));
            }
            for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
                if reply.add(ino, (i + 1) as i64, kind, &name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let mount = Arc::clone(&self.mount);
        self.exec(move || {
            debug!("statfs");
            match mount.statfs() {
                Ok(stat) => reply.statfs(
                    stat.blocks,
                    stat.bfree,
                    stat.bavail,
                    0,
                    0,
                    stat.bsize,
                    stat.namelen,
                    stat.bsize,
                ),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_string_lossy().into_owned();
        let value = value.to_vec();
        let mount = Arc::clone(&self.mount);
        let paths = Arc::clone(&self.paths);
        self.exec(move || {
            debug!(ino, %name, len = value.len(), "setxattr");
            let Some(p) = paths.path_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match mount.setxattr(&p, &name, &value) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name = name.to_string_lossy().into_owned();
        let mount = Arc::clone(&self.mount);
        let paths = Arc::clone(&self.paths);
        self.exec(move || {
            debug!(ino, %name, size, "getxattr");
            let Some(p) = paths.path_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match mount.getxattr(&p, &name) {
                Ok(value) => {
                    if size == 0 {
                        reply.size(value.len() as u32);
                    } else if value.len() as u32 <= size {
                        reply.data(&value);
                    } else {
                        reply.error(libc::ERANGE);
                    }
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let mount = Arc::clone(&self.mount);
        self.exec(move || {
            debug!(ino, size, "listxattr");
            let mut data = Vec::new();
            for name in mount.listxattr() {
                data.extend_from_slice(name.as_bytes());
                data.push(0);
            }
            if size == 0 {
                reply.size(data.len() as u32);
            } else if data.len() as u32 <= size {
                reply.data(&data);
            } else {
                reply.error(libc::ERANGE);
            }
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        // Symlinks do not exist here; an empty target keeps callers inert.
        debug!(ino, "readlink");
        reply.data(&[]);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        _target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        debug!(parent, name = %link_name.to_string_lossy(), "symlink (unsupported)");
        reply.error(libc::EOPNOTSUPP);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!(ino, newparent, name = %newname.to_string_lossy(), "link (unsupported)");
        reply.error(libc::EOPNOTSUPP);
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        debug!(ino, "fsyncdir");
        reply.ok();
    }

    fn destroy(&mut self) {
        debug!("destroy");
        // Join the pool first so in-flight callbacks finish, then release
        // whatever handles the kernel never closed.
        self.pool = None;
        self.mount.shutdown();
    }
}
