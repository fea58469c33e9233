//! Open-file state machine: POSIX handle semantics over ranged HTTP.
//!
//! A writable handle stages its writes into a freshly allocated remote
//! object while the old object keeps serving reads. A copy-on-write cursor
//! tracks how much of the old object has been propagated into the new one;
//! commit happens on flush via `create_close`, atomically replacing the
//! object under the key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use mog_tracker::CommitArgs;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::WriteBuffer;
use crate::checksum::Checksummer;
use crate::mount::Shared;
use crate::FsError;

/// Bytes copied per copy-on-write round trip.
const COW_CHUNK: u64 = 1024 * 1024;

/// Read/write disposition parsed from the kernel's open flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    /// Reads permitted
    pub read: bool,
    /// Writes permitted
    pub write: bool,
}

impl OpenMode {
    /// Read-only access.
    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
    };
    /// Write-only access.
    pub const WRITE_ONLY: Self = Self {
        read: false,
        write: true,
    };
    /// Read-write access.
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };

    /// Decodes the POSIX access-mode bits.
    pub fn from_flags(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => Self::WRITE_ONLY,
            libc::O_RDWR => Self::READ_WRITE,
            _ => Self::READ_ONLY,
        }
    }
}

/// Remote destination allocated by `create_open`.
#[derive(Debug)]
struct Dest {
    fid: u64,
    devid: u64,
    url: String,
    /// Highest byte written plus one; pinned down by truncate
    size: u64,
    /// Sticky: once a write or commit failed, the commit must discard
    error: bool,
}

/// Mutable I/O state guarded by the handle lock.
///
/// `paths = None` means "not resolved" and only occurs after a commit; both
/// open branches resolve eagerly. `cow = None` means no copy-on-write is
/// pending, either because the key had no prior object or because the old
/// object has been fully propagated.
struct IoState {
    paths: Option<Vec<String>>,
    cow: Option<u64>,
    /// Whether the key resolved to an existing object at open or last commit
    had_prior: bool,
    dirty: bool,
}

/// One open file.
pub struct FileHandle {
    id: u64,
    path: String,
    mode: OpenMode,
    shared: Arc<Shared>,
    io: Mutex<IoState>,
    dest: Mutex<Option<Dest>>,
    buffer: Option<Mutex<WriteBuffer>>,
    checksum: Option<Mutex<Checksummer>>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl FileHandle {
    /// Opens `path`. A read-only open of an unknown key yields `None`,
    /// surfaced as ENOENT upstream. `excl` fails a writable open of an
    /// existing key with [`FsError::Exists`].
    pub(crate) fn open(
        shared: Arc<Shared>,
        path: String,
        mode: OpenMode,
        excl: bool,
    ) -> Result<Option<Arc<Self>>, FsError> {
        static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

        let paths = shared.tracker(|t| t.get_paths(&path))?;
        let io = if mode.write {
            if excl && !paths.is_empty() {
                return Err(FsError::Exists);
            }
            if paths.is_empty() {
                // No prior object: born dirty so close commits an empty one.
                IoState {
                    paths: Some(Vec::new()),
                    cow: None,
                    had_prior: false,
                    dirty: true,
                }
            } else {
                IoState {
                    paths: Some(paths),
                    cow: Some(0),
                    had_prior: true,
                    dirty: false,
                }
            }
        } else {
            if paths.is_empty() {
                return Ok(None);
            }
            IoState {
                paths: Some(paths),
                cow: None,
                had_prior: true,
                dirty: false,
            }
        };

        let buffered = mode.write && shared.config.buffered;
        let checksummed = mode.write && shared.config.checksums;
        let kind = shared.config.checksum_kind;
        let handle = Arc::new(Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            path,
            mode,
            shared,
            io: Mutex::new(io),
            dest: Mutex::new(None),
            buffer: buffered.then(|| Mutex::new(WriteBuffer::new())),
            checksum: checksummed.then(|| Mutex::new(Checksummer::new(kind))),
        });
        debug!(id = handle.id, path = %handle.path, ?mode, "Opened handle");
        Ok(Some(handle))
    }

    /// Process-unique handle id; doubles as the kernel file handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The normalized path this handle serves.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The access mode the handle was opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Whether the handle carries uncommitted changes.
    pub fn is_dirty(&self) -> bool {
        self.io.lock().dirty
    }

    /// Logical size: pending output size when dirty, else the committed
    /// object's recorded length.
    pub fn size(&self) -> Result<u64, FsError> {
        let io = self.io.lock();
        if self.mode.write && io.dirty {
            let dest_size = self.dest.lock().as_ref().map(|d| d.size).unwrap_or(0);
            let buffer_end = self
                .buffer
                .as_ref()
                .and_then(|b| b.lock().end_offset())
                .unwrap_or(0);
            return Ok(dest_size.max(buffer_end));
        }
        drop(io);
        let info = self.shared.tracker(|t| t.file_info(&self.path))?;
        Ok(info.length.unwrap_or(0))
    }

    /// Allocates the remote destination on first need: `create_open`, then
    /// an empty PUT to materialize the object at the storage node.
    fn ensure_dest<'a>(&self, dest: &'a mut Option<Dest>) -> Result<&'a mut Dest, FsError> {
        if dest.is_none() {
            let class = self.shared.config.class.clone();
            let new_dest = self
                .shared
                .tracker(|t| t.create_open(&self.path, class.as_deref()))?;
            let mut d = Dest {
                fid: new_dest.fid,
                devid: new_dest.devid,
                url: new_dest.url,
                size: 0,
                error: false,
            };
            debug!(path = %self.path, fid = d.fid, devid = d.devid, "Allocated destination");
            if let Err(e) = self.shared.agent(|a| a.create_empty(&d.url)) {
                d.error = true;
                *dest = Some(d);
                return Err(e);
            }
            *dest = Some(d);
        }
        dest.as_mut()
            .ok_or_else(|| FsError::Io("destination unavailable".to_string()))
    }

    /// Ranged read against the input replicas, best first. A replica
    /// reporting range-not-satisfiable ends the read with empty bytes; any
    /// other failure moves on to the next replica.
    fn read_input(&self, paths: &[String], offset: u64, len: u64) -> Result<Bytes, FsError> {
        let mut last_error: Option<FsError> = None;
        for url in paths {
            match self.shared.agent(|a| a.get_range(url, offset, len)) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    debug!(%url, error = %e, "Replica read failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| FsError::Io("no readable replica".to_string())))
    }

    /// Ranged read against the output destination.
    fn read_output(&self, offset: u64, len: u64) -> Result<Bytes, FsError> {
        let url = {
            let dest = self.dest.lock();
            match dest.as_ref() {
                Some(d) => d.url.clone(),
                // Nothing was ever written; the object has no bytes yet.
                None => return Ok(Bytes::new()),
            }
        };
        self.shared.agent(|a| a.get_range(&url, offset, len))
    }

    /// Ranged PUT to the destination; tracks the high-water size and sets
    /// the sticky error flag on failure.
    fn raw_write(&self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        if data.is_empty() {
            return Ok(0);
        }
        let url = {
            let mut dest = self.dest.lock();
            self.ensure_dest(&mut dest)?.url.clone()
        };
        let result = self.shared.agent(|a| a.put_range(&url, offset, data));
        let mut dest = self.dest.lock();
        if let Some(d) = dest.as_mut() {
            match &result {
                Ok(()) => d.size = d.size.max(offset + data.len() as u64),
                Err(e) => {
                    warn!(path = %self.path, offset, error = %e, "Destination write failed");
                    d.error = true;
                }
            }
        }
        result.map(|()| data.len())
    }

    /// Re-resolves the input paths after a commit; a key that now exists
    /// re-enters copy-on-write from the newly committed object.
    fn ensure_paths(&self, io: &mut IoState) -> Result<(), FsError> {
        if io.paths.is_none() {
            let paths = self.shared.tracker(|t| t.get_paths(&self.path))?;
            io.had_prior = !paths.is_empty();
            if io.had_prior && io.cow.is_none() && !io.dirty {
                io.cow = Some(0);
            }
            io.paths = Some(paths);
        }
        Ok(())
    }

    /// Advances the copy-on-write cursor to `target`, copying the old
    /// object into the destination in [`COW_CHUNK`] pieces. Reads never go
    /// past `limit`. A short read means the old object is exhausted and the
    /// cursor is dropped.
    fn cow_advance(
        &self,
        io: &mut IoState,
        target: u64,
        limit: Option<u64>,
    ) -> Result<(), FsError> {
        while let Some(pos) = io.cow {
            if pos >= target {
                break;
            }
            let mut want = COW_CHUNK.min(target - pos);
            if let Some(limit) = limit {
                want = want.min(limit.saturating_sub(pos));
            }
            if want == 0 {
                break;
            }
            let paths = io.paths.clone().unwrap_or_default();
            let data = self.read_input(&paths, pos, want)?;
            if data.is_empty() {
                io.cow = None;
                break;
            }
            self.raw_write(pos, &data)?;
            io.cow = Some(pos + data.len() as u64);
        }
        Ok(())
    }

    /// Drains the coalescing buffer into the destination.
    fn drain_buffer(&self) -> Result<(), FsError> {
        if let Some(buffer) = &self.buffer {
            let run = buffer.lock().take();
            if let Some(run) = run {
                self.raw_write(run.offset, &run.data)?;
            }
        }
        Ok(())
    }

    /// Writes `data` at `offset`, preserving old-object bytes behind the
    /// write through copy-on-write first.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        if !self.mode.write {
            return Err(FsError::Access);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let mut io = self.io.lock();
        self.ensure_paths(&mut io)?;
        io.dirty = true;
        self.cow_advance(&mut io, offset + data.len() as u64, None)?;
        if let Some(checksum) = &self.checksum {
            checksum.lock().observe(offset, data);
        }
        match &self.buffer {
            Some(buffer) => {
                let runs = buffer.lock().push(offset, data);
                for run in runs {
                    self.raw_write(run.offset, &run.data)?;
                }
                // Accepted into the buffer; persistence failures surface on
                // the next flush or read.
                Ok(data.len())
            }
            None => self.raw_write(offset, data),
        }
    }

    /// Reads up to `len` bytes at `offset`. A dirty handle reads its own
    /// destination (after draining the buffer and advancing COW); otherwise
    /// the input replicas serve the read.
    pub fn read(&self, offset: u64, len: u64) -> Result<Bytes, FsError> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let mut io = self.io.lock();
        if self.mode.write && io.dirty {
            self.drain_buffer()?;
            self.cow_advance(&mut io, offset + len, None)?;
            self.read_output(offset, len)
        } else {
            self.ensure_paths(&mut io)?;
            let paths = io.paths.clone().unwrap_or_default();
            drop(io);
            self.read_input(&paths, offset, len)
        }
    }

    /// Truncates the object to `size`, effective at commit.
    ///
    /// With a pending COW cursor the old object is propagated up to `size`
    /// and the cursor dropped; the cursor must not already be past `size`.
    /// A handle whose key never existed just pins the commit size. Between
    /// a commit and the next write there is no cursor to honor, so the
    /// operation fails.
    pub fn truncate(&self, size: u64) -> Result<(), FsError> {
        if !self.mode.write {
            return Err(FsError::Access);
        }
        let mut io = self.io.lock();
        self.drain_buffer()?;
        match io.cow {
            Some(pos) if pos > size => {
                return Err(FsError::Io(format!(
                    "cannot truncate to {size}: {pos} bytes already propagated"
                )));
            }
            Some(_) => {
                io.dirty = true;
                self.cow_advance(&mut io, size, Some(size))?;
                io.cow = None;
            }
            None if !io.had_prior && io.paths.is_some() => {
                io.dirty = true;
            }
            None => {
                return Err(FsError::Io("truncate without a copy cursor".to_string()));
            }
        }
        if let Some(checksum) = &self.checksum {
            checksum.lock().disable();
        }
        let mut dest = self.dest.lock();
        let d = self.ensure_dest(&mut dest)?;
        d.size = size;
        Ok(())
    }

    /// Drains the write buffer without committing.
    pub fn fsync(&self) -> Result<(), FsError> {
        self.drain_buffer()
    }

    /// Commits pending changes: drains the buffer, finalizes the checksum,
    /// propagates the remaining COW, and calls `create_close`. On success
    /// the handle's I/O state resets so it can be written again; the next
    /// write re-enters COW from the newly committed object.
    pub fn flush(&self) -> Result<(), FsError> {
        let mut io = self.io.lock();
        if !(self.mode.write && io.dirty) {
            return Ok(());
        }
        self.drain_buffer()?;
        let checksum = self.checksum.as_ref().and_then(|c| c.lock().finalize());
        self.cow_advance(&mut io, u64::MAX, None)?;

        let args = {
            let mut dest = self.dest.lock();
            let d = self.ensure_dest(&mut dest)?;
            CommitArgs {
                fid: d.fid,
                devid: d.devid,
                // An errored destination commits under the empty key,
                // asking the tracker to discard the temporary object.
                key: if d.error {
                    String::new()
                } else {
                    self.path.clone()
                },
                url: d.url.clone(),
                size: d.size,
                mtime: unix_now(),
                checksum,
            }
        };
        let discard = args.key.is_empty();
        let committed = self.shared.tracker(|t| t.create_close(&args));
        self.shared.invalidate_for(&self.path);
        if discard {
            if let Err(e) = committed {
                warn!(path = %self.path, error = %e, "Discarding errored destination failed");
            }
            return Err(FsError::Io("destination in error state".to_string()));
        }
        committed?;
        debug!(path = %self.path, size = args.size, "Committed");

        // Reinitialize so the handle can be reused for further writes.
        io.paths = None;
        io.cow = None;
        io.had_prior = true;
        io.dirty = false;
        *self.dest.lock() = None;
        if let Some(checksum) = &self.checksum {
            *checksum.lock() = Checksummer::new(self.shared.config.checksum_kind);
        }
        Ok(())
    }

    /// Final flush before the handle is discarded.
    pub fn release(&self) -> Result<(), FsError> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_mode_from_flags() {
        assert_eq!(OpenMode::from_flags(libc::O_RDONLY), OpenMode::READ_ONLY);
        assert_eq!(OpenMode::from_flags(libc::O_WRONLY), OpenMode::WRITE_ONLY);
        assert_eq!(OpenMode::from_flags(libc::O_RDWR), OpenMode::READ_WRITE);
        assert_eq!(
            OpenMode::from_flags(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC),
            OpenMode::WRITE_ONLY
        );
    }

    #[test]
    fn test_unix_now_is_sane() {
        // Well past 2020-01-01.
        assert!(unix_now() > 1_577_836_800);
    }
}
