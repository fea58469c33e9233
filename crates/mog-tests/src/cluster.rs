//! In-memory MogileFS-style cluster.
//!
//! One shared state stands in for the tracker database, the FilePaths
//! directory index, and every storage node's blobs. The tracker and agent
//! views implement the same traits the real backends do, so a
//! [`mog_fs::Mount`] drives them unchanged. Every tracker verb and HTTP
//! request is logged for assertions about call counts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use mog_fs::{Connector, FsError, Mount, MountConfig};
use mog_http::{HttpError, NodeAgent, NodeResponse};
use mog_tracker::{
    CommitArgs, Device, DirEntry, FileInfo, NewDest, TrackerBackend, TrackerError,
};
use parking_lot::Mutex;

fn parent_of(p: &str) -> &str {
    match p.rfind('/') {
        Some(0) => "/",
        Some(idx) => &p[..idx],
        None => "/",
    }
}

fn basename_of(p: &str) -> &str {
    match p.rfind('/') {
        Some(idx) => &p[idx + 1..],
        None => p,
    }
}

struct ObjectRecord {
    urls: Vec<String>,
    size: u64,
    mtime: u64,
    class: String,
    checksum: Option<String>,
}

struct TempDest {
    url: String,
    class: String,
}

struct ClusterState {
    objects: BTreeMap<String, ObjectRecord>,
    dirs: HashSet<String>,
    blobs: HashMap<String, Vec<u8>>,
    temp: HashMap<u64, TempDest>,
    next_fid: u64,
    devices: Vec<Device>,
    tracker_calls: Vec<String>,
    http_calls: Vec<String>,
}

impl ClusterState {
    fn add_ancestor_dirs(&mut self, key: &str) {
        let mut dir = parent_of(key);
        while dir != "/" {
            self.dirs.insert(dir.to_string());
            dir = parent_of(dir);
        }
    }
}

/// A cluster whose tracker and storage nodes live in process memory.
#[derive(Clone)]
pub struct MemCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemCluster {
    /// Creates a cluster with a small default device table.
    pub fn new() -> Self {
        let devices = vec![
            Device {
                devid: 1,
                status: "alive".to_string(),
                observed_state: Some("writeable".to_string()),
                mb_free: 100,
                mb_total: 200,
            },
            Device {
                devid: 2,
                status: "alive".to_string(),
                observed_state: Some("readable".to_string()),
                mb_free: 500,
                mb_total: 1000,
            },
            Device {
                devid: 3,
                status: "down".to_string(),
                observed_state: Some("writeable".to_string()),
                mb_free: 50,
                mb_total: 100,
            },
        ];
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                objects: BTreeMap::new(),
                dirs: HashSet::new(),
                blobs: HashMap::new(),
                temp: HashMap::new(),
                next_fid: 1000,
                devices,
                tracker_calls: Vec::new(),
                http_calls: Vec::new(),
            })),
        }
    }

    /// Seeds a committed object at `key`.
    pub fn add_object(&self, key: &str, data: &[u8]) {
        self.add_object_with_dead_replica(key, data, false);
    }

    /// Seeds an object, optionally fronted by a replica URL whose storage
    /// node lost the bytes (reads from it fail with 404).
    pub fn add_object_with_dead_replica(&self, key: &str, data: &[u8], dead_first: bool) {
        let mut state = self.state.lock();
        let fid = state.next_fid;
        state.next_fid += 1;
        let url = format!("http://node.mem/dev1/{fid}.fid");
        let mut urls = Vec::new();
        if dead_first {
            urls.push(format!("http://node.mem/dev9/{fid}.fid"));
        }
        urls.push(url.clone());
        state.blobs.insert(url, data.to_vec());
        state.objects.insert(
            key.to_string(),
            ObjectRecord {
                urls,
                size: data.len() as u64,
                mtime: 1700000000,
                class: "default".to_string(),
                checksum: None,
            },
        );
        state.add_ancestor_dirs(key);
    }

    /// Committed bytes for `key`: the blob clamped and zero-padded to the
    /// recorded size, the way the cluster reports the object.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let record = state.objects.get(key)?;
        let mut data = record
            .urls
            .iter()
            .find_map(|url| state.blobs.get(url))
            .cloned()
            .unwrap_or_default();
        data.resize(record.size as usize, 0);
        Some(data)
    }

    /// Recorded size of a committed object.
    pub fn object_size(&self, key: &str) -> Option<u64> {
        self.state.lock().objects.get(key).map(|r| r.size)
    }

    /// Recorded checksum of a committed object.
    pub fn object_checksum(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .objects
            .get(key)
            .and_then(|r| r.checksum.clone())
    }

    /// Recorded storage class of a committed object.
    pub fn object_class(&self, key: &str) -> Option<String> {
        self.state.lock().objects.get(key).map(|r| r.class.clone())
    }

    /// True when the FilePaths index knows `dir` as a directory.
    pub fn has_dir(&self, dir: &str) -> bool {
        self.state.lock().dirs.contains(dir)
    }

    /// Every tracker verb observed so far, e.g. `"create_open /hello"`.
    pub fn tracker_calls(&self) -> Vec<String> {
        self.state.lock().tracker_calls.clone()
    }

    /// Tracker calls starting with `prefix`.
    pub fn tracker_calls_with(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .tracker_calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Every HTTP request observed so far, e.g. `"PUT <url> bytes 0-13/*"`.
    pub fn http_calls(&self) -> Vec<String> {
        self.state.lock().http_calls.clone()
    }

    /// Forgets the call logs.
    pub fn clear_calls(&self) {
        let mut state = self.state.lock();
        state.tracker_calls.clear();
        state.http_calls.clear();
    }

    /// Builds a mount over this cluster.
    pub fn mount(&self, config: MountConfig) -> Mount {
        Mount::new(config, Box::new(MemConnector(self.clone())))
    }
}

impl Default for MemCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Connector handing out per-thread views of a [`MemCluster`].
pub struct MemConnector(pub MemCluster);

impl Connector for MemConnector {
    fn tracker(&self) -> Result<Box<dyn TrackerBackend>, FsError> {
        Ok(Box::new(MemTracker {
            state: Arc::clone(&self.0.state),
        }))
    }

    fn agent(&self) -> Result<Box<dyn NodeAgent>, FsError> {
        Ok(Box::new(MemAgent {
            state: Arc::clone(&self.0.state),
        }))
    }
}

struct MemTracker {
    state: Arc<Mutex<ClusterState>>,
}

fn not_found() -> TrackerError {
    TrackerError::Tracker {
        errcode: "unknown_key".to_string(),
        errstr: "unknown_key".to_string(),
    }
}

impl TrackerBackend for MemTracker {
    fn list(&mut self, dir: &str) -> Result<Vec<DirEntry>, TrackerError> {
        let mut state = self.state.lock();
        state.tracker_calls.push(format!("list {dir}"));
        let dir = if dir == "/" {
            "/"
        } else {
            dir.trim_end_matches('/')
        };
        let mut entries = Vec::new();
        for sub in &state.dirs {
            if parent_of(sub) == dir {
                entries.push(DirEntry {
                    name: basename_of(sub).to_string(),
                    size: 0,
                    modified: None,
                    is_directory: true,
                });
            }
        }
        for (key, record) in &state.objects {
            if parent_of(key) == dir {
                entries.push(DirEntry {
                    name: basename_of(key).to_string(),
                    size: record.size,
                    modified: Some(record.mtime),
                    is_directory: false,
                });
            }
        }
        Ok(entries)
    }

    fn get_paths(&mut self, key: &str) -> Result<Vec<String>, TrackerError> {
        let mut state = self.state.lock();
        state.tracker_calls.push(format!("get_paths {key}"));
        Ok(state
            .objects
            .get(key)
            .map(|record| record.urls.clone())
            .unwrap_or_default())
    }

    fn file_info(&mut self, key: &str) -> Result<FileInfo, TrackerError> {
        let mut state = self.state.lock();
        state.tracker_calls.push(format!("file_info {key}"));
        let record = state.objects.get(key).ok_or_else(not_found)?;
        Ok(FileInfo {
            fid: None,
            length: Some(record.size),
            class: Some(record.class.clone()),
            checksum: record.checksum.clone(),
            devcount: Some(record.urls.len() as u64),
        })
    }

    fn create_open(&mut self, key: &str, class: Option<&str>) -> Result<NewDest, TrackerError> {
        let mut state = self.state.lock();
        state.tracker_calls.push(format!("create_open {key}"));
        let fid = state.next_fid;
        state.next_fid += 1;
        let url = format!("http://node.mem/dev1/{fid}.fid");
        state.temp.insert(
            fid,
            TempDest {
                url: url.clone(),
                class: class.unwrap_or("default").to_string(),
            },
        );
        Ok(NewDest { fid, devid: 1, url })
    }

    fn create_close(&mut self, args: &CommitArgs) -> Result<(), TrackerError> {
        let mut state = self.state.lock();
        state
            .tracker_calls
            .push(format!("create_close {}", args.key));
        let temp = state.temp.remove(&args.fid);
        if args.key.is_empty() {
            // Discard: drop the temporary object's bytes.
            state.blobs.remove(&args.url);
            return Ok(());
        }
        let class = temp
            .map(|t| t.class)
            .unwrap_or_else(|| "default".to_string());
        state.objects.insert(
            args.key.clone(),
            ObjectRecord {
                urls: vec![args.url.clone()],
                size: args.size,
                mtime: args.mtime,
                class,
                checksum: args.checksum.clone(),
            },
        );
        let key = args.key.clone();
        state.add_ancestor_dirs(&key);
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), TrackerError> {
        let mut state = self.state.lock();
        state.tracker_calls.push(format!("delete {key}"));
        state.objects.remove(key).ok_or_else(not_found)?;
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), TrackerError> {
        let mut state = self.state.lock();
        state.tracker_calls.push(format!("rename {from} {to}"));
        if state.objects.contains_key(to) {
            return Err(TrackerError::Tracker {
                errcode: "key_exists".to_string(),
                errstr: "target key exists".to_string(),
            });
        }
        let record = state.objects.remove(from).ok_or_else(not_found)?;
        state.objects.insert(to.to_string(), record);
        state.add_ancestor_dirs(to);
        Ok(())
    }

    fn update_class(&mut self, key: &str, class: &str) -> Result<(), TrackerError> {
        let mut state = self.state.lock();
        state.tracker_calls.push(format!("update_class {key} {class}"));
        match state.objects.get_mut(key) {
            Some(record) => {
                record.class = class.to_string();
                Ok(())
            }
            None => Err(not_found()),
        }
    }

    fn get_devices(&mut self) -> Result<Vec<Device>, TrackerError> {
        let mut state = self.state.lock();
        state.tracker_calls.push("get_devices".to_string());
        Ok(state.devices.clone())
    }
}

struct MemAgent {
    state: Arc<Mutex<ClusterState>>,
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Parses `bytes=A-B`.
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Parses `bytes A-B/*`.
fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let rest = value.strip_prefix("bytes ")?;
    let (span, _) = rest.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

impl NodeAgent for MemAgent {
    fn request(
        &mut self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<NodeResponse, HttpError> {
        let mut state = self.state.lock();
        let range_note = header(headers, "Range")
            .or_else(|| header(headers, "Content-Range"))
            .unwrap_or("-")
            .to_string();
        state.http_calls.push(format!("{method} {url} {range_note}"));

        match method {
            "GET" => {
                let blob = state.blobs.get(url).ok_or(HttpError::Status(404))?;
                match header(headers, "Range").and_then(parse_range) {
                    Some((start, end)) => {
                        if start >= blob.len() as u64 {
                            return Err(HttpError::RangeNotSatisfiable);
                        }
                        let stop = ((end + 1).min(blob.len() as u64)) as usize;
                        Ok(NodeResponse {
                            status: 206,
                            body: Bytes::copy_from_slice(&blob[start as usize..stop]),
                        })
                    }
                    None => Ok(NodeResponse {
                        status: 200,
                        body: Bytes::copy_from_slice(blob),
                    }),
                }
            }
            "PUT" => {
                let data = body.unwrap_or(&[]);
                match header(headers, "Content-Range").and_then(parse_content_range) {
                    Some((start, _end)) => {
                        let blob = state.blobs.entry(url.to_string()).or_default();
                        let end = start as usize + data.len();
                        if blob.len() < end {
                            blob.resize(end, 0);
                        }
                        blob[start as usize..end].copy_from_slice(data);
                    }
                    None => {
                        state.blobs.insert(url.to_string(), data.to_vec());
                    }
                }
                Ok(NodeResponse {
                    status: 200,
                    body: Bytes::new(),
                })
            }
            other => Err(HttpError::Transport(format!("unhandled method {other}"))),
        }
    }
}
