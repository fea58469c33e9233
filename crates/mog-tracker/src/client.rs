//! TCP tracker client with failover and per-request reconnect.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, warn};

use crate::proto::{self, maybe_u64, need, need_u64};
use crate::{CommitArgs, Device, DirEntry, FileInfo, NewDest, TrackerBackend, TrackerError};

/// Connect and request timeout applied to tracker sockets.
const TRACKER_TIMEOUT: Duration = Duration::from_secs(5);

/// Tracker client speaking the line protocol over TCP.
///
/// Holds at most one connection; connect failures walk the tracker list and
/// a request on a broken connection reconnects once before giving up.
pub struct TcpTracker {
    trackers: Vec<String>,
    domain: String,
    conn: Option<BufReader<TcpStream>>,
}

impl TcpTracker {
    /// Creates a client bound to `domain` over the given `host:port` list.
    pub fn new(trackers: Vec<String>, domain: String) -> Self {
        Self {
            trackers,
            domain,
            conn: None,
        }
    }

    fn connect(&mut self) -> Result<(), TrackerError> {
        for tracker in &self.trackers {
            let addrs = match tracker.to_socket_addrs() {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(%tracker, error = %e, "Bad tracker address");
                    continue;
                }
            };
            for addr in addrs {
                match TcpStream::connect_timeout(&addr, TRACKER_TIMEOUT) {
                    Ok(stream) => {
                        stream.set_read_timeout(Some(TRACKER_TIMEOUT))?;
                        stream.set_write_timeout(Some(TRACKER_TIMEOUT))?;
                        debug!(%tracker, "Connected to tracker");
                        self.conn = Some(BufReader::new(stream));
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(%tracker, error = %e, "Tracker connect failed");
                    }
                }
            }
        }
        Err(TrackerError::NoTrackerReachable)
    }

    fn round_trip(&mut self, line: &str) -> Result<String, TrackerError> {
        if self.conn.is_none() {
            self.connect()?;
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or(TrackerError::NoTrackerReachable)?;
        conn.get_mut().write_all(line.as_bytes())?;
        let mut response = String::new();
        if conn.read_line(&mut response)? == 0 {
            return Err(TrackerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "tracker closed the connection",
            )));
        }
        Ok(response)
    }

    /// Sends one request, reconnecting once if the connection went stale.
    fn request(
        &mut self,
        verb: &str,
        args: &[(&str, String)],
    ) -> Result<HashMap<String, String>, TrackerError> {
        let line = proto::encode_request(verb, args);
        let response = match self.round_trip(&line) {
            Ok(response) => response,
            Err(TrackerError::Io(e)) => {
                debug!(verb, error = %e, "Tracker connection stale, reconnecting");
                self.conn = None;
                self.connect()?;
                self.round_trip(&line)?
            }
            Err(e) => return Err(e),
        };
        proto::parse_response(&response)
    }

    fn domain_arg(&self) -> (&'static str, String) {
        ("domain", self.domain.clone())
    }
}

impl TrackerBackend for TcpTracker {
    fn list(&mut self, dir: &str) -> Result<Vec<DirEntry>, TrackerError> {
        let args = [self.domain_arg(), ("arg1", dir.to_string())];
        let response = match self.request("filepaths_list_directory", &args) {
            Ok(response) => response,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let count = need_u64(&response, "files")?;
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count {
            let name = need(&response, &format!("file{i}"))?.to_string();
            let is_directory =
                response.get(&format!("file{i}.type")).map(String::as_str) == Some("directory");
            entries.push(DirEntry {
                name,
                size: maybe_u64(&response, &format!("file{i}.size")).unwrap_or(0),
                modified: maybe_u64(&response, &format!("file{i}.modified")),
                is_directory,
            });
        }
        Ok(entries)
    }

    fn get_paths(&mut self, key: &str) -> Result<Vec<String>, TrackerError> {
        let args = [
            self.domain_arg(),
            ("key", key.to_string()),
            ("noverify", "1".to_string()),
        ];
        let response = match self.request("get_paths", &args) {
            Ok(response) => response,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let count = need_u64(&response, "paths")?;
        let mut paths = Vec::with_capacity(count as usize);
        for i in 1..=count {
            paths.push(need(&response, &format!("path{i}"))?.to_string());
        }
        Ok(paths)
    }

    fn file_info(&mut self, key: &str) -> Result<FileInfo, TrackerError> {
        let args = [
            self.domain_arg(),
            ("key", key.to_string()),
            ("devices", "0".to_string()),
        ];
        let response = self.request("file_info", &args)?;
        Ok(FileInfo {
            fid: maybe_u64(&response, "fid"),
            length: maybe_u64(&response, "length"),
            class: response.get("class").cloned(),
            checksum: response.get("checksum").cloned(),
            devcount: maybe_u64(&response, "devcount"),
        })
    }

    fn create_open(&mut self, key: &str, class: Option<&str>) -> Result<NewDest, TrackerError> {
        let mut args = vec![
            self.domain_arg(),
            ("key", key.to_string()),
            ("fid", "0".to_string()),
            ("multi_dest", "0".to_string()),
        ];
        if let Some(class) = class {
            args.push(("class", class.to_string()));
        }
        let response = self.request("create_open", &args)?;
        Ok(NewDest {
            fid: need_u64(&response, "fid")?,
            devid: need_u64(&response, "devid")?,
            url: need(&response, "path")?.to_string(),
        })
    }

    fn create_close(&mut self, commit: &CommitArgs) -> Result<(), TrackerError> {
        let mut args = vec![
            self.domain_arg(),
            ("fid", commit.fid.to_string()),
            ("devid", commit.devid.to_string()),
            ("key", commit.key.clone()),
            ("path", commit.url.clone()),
            ("size", commit.size.to_string()),
            ("plugin.meta.keys", "1".to_string()),
            ("plugin.meta.key0", "mtime".to_string()),
            ("plugin.meta.value0", commit.mtime.to_string()),
        ];
        if let Some(checksum) = &commit.checksum {
            args.push(("checksum", checksum.clone()));
            args.push(("checksumverify", "1".to_string()));
        }
        self.request("create_close", &args).map(|_| ())
    }

    fn delete(&mut self, key: &str) -> Result<(), TrackerError> {
        let args = [self.domain_arg(), ("key", key.to_string())];
        self.request("delete", &args).map(|_| ())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), TrackerError> {
        let args = [
            self.domain_arg(),
            ("from_key", from.to_string()),
            ("to_key", to.to_string()),
        ];
        self.request("rename", &args).map(|_| ())
    }

    fn update_class(&mut self, key: &str, class: &str) -> Result<(), TrackerError> {
        let args = [
            self.domain_arg(),
            ("key", key.to_string()),
            ("class", class.to_string()),
        ];
        self.request("update_class", &args).map(|_| ())
    }

    fn get_devices(&mut self) -> Result<Vec<Device>, TrackerError> {
        let response = self.request("get_devices", &[])?;
        let count = need_u64(&response, "devices")?;
        let mut devices = Vec::with_capacity(count as usize);
        for i in 1..=count {
            devices.push(Device {
                devid: need_u64(&response, &format!("dev{i}_devid"))?,
                status: need(&response, &format!("dev{i}_status"))?.to_string(),
                observed_state: response.get(&format!("dev{i}_observed_state")).cloned(),
                mb_free: maybe_u64(&response, &format!("dev{i}_mb_free")).unwrap_or(0),
                mb_total: maybe_u64(&response, &format!("dev{i}_mb_total")).unwrap_or(0),
            });
        }
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serves one connection, answering each request line with the next
    /// canned response, and returns the request lines it saw.
    fn canned_tracker(responses: Vec<&'static str>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut stream = stream;
            let mut seen = Vec::new();
            for response in responses {
                let mut line = String::new();
                if reader.read_line(&mut line).expect("read") == 0 {
                    break;
                }
                seen.push(line.trim_end().to_string());
                stream.write_all(response.as_bytes()).expect("write");
            }
            seen
        });
        (addr, handle)
    }

    #[test]
    fn test_get_paths_roundtrip() {
        let (addr, server) = canned_tracker(vec![
            "OK paths=2&path1=http%3A%2F%2Fn1%2F1.fid&path2=http%3A%2F%2Fn2%2F1.fid\r\n",
        ]);
        let mut tracker = TcpTracker::new(vec![addr], "testdom".to_string());

        let paths = tracker.get_paths("/a").expect("get_paths");
        assert_eq!(paths, vec!["http://n1/1.fid", "http://n2/1.fid"]);

        let seen = server.join().expect("join");
        assert!(seen[0].starts_with("get_paths "));
        assert!(seen[0].contains("domain=testdom"));
        assert!(seen[0].contains("key=%2Fa"));
    }

    #[test]
    fn test_get_paths_unknown_key_is_empty() {
        let (addr, server) = canned_tracker(vec!["ERR unknown_key unknown_key\r\n"]);
        let mut tracker = TcpTracker::new(vec![addr], "testdom".to_string());

        assert!(tracker.get_paths("/missing").expect("get_paths").is_empty());
        server.join().expect("join");
    }

    #[test]
    fn test_create_open_and_close() {
        let (addr, server) = canned_tracker(vec![
            "OK fid=7&devid=3&path=http%3A%2F%2Fn1%2F7.fid\r\n",
            "OK\r\n",
        ]);
        let mut tracker = TcpTracker::new(vec![addr], "testdom".to_string());

        let dest = tracker.create_open("/f", Some("archive")).expect("open");
        assert_eq!(dest.fid, 7);
        assert_eq!(dest.devid, 3);
        assert_eq!(dest.url, "http://n1/7.fid");

        tracker
            .create_close(&CommitArgs {
                fid: dest.fid,
                devid: dest.devid,
                key: "/f".to_string(),
                url: dest.url,
                size: 14,
                mtime: 1700000000,
                checksum: None,
            })
            .expect("close");

        let seen = server.join().expect("join");
        assert!(seen[0].contains("class=archive"));
        assert!(seen[1].contains("plugin.meta.key0=mtime"));
        assert!(seen[1].contains("size=14"));
    }

    #[test]
    fn test_list_directory() {
        let (addr, server) = canned_tracker(vec![concat!(
            "OK files=2&file0=notes.txt&file0.size=12&file0.modified=1700000000",
            "&file0.type=file&file1=sub&file1.type=directory\r\n"
        )]);
        let mut tracker = TcpTracker::new(vec![addr], "testdom".to_string());

        let entries = tracker.list("/").expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "notes.txt");
        assert_eq!(entries[0].size, 12);
        assert!(!entries[0].is_directory);
        assert!(entries[1].is_directory);
        server.join().expect("join");
    }

    #[test]
    fn test_get_devices() {
        let (addr, server) = canned_tracker(vec![concat!(
            "OK devices=2",
            "&dev1_devid=1&dev1_status=alive&dev1_observed_state=writeable",
            "&dev1_mb_free=100&dev1_mb_total=200",
            "&dev2_devid=2&dev2_status=down&dev2_mb_free=50&dev2_mb_total=200\r\n"
        )]);
        let mut tracker = TcpTracker::new(vec![addr], "testdom".to_string());

        let devices = tracker.get_devices().expect("get_devices");
        assert_eq!(devices.len(), 2);
        assert!(devices[0].is_writeable());
        assert!(!devices[1].is_writeable());
        server.join().expect("join");
    }

    #[test]
    fn test_no_tracker_reachable() {
        let mut tracker = TcpTracker::new(Vec::new(), "testdom".to_string());
        assert!(matches!(
            tracker.get_paths("/a"),
            Err(TrackerError::NoTrackerReachable)
        ));
    }
}
