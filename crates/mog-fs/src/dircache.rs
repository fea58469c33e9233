//! Short-TTL directory listing cache with targeted invalidation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mog_tracker::DirEntry;
use parking_lot::{Mutex, RwLock};

use crate::path;

/// Cache statistics.
#[derive(Debug, Default, Clone)]
pub struct DirCacheStats {
    /// Fresh entries served from the cache
    pub hits: u64,
    /// Lookups that had to go to the tracker
    pub misses: u64,
    /// Entries dropped by mutating operations
    pub invalidations: u64,
}

struct Listing {
    expires_at: Instant,
    files: HashMap<String, DirEntry>,
}

/// TTL map from a trailing-slash directory path to its listing.
///
/// Readers may observe a stale listing until its deadline; any mutating
/// operation drops the affected directory and cascades up its ancestors.
pub struct DirCache {
    enabled: bool,
    ttl: Duration,
    entries: RwLock<HashMap<String, Listing>>,
    stats: Mutex<DirCacheStats>,
}

impl DirCache {
    /// Creates a cache; a disabled cache never stores or serves anything.
    pub fn new(enabled: bool, ttl: Duration) -> Self {
        Self {
            enabled,
            ttl,
            entries: RwLock::new(HashMap::new()),
            stats: Mutex::new(DirCacheStats::default()),
        }
    }

    /// Returns the fresh listing for `dir`, if any.
    pub fn get(&self, dir: &str) -> Option<HashMap<String, DirEntry>> {
        if !self.enabled {
            return None;
        }
        let key = path::dir_key(dir);
        let entries = self.entries.read();
        match entries.get(&key) {
            Some(listing) if Instant::now() < listing.expires_at => {
                self.stats.lock().hits += 1;
                Some(listing.files.clone())
            }
            _ => {
                self.stats.lock().misses += 1;
                None
            }
        }
    }

    /// Stores a fresh listing for `dir`.
    pub fn put(&self, dir: &str, entries: Vec<DirEntry>) {
        if !self.enabled {
            return;
        }
        let files = entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();
        self.entries.write().insert(
            path::dir_key(dir),
            Listing {
                expires_at: Instant::now() + self.ttl,
                files,
            },
        );
    }

    /// Drops `dir` and, when `flush_parent`, every ancestor up to the root.
    pub fn invalidate(&self, dir: &str, flush_parent: bool) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.write();
        let mut dropped = 0;
        let mut key = path::dir_key(dir);
        loop {
            if entries.remove(&key).is_some() {
                dropped += 1;
            }
            if !flush_parent || key == "/" {
                break;
            }
            key = match path::parent(&key) {
                Some(parent) => path::dir_key(parent),
                None => break,
            };
        }
        drop(entries);
        if dropped > 0 {
            self.stats.lock().invalidations += dropped;
        }
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> DirCacheStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            size: 1,
            modified: Some(1700000000),
            is_directory: false,
        }
    }

    #[test]
    fn test_put_get_within_ttl() {
        let cache = DirCache::new(true, Duration::from_secs(2));
        cache.put("/x", vec![entry("a"), entry("b")]);

        let files = cache.get("/x").expect("fresh");
        assert_eq!(files.len(), 2);
        assert!(files.contains_key("a"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_expiry() {
        let cache = DirCache::new(true, Duration::from_millis(10));
        cache.put("/x", vec![entry("a")]);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("/x").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_invalidate_cascades_to_parents() {
        let cache = DirCache::new(true, Duration::from_secs(60));
        cache.put("/", vec![entry("x")]);
        cache.put("/x", vec![entry("y")]);
        cache.put("/x/y", vec![entry("f")]);
        cache.put("/other", vec![entry("z")]);

        cache.invalidate("/x/y", true);
        assert!(cache.get("/x/y").is_none());
        assert!(cache.get("/x").is_none());
        assert!(cache.get("/").is_none());
        assert!(cache.get("/other").is_some());
        assert_eq!(cache.stats().invalidations, 3);
    }

    #[test]
    fn test_invalidate_targeted() {
        let cache = DirCache::new(true, Duration::from_secs(60));
        cache.put("/", vec![entry("x")]);
        cache.put("/x", vec![entry("y")]);

        cache.invalidate("/x", false);
        assert!(cache.get("/x").is_none());
        assert!(cache.get("/").is_some());
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = DirCache::new(false, Duration::from_secs(60));
        cache.put("/x", vec![entry("a")]);
        assert!(cache.get("/x").is_none());
    }
}
