//! Inode-number bookkeeping for the kernel-facing API.
//!
//! The store is path-addressed; the FUSE binding is inode-addressed. This
//! table hands out stable inode numbers for paths on demand. It carries no
//! metadata — attributes always come from the tracker or a live handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Root inode number (FUSE convention).
pub const ROOT_INO: u64 = 1;

struct Maps {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
}

/// Bidirectional ino ↔ path table.
pub struct PathTable {
    maps: RwLock<Maps>,
    next: AtomicU64,
}

impl PathTable {
    /// Creates a table holding only the root.
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INO, "/".to_string());
        by_path.insert("/".to_string(), ROOT_INO);
        Self {
            maps: RwLock::new(Maps { by_ino, by_path }),
            next: AtomicU64::new(ROOT_INO + 1),
        }
    }

    /// Inode number for a normalized path, assigning one if needed.
    pub fn ino_for(&self, path: &str) -> u64 {
        if let Some(ino) = self.maps.read().by_path.get(path) {
            return *ino;
        }
        let mut maps = self.maps.write();
        if let Some(ino) = maps.by_path.get(path) {
            return *ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        maps.by_ino.insert(ino, path.to_string());
        maps.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Path for an inode number.
    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.maps.read().by_ino.get(&ino).cloned()
    }

    /// Moves a path to a new name, keeping its inode number.
    pub fn rename(&self, from: &str, to: &str) {
        let mut maps = self.maps.write();
        if let Some(ino) = maps.by_path.remove(from) {
            maps.by_path.remove(to);
            maps.by_ino.insert(ino, to.to_string());
            maps.by_path.insert(to.to_string(), ino);
        }
    }

    /// Forgets a path.
    pub fn remove(&self, path: &str) {
        let mut maps = self.maps.write();
        if let Some(ino) = maps.by_path.remove(path) {
            maps.by_ino.remove(&ino);
        }
    }
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}
