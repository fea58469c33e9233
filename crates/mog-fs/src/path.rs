//! Path normalization helpers.
//!
//! The canonical form is absolute with a leading `/`. Keys handed to the
//! tracker are the canonical path itself; directory-cache keys additionally
//! carry a trailing `/`.

/// Normalizes a kernel-supplied path: empty and `.` become `/`, anything
/// else gains a leading `/` if missing.
pub fn normalize(path: &str) -> String {
    if path.is_empty() || path == "." {
        return "/".to_string();
    }
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Directory-cache key form: normalized with a trailing `/`.
pub fn dir_key(dir: &str) -> String {
    let dir = normalize(dir);
    if dir.ends_with('/') {
        dir
    } else {
        format!("{dir}/")
    }
}

/// Splits a normalized path into `(parent dir, entry name)`; `None` at root.
pub fn split(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let idx = trimmed.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
    Some((parent, &trimmed[idx + 1..]))
}

/// Parent directory of a normalized path; `None` at root.
pub fn parent(path: &str) -> Option<&str> {
    split(path).map(|(dir, _)| dir)
}

/// Joins a directory and an entry name into a normalized path.
pub fn join(dir: &str, name: &str) -> String {
    let dir = normalize(dir);
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}
