//! Streaming checksum over the user write stream.
//!
//! The digest only stays valid while writes arrive strictly in order from
//! offset zero; the first out-of-order write disables it for the rest of
//! the handle's life. Truncation invalidates it as well.

use digest::Digest;
use md5::Md5;
use sha2::Sha256;

/// Digest families available for commit-time verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// MD5, the cluster default
    Md5,
    /// SHA-256
    Sha256,
}

impl ChecksumKind {
    /// Wire label used in the `KIND:<hex>` commit argument.
    pub fn label(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha256 => "SHA-256",
        }
    }
}

enum DigestState {
    Md5(Md5),
    Sha256(Sha256),
}

impl DigestState {
    fn new(kind: ChecksumKind) -> Self {
        match kind {
            ChecksumKind::Md5 => Self::Md5(Md5::new()),
            ChecksumKind::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        match self {
            Self::Md5(d) => d.update(buf),
            Self::Sha256(d) => d.update(buf),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Md5(d) => hex::encode(d.finalize()),
            Self::Sha256(d) => hex::encode(d.finalize()),
        }
    }
}

/// Sequential streaming digest for one handle.
pub struct Checksummer {
    kind: ChecksumKind,
    pos: u64,
    state: DigestState,
    enabled: bool,
}

impl Checksummer {
    /// Creates an enabled checksummer positioned at offset zero.
    pub fn new(kind: ChecksumKind) -> Self {
        Self {
            kind,
            pos: 0,
            state: DigestState::new(kind),
            enabled: true,
        }
    }

    /// Whether the digest still tracks the byte stream.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Permanently stops tracking (out-of-order write, truncate).
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Folds a user write into the digest when it continues the run.
    pub fn observe(&mut self, offset: u64, buf: &[u8]) {
        if !self.enabled {
            return;
        }
        if offset != self.pos {
            self.enabled = false;
            return;
        }
        self.state.update(buf);
        self.pos += buf.len() as u64;
    }

    /// One-shot commit value `KIND:<hex>`; disables the digest afterwards.
    pub fn finalize(&mut self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        self.enabled = false;
        let state = std::mem::replace(&mut self.state, DigestState::new(self.kind));
        Some(format!("{}:{}", self.kind.label(), state.finalize_hex()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_md5() {
        let mut checksummer = Checksummer::new(ChecksumKind::Md5);
        checksummer.observe(0, b"Hello, ");
        checksummer.observe(7, b"world!\n");

        let value = checksummer.finalize().expect("enabled");
        let expected = hex::encode(Md5::digest(b"Hello, world!\n"));
        assert_eq!(value, format!("MD5:{expected}"));
    }

    #[test]
    fn test_out_of_order_disables_forever() {
        let mut checksummer = Checksummer::new(ChecksumKind::Md5);
        checksummer.observe(0, b"abc");
        checksummer.observe(10, b"def");
        assert!(!checksummer.is_enabled());

        // Even a write at the old position stays ignored.
        checksummer.observe(3, b"ghi");
        assert!(checksummer.finalize().is_none());
    }

    #[test]
    fn test_finalize_is_one_shot() {
        let mut checksummer = Checksummer::new(ChecksumKind::Sha256);
        checksummer.observe(0, b"data");
        let first = checksummer.finalize().expect("enabled");
        assert!(first.starts_with("SHA-256:"));
        assert!(checksummer.finalize().is_none());
    }

    #[test]
    fn test_must_start_at_zero() {
        let mut checksummer = Checksummer::new(ChecksumKind::Md5);
        checksummer.observe(5, b"late");
        assert!(!checksummer.is_enabled());
    }
}
