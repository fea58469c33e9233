//! Mog HTTP - persistent-connection user agent for storage-node I/O.
//!
//! Storage nodes speak plain HTTP: ranged GET for reads and partial-content
//! PUT (`Content-Range: bytes A-B/*`) for writes. This crate exposes one
//! synchronous request primitive behind the [`NodeAgent`] seam, with a
//! distinguished range-not-satisfiable outcome callers treat as end of
//! object rather than failure.

#![deny(unsafe_code)]

pub mod agent;

pub use agent::{AgentConfig, HttpAgent};

use bytes::Bytes;
use thiserror::Error;

/// HTTP transport errors.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The requested byte range starts at or past the end of the object
    #[error("Requested range not satisfiable")]
    RangeNotSatisfiable,

    /// Request timed out
    #[error("Request timed out")]
    Timeout,

    /// Non-success status from the storage node
    #[error("HTTP status {0}")]
    Status(u16),

    /// Connection or protocol failure below the status line
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Response surfaced by [`NodeAgent::request`].
#[derive(Debug)]
pub struct NodeResponse {
    /// HTTP status code (always a success code; failures become errors)
    pub status: u16,
    /// Response body
    pub body: Bytes,
}

/// One synchronous request primitive against a storage node.
///
/// Implementations are per-thread; `Send` lets a worker be handed one.
pub trait NodeAgent: Send {
    /// Issues `method url` with the given extra headers and optional body.
    fn request(
        &mut self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<NodeResponse, HttpError>;

    /// GETs `len` bytes at `offset`. Past end of object returns empty.
    fn get_range(&mut self, url: &str, offset: u64, len: u64) -> Result<Bytes, HttpError> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let range = format!("bytes={}-{}", offset, offset + len - 1);
        match self.request("GET", url, &[("Range".to_string(), range)], None) {
            Ok(response) => Ok(response.body),
            Err(HttpError::RangeNotSatisfiable) => Ok(Bytes::new()),
            Err(e) => Err(e),
        }
    }

    /// PUTs `data` at `offset` with a `Content-Range` header.
    fn put_range(&mut self, url: &str, offset: u64, data: &[u8]) -> Result<(), HttpError> {
        if data.is_empty() {
            return Ok(());
        }
        let range = format!("bytes {}-{}/*", offset, offset + data.len() as u64 - 1);
        self.request(
            "PUT",
            url,
            &[("Content-Range".to_string(), range)],
            Some(data),
        )
        .map(|_| ())
    }

    /// PUTs an empty body, materializing the object at the storage node.
    fn create_empty(&mut self, url: &str) -> Result<(), HttpError> {
        self.request("PUT", url, &[], Some(&[])).map(|_| ())
    }
}
