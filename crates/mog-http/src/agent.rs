//! Keep-alive HTTP agent over a blocking reqwest client.

use std::time::Duration;

use tracing::trace;

use crate::{HttpError, NodeAgent, NodeResponse};

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Per-request timeout covering connect, send, and body read
    pub request_timeout: Duration,
    /// How long idle keep-alive connections stay pooled
    pub idle_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// [`NodeAgent`] backed by a pooled blocking reqwest client.
pub struct HttpAgent {
    client: reqwest::blocking::Client,
}

impl HttpAgent {
    /// Builds an agent with the given pool configuration.
    pub fn new(config: AgentConfig) -> Result<Self, HttpError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .pool_idle_timeout(config.idle_timeout)
            .build()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

impl NodeAgent for HttpAgent {
    fn request(
        &mut self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<NodeResponse, HttpError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| HttpError::Transport(format!("Bad method {method:?}")))?;
        trace!(%method, url, "storage node request");

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout
            } else {
                HttpError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(HttpError::RangeNotSatisfiable);
        }
        if !status.is_success() {
            return Err(HttpError::Status(status.as_u16()));
        }
        let body = response
            .bytes()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        Ok(NodeResponse {
            status: status.as_u16(),
            body,
        })
    }
}
