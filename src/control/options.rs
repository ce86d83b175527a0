//! Configurable knobs for the control plane client along with validation
//! helpers so callers can reason about timeouts, concurrency, and body limits.

use anyhow::{bail, Result};
use std::time::Duration;

pub const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 16;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
/// Envelope overhead reserved on top of an encoded chunk.
const CHUNK_ENVELOPE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ControlPlaneOptions {
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub max_request_body_bytes: usize,
    pub max_response_body_bytes: usize,
}

impl Default for ControlPlaneOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_request_body_bytes: DEFAULT_HTTP_BODY_LIMIT_BYTES,
            max_response_body_bytes: DEFAULT_HTTP_BODY_LIMIT_BYTES,
        }
    }
}

impl ControlPlaneOptions {
    /// Raises the request body limit so one base64-encoded chunk of
    /// `chunk_size` bytes fits in a single `upload.chunk` call.
    pub fn fit_chunk_size(mut self, chunk_size: usize) -> Self {
        let needed = chunk_request_body_bytes(chunk_size);
        if needed > self.max_request_body_bytes {
            self.max_request_body_bytes = needed;
        }
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }
        if self.max_concurrent_requests == 0 {
            bail!("max_concurrent_requests must be greater than 0");
        }
        if self.max_request_body_bytes == 0 {
            bail!("max_request_body_bytes must be greater than 0");
        }
        if self.max_response_body_bytes == 0 {
            bail!("max_response_body_bytes must be greater than 0");
        }
        Ok(())
    }
}

/// Bytes needed on the wire for one chunk: base64 expands by 4/3, plus the
/// JSON-RPC envelope.
pub fn chunk_request_body_bytes(chunk_size: usize) -> usize {
    chunk_size
        .div_ceil(3)
        .saturating_mul(4)
        .saturating_add(CHUNK_ENVELOPE_BYTES)
}
