//! Uniform failure type returned by every control plane call, plus the
//! helpers that classify an `anyhow` chain as a lost connection.

use std::fmt;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// The control plane answered with an error object.
    Rejected,
    /// The request never reached the control plane (connect/reset/DNS).
    Transport,
    Timeout,
    /// The request parameters could not be encoded.
    InvalidRequest,
    /// The response could not be decoded into the expected record.
    InvalidResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    kind: ApiErrorKind,
    method: &'static str,
    status: i32,
    message: String,
}

impl ApiError {
    pub fn rejected(method: &'static str, status: i32, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Rejected,
            method,
            status,
            message: message.into(),
        }
    }

    pub fn transport(method: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Transport,
            method,
            status: 0,
            message: message.into(),
        }
    }

    pub fn timeout(method: &'static str) -> Self {
        Self {
            kind: ApiErrorKind::Timeout,
            method,
            status: 0,
            message: "request timed out".to_owned(),
        }
    }

    pub fn invalid_request(method: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::InvalidRequest,
            method,
            status: 0,
            message: message.into(),
        }
    }

    pub fn invalid_response(method: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::InvalidResponse,
            method,
            status: 0,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ApiErrorKind {
        self.kind
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_connection_lost(&self) -> bool {
        self.kind == ApiErrorKind::Transport
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ApiErrorKind::Rejected => write!(
                f,
                "control plane rejected {} (status={}): {}",
                self.method, self.status, self.message
            ),
            ApiErrorKind::Transport => {
                write!(f, "control plane unreachable during {}: {}", self.method, self.message)
            }
            ApiErrorKind::Timeout => write!(f, "control plane call {} timed out", self.method),
            ApiErrorKind::InvalidRequest => {
                write!(f, "failed to encode {} request: {}", self.method, self.message)
            }
            ApiErrorKind::InvalidResponse => write!(
                f,
                "control plane returned an invalid {} response: {}",
                self.method, self.message
            ),
        }
    }
}

impl std::error::Error for ApiError {}

/// Raised by payload code that detected the network went away on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLost {
    pub reason: String,
}

impl ConnectionLost {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConnectionLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "network connection lost: {}", self.reason)
    }
}

impl std::error::Error for ConnectionLost {}

/// Walks the error chain looking for a connectivity failure.
pub fn is_connection_lost(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<ConnectionLost>().is_some()
            || cause
                .downcast_ref::<ApiError>()
                .map(ApiError::is_connection_lost)
                .unwrap_or(false)
    })
}
