use crate::control::ApiError;
use std::fmt;
use std::time::Duration;

/// Fatal startup failures of a supervised run.
#[derive(Debug)]
pub enum RunError {
    Authentication(ApiError),
    RunFetch(ApiError),
    /// The worker answered the handshake with a non-zero code.
    HandshakeRejected { code: i32, message: String },
    HandshakeTimeout(Duration),
    /// The worker closed its channel before sending the handshake.
    WorkerExited,
    /// Another run holds the exclusive device lease.
    LeaseHeld { holder: String },
    AlreadyExecuted,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Authentication(err) => write!(f, "authentication failed: {err}"),
            RunError::RunFetch(err) => write!(f, "failed to fetch run: {err}"),
            RunError::HandshakeRejected { code, message } => {
                write!(f, "worker process failed to start (code {code}): {message}")
            }
            RunError::HandshakeTimeout(timeout) => {
                write!(f, "worker process did not report within {timeout:?}")
            }
            RunError::WorkerExited => f.write_str("worker process exited before reporting"),
            RunError::LeaseHeld { holder } => write!(f, "device is leased by {holder}"),
            RunError::AlreadyExecuted => f.write_str("run supervisor was already executed"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Authentication(err) | RunError::RunFetch(err) => Some(err),
            _ => None,
        }
    }
}
