//! Control plane plumbing: the remote capability trait, its JSON-RPC client,
//! authentication headers, call metrics, options, and wire records.

pub mod auth;
pub mod client;
pub mod error;
#[cfg(test)]
pub(crate) mod fake;
pub mod metrics;
pub mod options;
pub mod types;

pub use client::{ControlPlane, JsonRpcControlPlane};
pub use error::{is_connection_lost, ApiError, ApiErrorKind, ApiResult, ConnectionLost};
pub use metrics::CallMetricsSnapshot;
pub use options::ControlPlaneOptions;
pub use types::{
    AxisType, LogRecord, MetricDefinition, MetricSample, Run, RunStatus, Severity, ValueRange,
};
