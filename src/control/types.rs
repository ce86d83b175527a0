//! Records exchanged with the control plane: runs, their status machine,
//! console log records, and metric definitions/samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Remote status of a run. Serialized in the control plane's camelCase form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Queued,
    PreparingToStart,
    InProgress,
    Stopping,
    Stopped,
    CompletedWithSuccess,
    CompletedWithError,
    StartRequested,
    StopRequested,
}

impl RunStatus {
    /// Returns `true` once no further transition is expected from this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Stopped | RunStatus::CompletedWithSuccess | RunStatus::CompletedWithError
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Queued => "queued",
            RunStatus::PreparingToStart => "preparingToStart",
            RunStatus::InProgress => "inProgress",
            RunStatus::Stopping => "stopping",
            RunStatus::Stopped => "stopped",
            RunStatus::CompletedWithSuccess => "completedWithSuccess",
            RunStatus::CompletedWithError => "completedWithError",
            RunStatus::StartRequested => "startRequested",
            RunStatus::StopRequested => "stopRequested",
        };
        f.write_str(label)
    }
}

/// A tracked execution instance as returned by `run.fetch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
}

impl Run {
    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

/// One console line produced while a run executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub severity: Severity,
}

impl LogRecord {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisType {
    Timestamp,
    Float,
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

/// Chart description registered once per run before samples are submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinition {
    pub name: String,
    pub x_name: String,
    pub x_type: AxisType,
    pub y_name: String,
    pub y_type: AxisType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_range: Option<ValueRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_range: Option<ValueRange>,
}

impl MetricDefinition {
    /// Time-series definition plotting `y_name` against a timestamp axis.
    pub fn timeseries(name: impl Into<String>, y_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            x_name: "time".to_owned(),
            x_type: AxisType::Timestamp,
            y_name: y_name.into(),
            y_type: AxisType::Float,
            x_range: None,
            y_range: None,
        }
    }

    pub fn with_y_range(mut self, min: f64, max: f64) -> Self {
        self.y_range = Some(ValueRange { min, max });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}
