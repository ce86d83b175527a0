pub mod control;
pub mod runtime;
pub mod sampler;
pub mod supervisor;
pub mod upload;

pub use control::{
    is_connection_lost, ApiError, ApiErrorKind, ConnectionLost, ControlPlane, ControlPlaneOptions,
    JsonRpcControlPlane, LogRecord, MetricDefinition, MetricSample, Run, RunStatus, Severity,
};
pub use runtime::config::{
    ExecutionMode, SupervisorConfig, SupervisorConfigBuilder, SupervisorConfigParams,
};
pub use runtime::context::RunContext;
pub use runtime::fault_dump::FaultDumpHook;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use sampler::{MetricSampler, SystemMetric};
pub use supervisor::{
    LifecycleState, RunError, RunOutcome, RunReport, RunSupervisor, WorkerExit, WorkerProcess,
};
pub use upload::{ChunkedUpload, LogSink, LogUploader, WaitSchedule};
