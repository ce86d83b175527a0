//! Process-level supervision of a run: the worker heartbeat process, the
//! channel it reports on, and the lifecycle state machine around the payload.

pub mod error;
pub mod ipc;
pub mod launcher;
pub mod lease;
pub mod lifecycle;
pub mod liveness;
pub mod process_tree;
pub mod worker;

pub use error::RunError;
pub use ipc::{HandshakeMessage, IpcChannel};
pub use launcher::{InProcessLauncher, ProcessLauncher, WorkerHandle, WorkerLauncher, WorkerSpec};
pub use lease::DeviceLease;
pub use lifecycle::{LifecycleState, RunOutcome, RunReport, RunSupervisor};
pub use liveness::{OsParentLiveness, ParentLiveness, ParentStatus};
pub use process_tree::{terminate_descendants, ProcessTree, SysinfoProcessTree, TerminationReport};
pub use worker::{StopReason, WorkerExit, WorkerParams, WorkerProcess};
