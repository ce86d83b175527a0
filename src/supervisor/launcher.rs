//! Ways to bring up the worker for a run: as a child process of the current
//! executable or as a task inside the supervisor's own runtime.

use crate::control::ControlPlane;
use crate::runtime::telemetry::Telemetry;
use crate::sampler::MetricSampler;
use crate::supervisor::ipc::{HandshakeMessage, IpcChannel};
use crate::supervisor::liveness::OsParentLiveness;
use crate::supervisor::worker::{WorkerExit, WorkerParams, WorkerProcess};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const REFRESH_TOKEN_ENV: &str = "RUNWATCH_REFRESH_TOKEN";
const STOP_GRACE: Duration = Duration::from_secs(5);

/// What a worker needs to know about its run.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub run_id: String,
    pub control_url: String,
    pub refresh_token: String,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
}

pub trait WorkerLauncher: Send + Sync {
    fn launch<'a>(&'a self, spec: &'a WorkerSpec) -> BoxFuture<'a, Result<WorkerHandle>>;
}

enum HandleKind {
    Process(Child),
    Task {
        shutdown: CancellationToken,
        task: JoinHandle<WorkerExit>,
    },
}

/// The supervisor's side of a running worker.
pub struct WorkerHandle {
    pid: Option<u32>,
    channel: IpcChannel,
    kind: HandleKind,
}

impl WorkerHandle {
    /// Handle for a worker running as a task; cancelling `shutdown` stops it.
    pub fn from_task(
        channel: IpcChannel,
        shutdown: CancellationToken,
        task: JoinHandle<WorkerExit>,
    ) -> Self {
        Self {
            pid: None,
            channel,
            kind: HandleKind::Task { shutdown, task },
        }
    }

    /// OS pid of a child worker; `None` for in-process workers.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn recv_handshake(&mut self) -> Result<Option<HandshakeMessage>> {
        self.channel.recv().await
    }

    pub fn is_alive(&self) -> bool {
        self.channel.is_peer_alive()
    }

    /// Stops the worker without waiting for it to notice on its own.
    pub async fn stop(self) -> Result<()> {
        match self.kind {
            HandleKind::Process(mut child) => {
                if child
                    .try_wait()
                    .context("failed to poll worker process")?
                    .is_some()
                {
                    return Ok(());
                }
                child.kill().await.context("failed to kill worker process")?;
                tracing::debug!(pid = ?self.pid, "worker process killed");
                Ok(())
            }
            HandleKind::Task { shutdown, mut task } => {
                shutdown.cancel();
                match timeout(STOP_GRACE, &mut task).await {
                    Ok(Ok(exit)) => {
                        tracing::debug!(?exit, "in-process worker stopped");
                        Ok(())
                    }
                    Ok(Err(err)) if err.is_cancelled() => Ok(()),
                    Ok(Err(err)) => Err(err).context("in-process worker panicked"),
                    Err(_) => {
                        task.abort();
                        tracing::warn!("in-process worker ignored shutdown; aborted");
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Spawns `<program> worker ...` with one end of a socket pair inherited as
/// a plain file descriptor.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Re-executes the running binary.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("failed to locate current executable")?;
        Ok(Self::new(program))
    }

    async fn spawn(&self, spec: &WorkerSpec) -> Result<WorkerHandle> {
        let (ours, theirs) =
            std::os::unix::net::UnixStream::pair().context("failed to create worker channel")?;
        let inherited = theirs.as_raw_fd();

        let mut command = Command::new(&self.program);
        command
            .arg("worker")
            .arg("--channel-fd")
            .arg(inherited.to_string())
            .arg("--run-id")
            .arg(&spec.run_id)
            .arg("--parent-pid")
            .arg(std::process::id().to_string())
            .arg("--control-url")
            .arg(&spec.control_url)
            .arg("--heartbeat-interval-ms")
            .arg(spec.heartbeat_interval.as_millis().to_string())
            .arg("--request-timeout-ms")
            .arg(spec.request_timeout.as_millis().to_string())
            .env(REFRESH_TOKEN_ENV, &spec.refresh_token)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        // SAFETY: the hook only calls fcntl(2), which is async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                fcntl(inherited, FcntlArg::F_SETFD(FdFlag::empty()))
                    .map(drop)
                    .map_err(std::io::Error::from)
            });
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn worker {}", self.program.display()))?;
        drop(theirs);

        let pid = child.id();
        tracing::info!(pid = ?pid, run_id = %spec.run_id, "worker process spawned");

        Ok(WorkerHandle {
            pid,
            channel: IpcChannel::from_std(ours)?,
            kind: HandleKind::Process(child),
        })
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch<'a>(&'a self, spec: &'a WorkerSpec) -> BoxFuture<'a, Result<WorkerHandle>> {
        Box::pin(self.spawn(spec))
    }
}

/// Runs the worker as a task on the current runtime, sharing the
/// supervisor's control plane client.
pub struct InProcessLauncher {
    control: Arc<dyn ControlPlane>,
    telemetry: Arc<Telemetry>,
    sampler: fn() -> MetricSampler,
}

impl InProcessLauncher {
    pub fn new(control: Arc<dyn ControlPlane>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            control,
            telemetry,
            sampler: MetricSampler::system,
        }
    }

    pub fn with_sampler(mut self, sampler: fn() -> MetricSampler) -> Self {
        self.sampler = sampler;
        self
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch<'a>(&'a self, spec: &'a WorkerSpec) -> BoxFuture<'a, Result<WorkerHandle>> {
        Box::pin(async move {
            let (ours, theirs) = IpcChannel::pair()?;
            let shutdown = CancellationToken::new();
            let worker = WorkerProcess::new(WorkerParams {
                control: self.control.clone(),
                channel: theirs,
                liveness: Box::new(OsParentLiveness::owner(std::process::id())),
                sampler: (self.sampler)(),
                run_id: spec.run_id.clone(),
                refresh_token: spec.refresh_token.clone(),
                heartbeat_interval: spec.heartbeat_interval,
                shutdown: shutdown.clone(),
                telemetry: self.telemetry.clone(),
            });

            Ok(WorkerHandle::from_task(
                ours,
                shutdown,
                tokio::spawn(worker.run()),
            ))
        })
    }
}
