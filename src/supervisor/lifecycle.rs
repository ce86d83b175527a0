//! Run supervisor: brings the worker up, waits for its handshake, drives the
//! payload, then fires exactly one outcome callback followed by exactly one
//! cleanup.

use crate::control::{
    is_connection_lost, ControlPlane, JsonRpcControlPlane, LogRecord, RunStatus, Severity,
};
use crate::runtime::config::{ExecutionMode, SupervisorConfig};
use crate::runtime::context::{RunContext, RunContextParams};
use crate::runtime::fault_dump::FaultDumpHook;
use crate::runtime::telemetry::Telemetry;
use crate::supervisor::error::RunError;
use crate::supervisor::launcher::{ProcessLauncher, WorkerHandle, WorkerLauncher, WorkerSpec};
use crate::supervisor::lease::{clear_dir, DeviceLease};
use crate::supervisor::process_tree::{terminate_descendants, ProcessTree, SysinfoProcessTree};
use crate::upload::logs::{LogUploader, LogUploaderParams};
use anyhow::{Context, Error as AnyError, Result};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const INTERRUPT_KILL_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Started,
    Succeeded,
    ExceptionCaught,
    Interrupted,
    ConnectionLost,
    CleanedUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Interrupted,
    ConnectionLost,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed => 1,
            RunOutcome::ConnectionLost => 2,
            RunOutcome::Interrupted => 130,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub exit_code: i32,
    /// Rendered error chain for failed and disconnected runs.
    pub error: Option<String>,
}

enum Outcome {
    Success,
    Exception(AnyError),
    Interrupt,
    ConnectionLost(AnyError),
}

impl Outcome {
    fn classify(err: AnyError) -> Self {
        if is_connection_lost(&err) {
            Outcome::ConnectionLost(err)
        } else {
            Outcome::Exception(err)
        }
    }
}

pub struct RunSupervisor {
    config: SupervisorConfig,
    control: Arc<dyn ControlPlane>,
    launcher: Arc<dyn WorkerLauncher>,
    process_tree: Arc<dyn ProcessTree>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    state: LifecycleState,
    transitions: Vec<LifecycleState>,
    authenticated: bool,
    worker: Option<WorkerHandle>,
    uploader: Option<LogUploader>,
    context: Option<RunContext>,
    lease: Option<DeviceLease>,
    fault_dump: Option<FaultDumpHook>,
}

impl RunSupervisor {
    pub fn new(
        config: SupervisorConfig,
        control: Arc<dyn ControlPlane>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            config,
            control,
            launcher,
            process_tree: Arc::new(SysinfoProcessTree),
            telemetry: Arc::new(Telemetry::default()),
            shutdown: CancellationToken::new(),
            state: LifecycleState::Created,
            transitions: vec![LifecycleState::Created],
            authenticated: false,
            worker: None,
            uploader: None,
            context: None,
            lease: None,
            fault_dump: None,
        }
    }

    /// JSON-RPC control plane plus a worker re-executed from the current binary.
    pub fn connect(config: SupervisorConfig) -> Result<Self> {
        let control =
            JsonRpcControlPlane::with_options(config.control_url(), config.control_plane_options())?;
        let launcher = ProcessLauncher::current_exe()?;
        Ok(Self::new(config, Arc::new(control), Arc::new(launcher)))
    }

    pub fn with_process_tree(mut self, process_tree: Arc<dyn ProcessTree>) -> Self {
        self.process_tree = process_tree;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Cancelling this token interrupts the payload like Ctrl-C does.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn transitions(&self) -> &[LifecycleState] {
        &self.transitions
    }

    /// The current run binding; `None` before start and after cleanup.
    pub fn context(&self) -> Option<&RunContext> {
        self.context.as_ref()
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Runs `payload` under the full lifecycle contract. Errors raised by the
    /// outcome callback itself are returned after cleanup has run.
    pub async fn execute<F, Fut>(&mut self, payload: F) -> Result<RunReport>
    where
        F: FnOnce(RunContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.state != LifecycleState::Created {
            return Err(RunError::AlreadyExecuted.into());
        }

        let interrupted = wait_for_interrupt(listen_for_sigint(), self.shutdown.clone());
        tokio::pin!(interrupted);

        let started = tokio::select! {
            started = self.on_start() => Some(started),
            _ = &mut interrupted => None,
        };
        let outcome = match started {
            Some(Ok(context)) => tokio::select! {
                result = payload(context) => match result {
                    Ok(()) => Outcome::Success,
                    Err(err) => Outcome::classify(err),
                },
                _ = &mut interrupted => Outcome::Interrupt,
            },
            Some(Err(err)) => {
                tracing::error!(run_id = %self.config.run_id(), error = %format!("{err:#}"), "run failed to start");
                Outcome::classify(err)
            }
            None => {
                tracing::warn!(run_id = %self.config.run_id(), "interrupted before the payload started");
                Outcome::Interrupt
            }
        };

        let (run_outcome, error, branch) = match outcome {
            Outcome::Success => (RunOutcome::Succeeded, None, self.on_success().await),
            Outcome::Exception(err) => {
                let branch = self.on_exception(&err).await;
                (RunOutcome::Failed, Some(format!("{err:#}")), branch)
            }
            Outcome::Interrupt => (RunOutcome::Interrupted, None, self.on_keyboard_interrupt().await),
            Outcome::ConnectionLost(err) => {
                let branch = self.on_network_connection_lost(&err).await;
                (RunOutcome::ConnectionLost, Some(format!("{err:#}")), branch)
            }
        };

        self.on_clean_up().await;
        branch?;

        Ok(RunReport {
            run_id: self.config.run_id().to_owned(),
            outcome: run_outcome,
            exit_code: run_outcome.exit_code(),
            error,
        })
    }

    #[tracing::instrument(skip_all, fields(run_id = %self.config.run_id(), mode = %self.config.mode()))]
    async fn on_start(&mut self) -> Result<RunContext> {
        let run_id = self.config.run_id().to_owned();

        if self.config.mode() == ExecutionMode::Remote {
            self.lease = Some(DeviceLease::acquire(self.config.lease_dir(), &run_id)?);
        }
        for dir in [self.config.temp_dir(), self.config.artifact_dir()] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        self.control
            .authenticate(self.config.refresh_token())
            .await
            .map_err(RunError::Authentication)?;
        self.authenticated = true;

        let run = self
            .control
            .fetch_run(&run_id)
            .await
            .map_err(RunError::RunFetch)?;

        let uploader = LogUploader::spawn(LogUploaderParams {
            control: self.control.clone(),
            run_id: run_id.clone(),
            schedule: self.config.wait_schedule(),
            telemetry: self.telemetry.clone(),
        });
        let logs = uploader.sink();
        self.uploader = Some(uploader);

        let spec = WorkerSpec {
            run_id: run_id.clone(),
            control_url: self.config.control_url().to_owned(),
            refresh_token: self.config.refresh_token().to_owned(),
            heartbeat_interval: self.config.heartbeat_interval(),
            request_timeout: self.config.request_timeout(),
        };
        let worker = self
            .launcher
            .launch(&spec)
            .await
            .context("failed to launch worker")?;
        let worker = self.worker.insert(worker);

        let handshake_timeout = self.config.handshake_timeout();
        let handshake = timeout(handshake_timeout, worker.recv_handshake())
            .await
            .map_err(|_| RunError::HandshakeTimeout(handshake_timeout))?
            .context("failed to receive worker handshake")?
            .ok_or(RunError::WorkerExited)?;
        if !handshake.is_success() {
            return Err(RunError::HandshakeRejected {
                code: handshake.code,
                message: handshake.message,
            }
            .into());
        }
        let worker_pid = worker.pid();
        self.set_state(LifecycleState::Started);

        self.control
            .update_status(&run_id, Some(RunStatus::InProgress), None)
            .await
            .context("failed to mark run in progress")?;

        let context = RunContext::new(RunContextParams {
            run,
            mode: self.config.mode(),
            control: self.control.clone(),
            logs,
            telemetry: self.telemetry.clone(),
            temp_dir: self.config.temp_dir().to_path_buf(),
            artifact_dir: self.config.artifact_dir().to_path_buf(),
            chunk_size: self.config.chunk_size(),
        });
        self.context = Some(context.clone());

        match FaultDumpHook::install(self.describe_run()) {
            Ok(hook) => self.fault_dump = Some(hook),
            Err(err) => tracing::warn!(error = %err, "fault dump hook unavailable"),
        }

        tracing::info!(worker_pid = ?worker_pid, "run started");
        Ok(context)
    }

    async fn on_success(&mut self) -> Result<()> {
        self.set_state(LifecycleState::Succeeded);
        self.flush_logs().await;
        self.control
            .update_status(
                self.config.run_id(),
                Some(RunStatus::CompletedWithSuccess),
                None,
            )
            .await
            .context("failed to mark run completed")?;
        tracing::info!(run_id = %self.config.run_id(), "run completed");
        Ok(())
    }

    async fn on_exception(&mut self, err: &AnyError) -> Result<()> {
        self.set_state(LifecycleState::ExceptionCaught);
        let message = format!("{err:#}");
        tracing::error!(run_id = %self.config.run_id(), error = %message, "run raised an exception");

        if let Some(uploader) = &self.uploader {
            uploader.add(LogRecord::new(Severity::Fatal, message.clone()));
        }
        self.flush_logs().await;

        if !self.authenticated {
            tracing::warn!("not authenticated; run status left unchanged");
            return Ok(());
        }
        self.control
            .update_status(
                self.config.run_id(),
                Some(RunStatus::CompletedWithError),
                Some(&message),
            )
            .await
            .context("failed to mark run failed")?;
        Ok(())
    }

    async fn on_keyboard_interrupt(&mut self) -> Result<()> {
        self.set_state(LifecycleState::Interrupted);
        tracing::warn!(run_id = %self.config.run_id(), "run interrupted; stopping");

        if self.authenticated {
            if let Err(err) = self
                .control
                .update_status(self.config.run_id(), Some(RunStatus::Stopping), None)
                .await
            {
                tracing::warn!(error = %err, "failed to mark run stopping");
            }
        }

        let report = terminate_descendants(
            self.process_tree.as_ref(),
            std::process::id(),
            INTERRUPT_KILL_WAIT,
        )
        .await;
        tracing::info!(
            killed = report.killed.len(),
            survivors = report.survivors.len(),
            "process subtree terminated"
        );

        if self.authenticated {
            self.control
                .update_status(self.config.run_id(), Some(RunStatus::Stopped), None)
                .await
                .context("failed to mark run stopped")?;
        }
        Ok(())
    }

    async fn on_network_connection_lost(&mut self, err: &AnyError) -> Result<()> {
        self.set_state(LifecycleState::ConnectionLost);
        tracing::error!(
            run_id = %self.config.run_id(),
            error = %format!("{err:#}"),
            "network connection lost; skipping remote status update"
        );
        clear_dir(self.config.temp_dir()).await
    }

    async fn on_clean_up(&mut self) {
        if self.state == LifecycleState::CleanedUp {
            return;
        }

        if let Some(hook) = self.fault_dump.take() {
            hook.stop().await;
        }

        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.stop().await {
                tracing::warn!(error = %err, "failed to stop worker");
            }
        }

        if let Some(mut uploader) = self.uploader.take() {
            if self.state == LifecycleState::ConnectionLost {
                uploader.abort().await;
            } else {
                uploader.stop().await;
            }
        }

        if let Some(lease) = self.lease.take() {
            if let Err(err) = lease.release() {
                tracing::warn!(error = %err, "failed to release device lease");
            }
        }

        if let Err(err) = clear_dir(self.config.temp_dir()).await {
            tracing::warn!(error = %err, "failed to clear temporary files");
        }
        if self.config.mode() == ExecutionMode::Remote {
            if let Err(err) = clear_dir(self.config.artifact_dir()).await {
                tracing::warn!(error = %err, "failed to clear artifacts");
            }
        }

        self.context = None;
        self.set_state(LifecycleState::CleanedUp);
        tracing::info!(run_id = %self.config.run_id(), telemetry = ?self.telemetry.snapshot(), "run cleaned up");
    }

    async fn flush_logs(&self) {
        if let Some(uploader) = &self.uploader {
            if let Err(err) = uploader.flush().await {
                tracing::warn!(error = %err, "failed to flush logs");
            }
        }
    }

    fn set_state(&mut self, state: LifecycleState) {
        tracing::debug!(from = ?self.state, to = ?state, "lifecycle transition");
        self.state = state;
        self.transitions.push(state);
    }

    fn describe_run(&self) -> impl Fn() -> String + Send + 'static {
        let run_id = self.config.run_id().to_owned();
        let mode = self.config.mode();
        let worker_pid = self.worker.as_ref().and_then(WorkerHandle::pid);
        let pending = self.uploader.as_ref().map(LogUploader::pending_gauge);
        let telemetry = self.telemetry.clone();
        let process_tree = self.process_tree.clone();

        move || {
            let pending_logs = pending
                .as_ref()
                .map(|gauge| gauge.load(Ordering::SeqCst))
                .unwrap_or(0);
            format!(
                "run_id={run_id} mode={mode} state=started worker_pid={worker_pid:?} \
                 pending_logs={pending_logs} telemetry={:?} descendants={:?}",
                telemetry.snapshot(),
                process_tree.descendants(std::process::id()),
            )
        }
    }
}

/// Once registered, SIGINT no longer takes its default action for the rest of
/// the process lifetime.
fn listen_for_sigint() -> Option<Signal> {
    match signal(SignalKind::interrupt()) {
        Ok(sigint) => Some(sigint),
        Err(err) => {
            tracing::warn!(error = %err, "failed to register SIGINT handler; only the shutdown token interrupts");
            None
        }
    }
}

/// Resolves on the first Ctrl-C or once `shutdown` is cancelled.
async fn wait_for_interrupt(sigint: Option<Signal>, shutdown: CancellationToken) {
    let ctrl_c = async move {
        match sigint {
            Some(mut sigint) => {
                sigint.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl-C received; interrupting run"),
        _ = shutdown.cancelled() => tracing::info!("run shutdown token cancelled"),
    }
}
