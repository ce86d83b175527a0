//! The worker process: authenticates, reports a one-shot handshake, then
//! sends heartbeats and host metrics at a fixed cadence until its parent
//! goes away or it is told to stop.

use crate::control::{ControlPlane, MetricDefinition};
use crate::runtime::telemetry::Telemetry;
use crate::sampler::MetricSampler;
use crate::supervisor::ipc::{HandshakeMessage, IpcChannel};
use crate::supervisor::liveness::{ParentLiveness, ParentStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Why the heartbeat loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ParentOrphaned,
    ParentReparented,
    ParentGone,
    Terminated,
    ChannelClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped(StopReason),
    StartupFailed(String),
}

impl WorkerExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerExit::Stopped(_) => 0,
            WorkerExit::StartupFailed(_) => 1,
        }
    }
}

pub struct WorkerParams {
    pub control: Arc<dyn ControlPlane>,
    pub channel: IpcChannel,
    pub liveness: Box<dyn ParentLiveness>,
    pub sampler: MetricSampler,
    pub run_id: String,
    pub refresh_token: String,
    pub heartbeat_interval: Duration,
    pub shutdown: CancellationToken,
    pub telemetry: Arc<Telemetry>,
}

pub struct WorkerProcess {
    control: Arc<dyn ControlPlane>,
    channel: IpcChannel,
    liveness: Box<dyn ParentLiveness>,
    sampler: MetricSampler,
    run_id: String,
    refresh_token: String,
    interval: Duration,
    shutdown: CancellationToken,
    telemetry: Arc<Telemetry>,
}

/// Sleep that keeps iterations `interval` apart regardless of how long the
/// iteration itself took.
pub fn cadence_sleep(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

impl WorkerProcess {
    pub fn new(params: WorkerParams) -> Self {
        let WorkerParams {
            control,
            channel,
            liveness,
            sampler,
            run_id,
            refresh_token,
            heartbeat_interval,
            shutdown,
            telemetry,
        } = params;

        Self {
            control,
            channel,
            liveness,
            sampler,
            run_id,
            refresh_token,
            interval: heartbeat_interval,
            shutdown,
            telemetry,
        }
    }

    #[tracing::instrument(name = "worker", skip_all, fields(run_id = %self.run_id))]
    pub async fn run(mut self) -> WorkerExit {
        if let Err(reason) = self.start().await {
            tracing::error!(reason = %reason, "worker startup failed");
            if let Err(err) = self.channel.send(&HandshakeMessage::failed(&reason)).await {
                tracing::warn!(error = %err, "could not report startup failure");
            }
            return WorkerExit::StartupFailed(reason);
        }

        if let Err(err) = self.channel.send(&HandshakeMessage::started()).await {
            tracing::warn!(error = %err, "supervisor went away before the handshake");
            return WorkerExit::Stopped(StopReason::ChannelClosed);
        }

        let reason = self.heartbeat_loop().await;
        tracing::info!(
            ?reason,
            heartbeats = self.telemetry.heartbeats_sent(),
            "worker stopped"
        );
        WorkerExit::Stopped(reason)
    }

    async fn start(&mut self) -> Result<(), String> {
        self.control
            .authenticate(&self.refresh_token)
            .await
            .map_err(|err| format!("authentication failed: {err}"))?;

        let run = self
            .control
            .fetch_run(&self.run_id)
            .await
            .map_err(|err| format!("failed to fetch run {}: {err}", self.run_id))?;

        let missing: Vec<MetricDefinition> = self
            .sampler
            .definitions()
            .into_iter()
            .filter(|definition| !run.metrics.iter().any(|known| known.name == definition.name))
            .collect();
        if !missing.is_empty() {
            if let Err(err) = self.control.create_metrics(&self.run_id, &missing).await {
                tracing::warn!(error = %err, "metric registration failed; continuing without metrics");
                self.sampler.clear();
            }
        }

        Ok(())
    }

    async fn heartbeat_loop(&mut self) -> StopReason {
        loop {
            if let Some(reason) = self.termination_reason() {
                return reason;
            }

            let started = Instant::now();
            self.tick().await;
            let pause = cadence_sleep(self.interval, started.elapsed());

            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = sleep(pause) => {}
            }
        }
    }

    fn termination_reason(&self) -> Option<StopReason> {
        if self.shutdown.is_cancelled() {
            return Some(StopReason::Terminated);
        }
        match self.liveness.status() {
            ParentStatus::Alive => {}
            ParentStatus::Orphaned => return Some(StopReason::ParentOrphaned),
            ParentStatus::Reparented { .. } => return Some(StopReason::ParentReparented),
            ParentStatus::Gone => return Some(StopReason::ParentGone),
        }
        if !self.channel.is_peer_alive() {
            return Some(StopReason::ChannelClosed);
        }
        None
    }

    async fn tick(&mut self) {
        match self.control.update_status(&self.run_id, None, None).await {
            Ok(()) => self.telemetry.record_heartbeat(),
            Err(err) => {
                self.telemetry.record_heartbeat_failure();
                tracing::warn!(error = %err, "heartbeat failed");
            }
        }

        let samples = self.sampler.sample();
        if samples.is_empty() {
            return;
        }
        match self.control.submit_metrics(&self.run_id, &samples).await {
            Ok(()) => self.telemetry.record_metric_samples(samples.len() as u64),
            Err(err) => tracing::warn!(error = %err, samples = samples.len(), "metric submission failed"),
        }
    }
}
