//! Background uploader for console log records.
//!
//! One task owns the pending list and performs every submission, so at most
//! one `log.upload` request is in flight and records enqueued while a request
//! is outstanding are never mistaken for uploaded ones. Producers enqueue
//! through an unbounded channel and never block.

use crate::control::{ApiResult, ControlPlane, LogRecord, Severity};
use crate::runtime::telemetry::Telemetry;
use crate::upload::backoff::WaitSchedule;
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

enum LogCommand {
    Record(LogRecord),
    Flush(oneshot::Sender<ApiResult<()>>),
    Stop {
        drain: bool,
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable producer handle. Adding after the uploader stopped is a no-op.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogCommand>,
    stopped: Arc<AtomicBool>,
}

impl LogSink {
    pub fn add(&self, record: LogRecord) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(LogCommand::Record(record));
    }

    pub fn log(&self, severity: Severity, message: impl Into<String>) {
        self.add(LogRecord::new(severity, message));
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub struct LogUploaderParams {
    pub control: Arc<dyn ControlPlane>,
    pub run_id: String,
    pub schedule: WaitSchedule,
    pub telemetry: Arc<Telemetry>,
}

pub struct LogUploader {
    sink: LogSink,
    pending: Arc<AtomicUsize>,
    current_wait_ms: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl LogUploader {
    /// Spawns the uploader task on the current tokio runtime.
    pub fn spawn(params: LogUploaderParams) -> Self {
        let LogUploaderParams {
            control,
            run_id,
            schedule,
            telemetry,
        } = params;

        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let current_wait_ms = Arc::new(AtomicU64::new(duration_to_millis(schedule.current())));

        let task = UploaderTask {
            control,
            run_id,
            records: Vec::new(),
            schedule,
            telemetry,
            pending: pending.clone(),
            current_wait_ms: current_wait_ms.clone(),
        };
        let handle = tokio::spawn(task.run(rx));

        Self {
            sink: LogSink {
                tx,
                stopped: Arc::new(AtomicBool::new(false)),
            },
            pending,
            current_wait_ms,
            handle: Some(handle),
        }
    }

    pub fn sink(&self) -> LogSink {
        self.sink.clone()
    }

    pub fn add(&self, record: LogRecord) {
        self.sink.add(record);
    }

    /// Records currently buffered by the uploader task.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Shared gauge tracking `pending()`, for diagnostics that outlive a borrow.
    pub fn pending_gauge(&self) -> Arc<AtomicUsize> {
        self.pending.clone()
    }

    pub fn current_wait(&self) -> Duration {
        Duration::from_millis(self.current_wait_ms.load(Ordering::SeqCst))
    }

    /// Uploads everything enqueued so far right away. An empty buffer
    /// succeeds without contacting the control plane.
    pub async fn flush(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sink
            .tx
            .send(LogCommand::Flush(reply_tx))
            .map_err(|_| anyhow!("log uploader is no longer running"))?;
        let outcome = reply_rx
            .await
            .map_err(|_| anyhow!("log uploader stopped before completing the flush"))?;
        outcome.map_err(Into::into)
    }

    /// Stops accepting records, uploads whatever is still queued once, and
    /// waits for the task to exit.
    pub async fn stop(&mut self) {
        self.shutdown(true).await;
    }

    /// Stops without a final upload attempt.
    pub async fn abort(&mut self) {
        self.shutdown(false).await;
    }

    async fn shutdown(&mut self, drain: bool) {
        self.sink.stopped.store(true, Ordering::SeqCst);

        let Some(handle) = self.handle.take() else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .sink
            .tx
            .send(LogCommand::Stop { drain, ack: ack_tx })
            .is_ok()
        {
            let _ = ack_rx.await;
        }

        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "log uploader task panicked");
        }
    }
}

struct UploaderTask {
    control: Arc<dyn ControlPlane>,
    run_id: String,
    records: Vec<LogRecord>,
    schedule: WaitSchedule,
    telemetry: Arc<Telemetry>,
    pending: Arc<AtomicUsize>,
    current_wait_ms: Arc<AtomicU64>,
}

impl UploaderTask {
    #[tracing::instrument(name = "log_uploader", skip_all, fields(run_id = %self.run_id))]
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LogCommand>) {
        let mut next_attempt = Instant::now() + self.schedule.current();

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(LogCommand::Record(record)) => {
                        self.records.push(record);
                        self.publish_pending();
                    }
                    Some(LogCommand::Flush(reply)) => {
                        let outcome = self.attempt().await;
                        let _ = reply.send(outcome);
                        next_attempt = Instant::now() + self.schedule.current();
                    }
                    Some(LogCommand::Stop { drain, ack }) => {
                        if drain {
                            self.drain(&mut rx).await;
                        }
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.drain(&mut rx).await;
                        break;
                    }
                },
                _ = sleep_until(next_attempt) => {
                    let _ = self.attempt().await;
                    next_attempt = Instant::now() + self.schedule.current();
                }
            }
        }

        tracing::debug!(left_behind = self.records.len(), "log uploader stopped");
    }

    async fn attempt(&mut self) -> ApiResult<()> {
        match self.upload_logs().await {
            Ok(uploaded) => {
                self.schedule.record_success();
                if uploaded > 0 {
                    tracing::trace!(uploaded, "uploaded log records");
                }
                self.publish_wait();
                Ok(())
            }
            Err(err) => {
                let wait = self.schedule.record_failure();
                self.telemetry.record_log_upload_failure();
                tracing::warn!(
                    error = %err,
                    pending = self.records.len(),
                    failures = self.schedule.consecutive_failures(),
                    next_wait_ms = duration_to_millis(wait),
                    "log upload failed; backing off"
                );
                self.publish_wait();
                Err(err)
            }
        }
    }

    /// Submits the whole buffer in one request and removes exactly the
    /// submitted prefix on success.
    async fn upload_logs(&mut self) -> ApiResult<usize> {
        if self.records.is_empty() {
            return Ok(0);
        }

        let submitted = self.records.len();
        self.control
            .upload_logs(&self.run_id, &self.records[..submitted])
            .await?;

        self.records.drain(..submitted);
        self.telemetry
            .record_log_records_uploaded(submitted as u64);
        self.publish_pending();
        Ok(submitted)
    }

    async fn drain(&mut self, rx: &mut mpsc::UnboundedReceiver<LogCommand>) {
        let mut waiting_flushes = Vec::new();
        while let Ok(command) = rx.try_recv() {
            match command {
                LogCommand::Record(record) => self.records.push(record),
                LogCommand::Flush(reply) => waiting_flushes.push(reply),
                LogCommand::Stop { ack, .. } => {
                    let _ = ack.send(());
                }
            }
        }
        self.publish_pending();

        let outcome = self.upload_logs().await;
        if let Err(err) = &outcome {
            tracing::warn!(
                error = %err,
                dropped = self.records.len(),
                "final log upload failed; discarding buffered records"
            );
        }
        for reply in waiting_flushes {
            let _ = reply.send(outcome.clone().map(|_| ()));
        }
    }

    fn publish_pending(&self) {
        self.pending.store(self.records.len(), Ordering::SeqCst);
    }

    fn publish_wait(&self) {
        self.current_wait_ms
            .store(duration_to_millis(self.schedule.current()), Ordering::SeqCst);
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}
