use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Logs a diagnostic dump each time the process receives `SIGUSR1`, until
/// stopped.
pub struct FaultDumpHook {
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FaultDumpHook {
    /// `describe` renders the current run state; it is called once per signal.
    pub fn install<F>(describe: F) -> Result<Self>
    where
        F: Fn() -> String + Send + 'static,
    {
        let mut signals = signal(SignalKind::user_defined1())
            .context("failed to register SIGUSR1 handler")?;
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = signals.recv() => {
                        if received.is_none() {
                            break;
                        }
                        tracing::warn!(state = %describe(), "fault dump requested");
                    }
                }
            }
        });

        Ok(Self {
            shutdown,
            task: Some(task),
        })
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FaultDumpHook {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
