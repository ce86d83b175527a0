use crate::control::{ControlPlane, Run, Severity};
use crate::runtime::config::ExecutionMode;
use crate::runtime::telemetry::Telemetry;
use crate::upload::chunked::ChunkedUpload;
use crate::upload::logs::LogSink;
use anyhow::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything the payload of a run may touch. Created by the supervisor once
/// the worker is up and dropped again during cleanup; clones share state.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    run: Run,
    mode: ExecutionMode,
    control: Arc<dyn ControlPlane>,
    logs: LogSink,
    telemetry: Arc<Telemetry>,
    temp_dir: PathBuf,
    artifact_dir: PathBuf,
    chunk_size: usize,
}

pub struct RunContextParams {
    pub run: Run,
    pub mode: ExecutionMode,
    pub control: Arc<dyn ControlPlane>,
    pub logs: LogSink,
    pub telemetry: Arc<Telemetry>,
    pub temp_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub chunk_size: usize,
}

impl RunContext {
    pub fn new(params: RunContextParams) -> Self {
        let RunContextParams {
            run,
            mode,
            control,
            logs,
            telemetry,
            temp_dir,
            artifact_dir,
            chunk_size,
        } = params;

        Self {
            inner: Arc::new(ContextInner {
                run,
                mode,
                control,
                logs,
                telemetry,
                temp_dir,
                artifact_dir,
                chunk_size,
            }),
        }
    }

    pub fn run(&self) -> &Run {
        &self.inner.run
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run.id
    }

    pub fn mode(&self) -> ExecutionMode {
        self.inner.mode
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.inner.run.parameter(key)
    }

    /// Queues a console record for upload.
    pub fn log(&self, severity: Severity, message: impl Into<String>) {
        self.inner.logs.log(severity, message);
    }

    pub fn logs(&self) -> LogSink {
        self.inner.logs.clone()
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.inner.telemetry
    }

    pub fn temp_dir(&self) -> &Path {
        &self.inner.temp_dir
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.inner.artifact_dir
    }

    /// Uploads a result file in chunks and returns the remote upload id.
    pub async fn upload_artifact(&self, path: impl Into<PathBuf>) -> Result<String> {
        let upload = ChunkedUpload::new(
            self.inner.control.clone(),
            self.inner.telemetry.clone(),
            path,
            self.inner.chunk_size,
        )?;
        upload.upload().await
    }
}
