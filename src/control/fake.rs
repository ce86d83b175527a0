//! In-memory `ControlPlane` used by unit tests across the crate.

use crate::control::{
    ApiError, ApiResult, ControlPlane, LogRecord, MetricDefinition, MetricSample, Run, RunStatus,
};
use futures::future::BoxFuture;
use serde_json::Map;
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

#[derive(Default)]
pub(crate) struct FakeState {
    pub run: Option<Run>,
    pub auth_error: Option<ApiError>,
    pub metrics_error: Option<ApiError>,
    pub status_error: Option<ApiError>,
    pub log_failures_left: usize,
    pub fail_chunk_at: Option<usize>,
    pub offline: bool,
    pub authenticated_with: Vec<String>,
    pub status_updates: Vec<(Option<RunStatus>, Option<String>)>,
    pub log_batches: Vec<Vec<LogRecord>>,
    pub log_call_times: Vec<Instant>,
    pub registered_metrics: Vec<MetricDefinition>,
    pub metric_batches: Vec<Vec<MetricSample>>,
    pub uploads_started: Vec<u64>,
    pub chunks: Vec<(String, u64, u64, Vec<u8>)>,
}

#[derive(Default)]
pub(crate) struct FakeControlPlane {
    state: Mutex<FakeState>,
}

impl FakeControlPlane {
    pub(crate) fn with_run(run_id: &str) -> Self {
        let fake = Self::default();
        fake.state().run = Some(Run {
            id: run_id.to_owned(),
            status: RunStatus::Queued,
            parameters: Map::new(),
            metrics: Vec::new(),
        });
        fake
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake control plane poisoned")
    }

    pub(crate) fn heartbeats(&self) -> usize {
        self.state()
            .status_updates
            .iter()
            .filter(|(status, _)| status.is_none())
            .count()
    }

    pub(crate) fn statuses(&self) -> Vec<RunStatus> {
        self.state()
            .status_updates
            .iter()
            .filter_map(|(status, _)| *status)
            .collect()
    }

    fn offline_error(&self, method: &'static str) -> Option<ApiError> {
        if self.state().offline {
            Some(ApiError::transport(method, "connection refused"))
        } else {
            None
        }
    }
}

impl ControlPlane for FakeControlPlane {
    fn authenticate<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, ApiResult<String>> {
        Box::pin(async move {
            if let Some(err) = self.offline_error("auth.authenticate") {
                return Err(err);
            }
            let mut state = self.state();
            if let Some(err) = state.auth_error.clone() {
                return Err(err);
            }
            state.authenticated_with.push(refresh_token.to_owned());
            Ok(format!("access-{refresh_token}"))
        })
    }

    fn fetch_run<'a>(&'a self, run_id: &'a str) -> BoxFuture<'a, ApiResult<Run>> {
        Box::pin(async move {
            if let Some(err) = self.offline_error("run.fetch") {
                return Err(err);
            }
            match self.state().run.clone() {
                Some(run) if run.id == run_id => Ok(run),
                _ => Err(ApiError::rejected(
                    "run.fetch",
                    404,
                    format!("unknown run {run_id}"),
                )),
            }
        })
    }

    fn update_status<'a>(
        &'a self,
        _run_id: &'a str,
        status: Option<RunStatus>,
        message: Option<&'a str>,
    ) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(async move {
            if let Some(err) = self.offline_error("run.updateStatus") {
                return Err(err);
            }
            let mut state = self.state();
            if status.is_some() {
                if let Some(err) = state.status_error.clone() {
                    return Err(err);
                }
            }
            state
                .status_updates
                .push((status, message.map(str::to_owned)));
            if let (Some(status), Some(run)) = (status, state.run.as_mut()) {
                run.status = status;
            }
            Ok(())
        })
    }

    fn create_metrics<'a>(
        &'a self,
        _run_id: &'a str,
        definitions: &'a [MetricDefinition],
    ) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(err) = state.metrics_error.clone() {
                return Err(err);
            }
            state.registered_metrics.extend_from_slice(definitions);
            Ok(())
        })
    }

    fn submit_metrics<'a>(
        &'a self,
        _run_id: &'a str,
        samples: &'a [MetricSample],
    ) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(async move {
            self.state().metric_batches.push(samples.to_vec());
            Ok(())
        })
    }

    fn upload_logs<'a>(
        &'a self,
        _run_id: &'a str,
        records: &'a [LogRecord],
    ) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(async move {
            if let Some(err) = self.offline_error("log.upload") {
                return Err(err);
            }
            let mut state = self.state();
            state.log_call_times.push(Instant::now());
            if state.log_failures_left > 0 {
                state.log_failures_left -= 1;
                return Err(ApiError::rejected("log.upload", 503, "unavailable"));
            }
            state.log_batches.push(records.to_vec());
            Ok(())
        })
    }

    fn start_upload(&self, file_size: u64) -> BoxFuture<'_, ApiResult<String>> {
        Box::pin(async move {
            let mut state = self.state();
            state.uploads_started.push(file_size);
            Ok(format!("upload-{}", state.uploads_started.len()))
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        start: u64,
        end: u64,
        bytes: &'a [u8],
    ) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(async move {
            let mut state = self.state();
            if state.fail_chunk_at == Some(state.chunks.len()) {
                return Err(ApiError::rejected("upload.chunk", 500, "storage unavailable"));
            }
            state
                .chunks
                .push((upload_id.to_owned(), start, end, bytes.to_vec()));
            Ok(())
        })
    }
}
