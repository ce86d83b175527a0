//! Control plane client: the `ControlPlane` capability consumed by the
//! supervisor, worker process, and upload sessions, and its JSON-RPC over
//! HTTP implementation.

use crate::control::auth::build_auth_headers;
use crate::control::error::{ApiError, ApiErrorKind, ApiResult};
use crate::control::metrics::{CallMetrics, CallMetricsSnapshot};
use crate::control::options::ControlPlaneOptions;
use crate::control::types::{LogRecord, MetricDefinition, MetricSample, Run, RunStatus};
use anyhow::{anyhow, bail, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use futures::future::BoxFuture;
use jsonrpsee::core::client::{ClientT, Error as JsonRpcError};
use jsonrpsee::core::params::ObjectParams;
use jsonrpsee::http_client::transport::Error as HttpTransportError;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::{timeout, Instant};

/// Remote calls every run component depends on. Each call resolves to an
/// [`ApiResult`]; call sites decide whether a failure is fatal.
pub trait ControlPlane: Send + Sync {
    /// Exchanges a refresh token for an access token and installs it for
    /// subsequent calls.
    fn authenticate<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, ApiResult<String>>;

    fn fetch_run<'a>(&'a self, run_id: &'a str) -> BoxFuture<'a, ApiResult<Run>>;

    /// `status == None` is the heartbeat signal.
    fn update_status<'a>(
        &'a self,
        run_id: &'a str,
        status: Option<RunStatus>,
        message: Option<&'a str>,
    ) -> BoxFuture<'a, ApiResult<()>>;

    fn create_metrics<'a>(
        &'a self,
        run_id: &'a str,
        definitions: &'a [MetricDefinition],
    ) -> BoxFuture<'a, ApiResult<()>>;

    fn submit_metrics<'a>(
        &'a self,
        run_id: &'a str,
        samples: &'a [MetricSample],
    ) -> BoxFuture<'a, ApiResult<()>>;

    fn upload_logs<'a>(
        &'a self,
        run_id: &'a str,
        records: &'a [LogRecord],
    ) -> BoxFuture<'a, ApiResult<()>>;

    /// Allocates an upload id for a file of `file_size` bytes.
    fn start_upload(&self, file_size: u64) -> BoxFuture<'_, ApiResult<String>>;

    /// Sends `bytes` covering the inclusive byte range `[start, end]`.
    fn upload_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        start: u64,
        end: u64,
        bytes: &'a [u8],
    ) -> BoxFuture<'a, ApiResult<()>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadStartResponse {
    upload_id: String,
}

#[derive(Debug)]
pub struct JsonRpcControlPlane {
    endpoint: Arc<String>,
    options: ControlPlaneOptions,
    client: RwLock<HttpClient>,
    metrics: Arc<CallMetrics>,
}

impl JsonRpcControlPlane {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Self::with_options(endpoint, ControlPlaneOptions::default())
    }

    pub fn with_options(endpoint: impl Into<String>, options: ControlPlaneOptions) -> Result<Self> {
        options.validate()?;

        let endpoint = endpoint.into().trim().to_owned();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            bail!("control plane url must start with http:// or https://");
        }

        let client = build_http_client(&endpoint, &options, None)?;

        Ok(Self {
            endpoint: Arc::new(endpoint),
            options,
            client: RwLock::new(client),
            metrics: Arc::new(CallMetrics::default()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn metrics(&self) -> CallMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn current_client(&self) -> HttpClient {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install_access_token(&self, access_token: &str) -> ApiResult<()> {
        const METHOD: &str = "auth.authenticate";

        let client = build_http_client(&self.endpoint, &self.options, Some(access_token))
            .map_err(|err| ApiError::invalid_response(METHOD, format!("{err:#}")))?;
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
        Ok(())
    }

    async fn call<R>(&self, method: &'static str, params: ObjectParams) -> ApiResult<R>
    where
        R: DeserializeOwned,
    {
        let client = self.current_client();
        let start = Instant::now();

        let outcome = timeout(self.options.request_timeout, client.request(method, params)).await;
        let elapsed = start.elapsed();

        match outcome {
            Err(_) => {
                self.metrics.record_timeout(elapsed);
                tracing::warn!(method, timeout = ?self.options.request_timeout, "control plane call timed out");
                Err(ApiError::timeout(method))
            }
            Ok(Ok(value)) => {
                self.metrics.record_success(elapsed);
                tracing::trace!(method, elapsed_ms = elapsed.as_millis() as u64, "control plane call completed");
                Ok(value)
            }
            Ok(Err(err)) => {
                let mapped = map_client_error(method, err);
                match mapped.kind() {
                    ApiErrorKind::Transport => self.metrics.record_transport_error(elapsed),
                    ApiErrorKind::Timeout => self.metrics.record_timeout(elapsed),
                    _ => self.metrics.record_failure(elapsed),
                }
                tracing::debug!(method, error = %mapped, "control plane call failed");
                Err(mapped)
            }
        }
    }

    pub async fn authenticate(&self, refresh_token: &str) -> ApiResult<String> {
        const METHOD: &str = "auth.authenticate";

        let params = object_params(METHOD, &[("refreshToken", &refresh_token)])?;
        let response: AuthResponse = self.call(METHOD, params).await?;
        self.install_access_token(&response.access_token)?;
        tracing::debug!(endpoint = %self.endpoint, "authenticated against control plane");
        Ok(response.access_token)
    }

    pub async fn fetch_run(&self, run_id: &str) -> ApiResult<Run> {
        const METHOD: &str = "run.fetch";

        let params = object_params(METHOD, &[("runId", &run_id)])?;
        self.call(METHOD, params).await
    }

    pub async fn update_status(
        &self,
        run_id: &str,
        status: Option<RunStatus>,
        message: Option<&str>,
    ) -> ApiResult<()> {
        const METHOD: &str = "run.updateStatus";

        let mut params = object_params(METHOD, &[("runId", &run_id)])?;
        if let Some(status) = status {
            insert_param(&mut params, METHOD, "status", &status)?;
        }
        if let Some(message) = message {
            insert_param(&mut params, METHOD, "message", &message)?;
        }
        self.call::<Value>(METHOD, params).await.map(|_| ())
    }

    pub async fn create_metrics(&self, run_id: &str, definitions: &[MetricDefinition]) -> ApiResult<()> {
        const METHOD: &str = "run.createMetrics";

        let params = object_params(METHOD, &[("runId", &run_id), ("metrics", &definitions)])?;
        self.call::<Value>(METHOD, params).await.map(|_| ())
    }

    pub async fn submit_metrics(&self, run_id: &str, samples: &[MetricSample]) -> ApiResult<()> {
        const METHOD: &str = "run.submitMetrics";

        let params = object_params(METHOD, &[("runId", &run_id), ("samples", &samples)])?;
        self.call::<Value>(METHOD, params).await.map(|_| ())
    }

    pub async fn upload_logs(&self, run_id: &str, records: &[LogRecord]) -> ApiResult<()> {
        const METHOD: &str = "log.upload";

        let params = object_params(METHOD, &[("runId", &run_id), ("records", &records)])?;
        self.call::<Value>(METHOD, params).await.map(|_| ())
    }

    pub async fn start_upload(&self, file_size: u64) -> ApiResult<String> {
        const METHOD: &str = "upload.start";

        let params = object_params(METHOD, &[("size", &file_size)])?;
        let response: UploadStartResponse = self.call(METHOD, params).await?;
        Ok(response.upload_id)
    }

    pub async fn upload_chunk(&self, upload_id: &str, start: u64, end: u64, bytes: &[u8]) -> ApiResult<()> {
        const METHOD: &str = "upload.chunk";

        let encoded = BASE64_STANDARD.encode(bytes);
        let params = object_params(
            METHOD,
            &[
                ("uploadId", &upload_id),
                ("start", &start),
                ("end", &end),
                ("data", &encoded),
            ],
        )?;
        self.call::<Value>(METHOD, params).await.map(|_| ())
    }
}

impl ControlPlane for JsonRpcControlPlane {
    fn authenticate<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, ApiResult<String>> {
        Box::pin(self.authenticate(refresh_token))
    }

    fn fetch_run<'a>(&'a self, run_id: &'a str) -> BoxFuture<'a, ApiResult<Run>> {
        Box::pin(self.fetch_run(run_id))
    }

    fn update_status<'a>(
        &'a self,
        run_id: &'a str,
        status: Option<RunStatus>,
        message: Option<&'a str>,
    ) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(self.update_status(run_id, status, message))
    }

    fn create_metrics<'a>(
        &'a self,
        run_id: &'a str,
        definitions: &'a [MetricDefinition],
    ) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(self.create_metrics(run_id, definitions))
    }

    fn submit_metrics<'a>(
        &'a self,
        run_id: &'a str,
        samples: &'a [MetricSample],
    ) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(self.submit_metrics(run_id, samples))
    }

    fn upload_logs<'a>(
        &'a self,
        run_id: &'a str,
        records: &'a [LogRecord],
    ) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(self.upload_logs(run_id, records))
    }

    fn start_upload(&self, file_size: u64) -> BoxFuture<'_, ApiResult<String>> {
        Box::pin(self.start_upload(file_size))
    }

    fn upload_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        start: u64,
        end: u64,
        bytes: &'a [u8],
    ) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(self.upload_chunk(upload_id, start, end, bytes))
    }
}

fn build_http_client(
    endpoint: &str,
    options: &ControlPlaneOptions,
    access_token: Option<&str>,
) -> Result<HttpClient> {
    let headers = build_auth_headers(access_token)?;
    let max_request_body_size = options.max_request_body_bytes.min(u32::MAX as usize) as u32;
    let max_response_body_size = options.max_response_body_bytes.min(u32::MAX as usize) as u32;

    HttpClientBuilder::default()
        .set_headers(headers)
        .request_timeout(options.request_timeout)
        .max_concurrent_requests(options.max_concurrent_requests)
        .max_request_size(max_request_body_size)
        .max_response_size(max_response_body_size)
        .build(endpoint)
        .map_err(|err| anyhow!("failed to build control plane client: {err}"))
}

fn object_params(
    method: &'static str,
    entries: &[(&str, &dyn erased::SerializeParam)],
) -> ApiResult<ObjectParams> {
    let mut params = ObjectParams::new();
    for (name, value) in entries {
        value.insert_into(&mut params, method, name)?;
    }
    Ok(params)
}

fn insert_param<T: Serialize>(
    params: &mut ObjectParams,
    method: &'static str,
    name: &str,
    value: &T,
) -> ApiResult<()> {
    params
        .insert(name, value)
        .map_err(|err| ApiError::invalid_request(method, err.to_string()))
}

mod erased {
    use super::{insert_param, ApiResult, ObjectParams};
    use serde::Serialize;

    /// Lets heterogeneous parameter values share one slice.
    pub(super) trait SerializeParam {
        fn insert_into(
            &self,
            params: &mut ObjectParams,
            method: &'static str,
            name: &str,
        ) -> ApiResult<()>;
    }

    impl<T: Serialize> SerializeParam for T {
        fn insert_into(
            &self,
            params: &mut ObjectParams,
            method: &'static str,
            name: &str,
        ) -> ApiResult<()> {
            insert_param(params, method, name, self)
        }
    }
}

fn map_client_error(method: &'static str, err: JsonRpcError) -> ApiError {
    match err {
        JsonRpcError::Call(object) => {
            ApiError::rejected(method, object.code(), object.message().to_owned())
        }
        JsonRpcError::Transport(inner) => match inner.downcast_ref::<HttpTransportError>() {
            Some(HttpTransportError::Rejected { status_code }) => {
                ApiError::rejected(method, i32::from(*status_code), "http request rejected")
            }
            Some(HttpTransportError::RequestTooLarge) => {
                ApiError::rejected(method, 413, "request body exceeds the configured limit")
            }
            _ => ApiError::transport(method, inner.to_string()),
        },
        JsonRpcError::RequestTimeout => ApiError::timeout(method),
        JsonRpcError::ParseError(err) => ApiError::invalid_response(method, err.to_string()),
        other => ApiError::invalid_response(method, other.to_string()),
    }
}
