use crate::control::ControlPlaneOptions;
use crate::upload::backoff::{WaitSchedule, DEFAULT_BASE_WAIT, DEFAULT_MAX_WAIT};
use crate::upload::chunked::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const STATE_DIR_NAME: &str = "runwatch";

/// Where the run executes. Remote runs own the machine: they hold the device
/// lease and wipe artifacts on cleanup. Local runs keep artifacts around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Local,
    Remote,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Local => "local",
            ExecutionMode::Remote => "remote",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ExecutionMode::Local),
            "remote" => Ok(ExecutionMode::Remote),
            other => bail!("unknown execution mode '{other}', expected 'local' or 'remote'"),
        }
    }
}

/// Runtime configuration for a supervised run.
///
/// All instances must be constructed via [`SupervisorConfig::builder`] or
/// [`SupervisorConfig::new`] so invariants are validated before any consumer
/// observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    control_url: String,
    refresh_token: String,
    run_id: String,
    mode: ExecutionMode,
    heartbeat_interval: Duration,
    log_base_wait: Duration,
    log_max_wait: Duration,
    handshake_timeout: Duration,
    request_timeout: Duration,
    chunk_size: usize,
    temp_dir: PathBuf,
    artifact_dir: PathBuf,
    lease_dir: PathBuf,
}

pub struct SupervisorConfigParams {
    pub control_url: String,
    pub refresh_token: String,
    pub run_id: String,
    pub mode: ExecutionMode,
    pub heartbeat_interval: Duration,
    pub log_base_wait: Duration,
    pub log_max_wait: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub chunk_size: usize,
    pub temp_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub lease_dir: PathBuf,
}

impl SupervisorConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: SupervisorConfigParams) -> Result<Self> {
        let SupervisorConfigParams {
            control_url,
            refresh_token,
            run_id,
            mode,
            heartbeat_interval,
            log_base_wait,
            log_max_wait,
            handshake_timeout,
            request_timeout,
            chunk_size,
            temp_dir,
            artifact_dir,
            lease_dir,
        } = params;

        let config = Self {
            control_url: trimmed_string(control_url),
            refresh_token: trimmed_string(refresh_token),
            run_id: trimmed_string(run_id),
            mode,
            heartbeat_interval,
            log_base_wait,
            log_max_wait,
            handshake_timeout,
            request_timeout,
            chunk_size,
            temp_dir,
            artifact_dir,
            lease_dir,
        };

        config.validate()?;
        Ok(config)
    }

    /// Control plane endpoint, including scheme.
    pub fn control_url(&self) -> &str {
        &self.control_url
    }

    /// Long-lived credential exchanged for an access token at startup.
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Target cadence of the worker's heartbeat loop.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn log_base_wait(&self) -> Duration {
        self.log_base_wait
    }

    pub fn log_max_wait(&self) -> Duration {
        self.log_max_wait
    }

    /// How long `on_start` waits for the worker's handshake.
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Scratch space cleared on every exit path.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Payload outputs; cleared on cleanup in remote mode only.
    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Directory holding the exclusive device lease file.
    pub fn lease_dir(&self) -> &Path {
        &self.lease_dir
    }

    pub fn wait_schedule(&self) -> WaitSchedule {
        WaitSchedule::new(self.log_base_wait, self.log_max_wait)
    }

    pub fn control_plane_options(&self) -> ControlPlaneOptions {
        ControlPlaneOptions {
            request_timeout: self.request_timeout,
            ..ControlPlaneOptions::default()
        }
        .fit_chunk_size(self.chunk_size)
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.control_url)?;
        ensure_not_empty(&self.refresh_token, "refresh_token")?;
        ensure_not_empty(&self.run_id, "run_id")?;

        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be greater than 0");
        }

        if self.log_base_wait.is_zero() {
            bail!("log_base_wait must be greater than 0");
        }

        if self.log_max_wait < self.log_base_wait {
            bail!(
                "log_max_wait ({:?}) must be at least log_base_wait ({:?})",
                self.log_max_wait,
                self.log_base_wait,
            );
        }

        if self.handshake_timeout.is_zero() {
            bail!("handshake_timeout must be greater than 0");
        }

        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }

        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            bail!(
                "chunk_size ({}) must be between 1 and {} bytes",
                self.chunk_size,
                MAX_CHUNK_SIZE,
            );
        }

        ensure_path(&self.temp_dir, "temp_dir")?;
        ensure_path(&self.artifact_dir, "artifact_dir")?;
        ensure_path(&self.lease_dir, "lease_dir")?;

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct SupervisorConfigBuilder {
    control_url: Option<String>,
    refresh_token: Option<String>,
    run_id: Option<String>,
    mode: Option<ExecutionMode>,
    heartbeat_interval: Option<Duration>,
    log_base_wait: Option<Duration>,
    log_max_wait: Option<Duration>,
    handshake_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    chunk_size: Option<usize>,
    temp_dir: Option<PathBuf>,
    artifact_dir: Option<PathBuf>,
    lease_dir: Option<PathBuf>,
}

impl SupervisorConfigBuilder {
    pub fn control_url(mut self, url: impl Into<String>) -> Self {
        self.control_url = Some(url.into());
        self
    }

    pub fn refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn log_base_wait(mut self, wait: Duration) -> Self {
        self.log_base_wait = Some(wait);
        self
    }

    pub fn log_max_wait(mut self, wait: Duration) -> Self {
        self.log_max_wait = Some(wait);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }

    pub fn lease_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lease_dir = Some(dir.into());
        self
    }

    /// Unset directories default to `<system temp>/runwatch/<run id>/{tmp,artifacts}`
    /// and `<system temp>/runwatch/leases`.
    pub fn build(self) -> Result<SupervisorConfig> {
        let run_id = self.run_id.context("run_id is required")?;
        let state_root = std::env::temp_dir().join(STATE_DIR_NAME);
        let run_root = state_root.join(run_id.trim());

        let params = SupervisorConfigParams {
            control_url: self.control_url.context("control_url is required")?,
            refresh_token: self.refresh_token.context("refresh_token is required")?,
            mode: self.mode.unwrap_or_default(),
            heartbeat_interval: self
                .heartbeat_interval
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
            log_base_wait: self.log_base_wait.unwrap_or(DEFAULT_BASE_WAIT),
            log_max_wait: self.log_max_wait.unwrap_or(DEFAULT_MAX_WAIT),
            handshake_timeout: self.handshake_timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT),
            request_timeout: self
                .request_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            temp_dir: self.temp_dir.unwrap_or_else(|| run_root.join("tmp")),
            artifact_dir: self.artifact_dir.unwrap_or_else(|| run_root.join("artifacts")),
            lease_dir: self.lease_dir.unwrap_or_else(|| state_root.join("leases")),
            run_id,
        };

        SupervisorConfig::new(params)
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn ensure_path(path: &Path, field: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("control_url must start with http:// or https://");
    }
    Ok(())
}
