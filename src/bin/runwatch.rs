use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use runwatch::control::ControlPlaneOptions;
use runwatch::supervisor::{IpcChannel, OsParentLiveness, WorkerParams};
use runwatch::upload::DEFAULT_CHUNK_SIZE;
use runwatch::{
    ChunkedUpload, ControlPlane, ExecutionMode, JsonRpcControlPlane, MetricSampler, RunContext,
    RunSupervisor, Severity, SupervisorConfig, Telemetry, WorkerProcess,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

const DEFAULT_LOG_DIRECTIVE: &str = "info";

#[derive(Debug, Parser)]
#[command(name = "runwatch", version, about = "Supervise a run against the control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a command as the payload of a supervised run.
    Run(RunArgs),
    /// Upload a file in chunks and print its upload id.
    Upload(UploadArgs),
    /// Heartbeat worker spawned by `run`.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Debug, Args)]
struct ControlArgs {
    #[arg(long, env = "RUNWATCH_CONTROL_URL")]
    control_url: String,
    #[arg(long, env = "RUNWATCH_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: String,
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    control: ControlArgs,
    #[arg(long, env = "RUNWATCH_RUN_ID")]
    run_id: String,
    #[arg(long, default_value_t = ExecutionMode::Local)]
    mode: ExecutionMode,
    #[arg(long, default_value_t = 5)]
    heartbeat_interval_secs: u64,
    #[arg(long, default_value_t = 60)]
    handshake_timeout_secs: u64,
    #[arg(long)]
    temp_dir: Option<PathBuf>,
    #[arg(long)]
    artifact_dir: Option<PathBuf>,
    #[arg(long)]
    lease_dir: Option<PathBuf>,
    /// Command and arguments to run.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[command(flatten)]
    control: ControlArgs,
    path: PathBuf,
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

#[derive(Debug, Args)]
struct WorkerArgs {
    #[arg(long)]
    channel_fd: i32,
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    parent_pid: u32,
    #[arg(long)]
    control_url: String,
    #[arg(long, env = "RUNWATCH_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: String,
    #[arg(long)]
    heartbeat_interval_ms: u64,
    #[arg(long)]
    request_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_cli_tracing();

    match Cli::parse().command {
        Commands::Run(args) => {
            let code = run(args).await?;
            std::process::exit(code);
        }
        Commands::Upload(args) => upload(args).await,
        Commands::Worker(args) => {
            let code = worker(args).await?;
            std::process::exit(code);
        }
    }
}

fn init_cli_tracing() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    runwatch::init_tracing();
}

async fn run(args: RunArgs) -> Result<i32> {
    let mut builder = SupervisorConfig::builder()
        .control_url(args.control.control_url)
        .refresh_token(args.control.refresh_token)
        .run_id(args.run_id)
        .mode(args.mode)
        .heartbeat_interval(Duration::from_secs(args.heartbeat_interval_secs))
        .handshake_timeout(Duration::from_secs(args.handshake_timeout_secs))
        .request_timeout(Duration::from_secs(args.control.request_timeout_secs));
    if let Some(dir) = args.temp_dir {
        builder = builder.temp_dir(dir);
    }
    if let Some(dir) = args.artifact_dir {
        builder = builder.artifact_dir(dir);
    }
    if let Some(dir) = args.lease_dir {
        builder = builder.lease_dir(dir);
    }

    let mut supervisor = RunSupervisor::connect(builder.build()?)?;
    let command = args.command;
    let report = supervisor
        .execute(move |ctx| run_command(ctx, command))
        .await?;

    if let Some(error) = &report.error {
        eprintln!("run {} ended with {:?}: {error}", report.run_id, report.outcome);
    }
    Ok(report.exit_code)
}

/// Runs the payload command, forwarding its stdout as info records and its
/// stderr as warnings.
async fn run_command(ctx: RunContext, command: Vec<String>) -> Result<()> {
    let Some((program, rest)) = command.split_first() else {
        bail!("no command given");
    };

    let mut child = Command::new(program)
        .args(rest)
        .env("RUNWATCH_RUN_ID", ctx.run_id())
        .env("RUNWATCH_TEMP_DIR", ctx.temp_dir())
        .env("RUNWATCH_ARTIFACT_DIR", ctx.artifact_dir())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stdout = child.stdout.take().context("child stdout missing")?;
    let stderr = child.stderr.take().context("child stderr missing")?;
    let forward_out = forward_lines(BufReader::new(stdout), ctx.clone(), Severity::Info);
    let forward_err = forward_lines(BufReader::new(stderr), ctx.clone(), Severity::Warning);

    let (status, out, err) = tokio::join!(child.wait(), forward_out, forward_err);
    out?;
    err?;
    let status = status.context("failed to wait for command")?;
    if !status.success() {
        bail!("{program} exited with {status}");
    }
    Ok(())
}

async fn forward_lines<R>(reader: R, ctx: RunContext, severity: Severity) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("failed to read command output")? {
        match severity {
            Severity::Info => println!("{line}"),
            _ => eprintln!("{line}"),
        }
        ctx.log(severity, line);
    }
    Ok(())
}

async fn upload(args: UploadArgs) -> Result<()> {
    let options = ControlPlaneOptions {
        request_timeout: Duration::from_secs(args.control.request_timeout_secs),
        ..ControlPlaneOptions::default()
    }
    .fit_chunk_size(args.chunk_size);
    let control = Arc::new(JsonRpcControlPlane::with_options(
        args.control.control_url,
        options,
    )?);
    control
        .authenticate(&args.control.refresh_token)
        .await
        .context("authentication failed")?;

    let upload = ChunkedUpload::new(control, Arc::default(), args.path, args.chunk_size)?;
    let upload_id = upload.upload().await?;
    println!("{upload_id}");
    Ok(())
}

async fn worker(args: WorkerArgs) -> Result<i32> {
    // SAFETY: the descriptor was inherited from the supervisor for this
    // process alone and nothing else adopts it.
    let channel = unsafe { IpcChannel::from_raw_fd(args.channel_fd)? };
    let control = JsonRpcControlPlane::with_options(
        args.control_url,
        ControlPlaneOptions {
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            ..ControlPlaneOptions::default()
        },
    )?;

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone())?;

    let worker = WorkerProcess::new(WorkerParams {
        control: Arc::new(control) as Arc<dyn ControlPlane>,
        channel,
        liveness: Box::new(OsParentLiveness::parent(args.parent_pid)),
        sampler: MetricSampler::system(),
        run_id: args.run_id,
        refresh_token: args.refresh_token,
        heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
        shutdown,
        telemetry: Arc::new(Telemetry::default()),
    });

    let exit = worker.run().await;
    tracing::info!(?exit, "worker exiting");
    Ok(exit.exit_code())
}

fn spawn_signal_listener(shutdown: CancellationToken) -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => {}
            _ = interrupt.recv() => {}
        }
        shutdown.cancel();
    });
    Ok(())
}
