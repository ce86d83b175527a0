use std::path::Path;
use std::process::Output;

use crate::support::{
    helpers::{init_tracing, REFRESH_TOKEN, RUN_ID},
    mock_control::{MockControl, MockControlServer},
};
use anyhow::{Context, Result};
use serde_json::json;
use tokio::process::Command;

async fn run_cli(url: &str, root: &Path, payload: &str) -> Result<Output> {
    Command::new(env!("CARGO_BIN_EXE_runwatch"))
        .arg("run")
        .args(["--control-url", url])
        .args(["--run-id", RUN_ID])
        .args(["--heartbeat-interval-secs", "1"])
        .arg("--temp-dir")
        .arg(root.join("tmp"))
        .arg("--artifact-dir")
        .arg(root.join("artifacts"))
        .arg("--lease-dir")
        .arg(root.join("leases"))
        .args(["--", "sh", "-c", payload])
        .env("RUNWATCH_REFRESH_TOKEN", REFRESH_TOKEN)
        .env("RUST_LOG", "warn")
        .output()
        .await
        .context("failed to run runwatch binary")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cli_forwards_output_and_completes_run() -> Result<()> {
    init_tracing();
    let control = MockControl::new(REFRESH_TOKEN).with_run(RUN_ID, json!({}));
    let server = MockControlServer::start(control.clone()).await?;
    let root = tempfile::tempdir()?;

    let output = run_cli(
        server.url(),
        root.path(),
        "echo \"run $RUNWATCH_RUN_ID\"; echo careful >&2; sleep 1",
    )
    .await?;

    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert!(String::from_utf8_lossy(&output.stdout).contains("run run-42"));
    assert_eq!(control.statuses(), vec!["inProgress", "completedWithSuccess"]);
    assert!(control.heartbeats() >= 1);

    let records = control.log_records();
    assert!(records.contains(&("info".to_owned(), "run run-42".to_owned())));
    assert!(records.contains(&("warning".to_owned(), "careful".to_owned())));

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cli_failing_command_exits_with_one() -> Result<()> {
    init_tracing();
    let control = MockControl::new(REFRESH_TOKEN).with_run(RUN_ID, json!({}));
    let server = MockControlServer::start(control.clone()).await?;
    let root = tempfile::tempdir()?;

    let output = run_cli(server.url(), root.path(), "exit 3").await?;

    assert_eq!(output.status.code(), Some(1), "{output:?}");
    assert_eq!(control.statuses(), vec!["inProgress", "completedWithError"]);
    let last = control
        .params_of("run.updateStatus")
        .into_iter()
        .filter(|params| params.get("status").is_some())
        .last()
        .unwrap();
    assert!(last["message"].as_str().unwrap().contains("exited with"));

    server.shutdown().await;
    Ok(())
}
