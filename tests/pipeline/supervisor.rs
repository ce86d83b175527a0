use std::time::Duration;

use crate::support::{
    helpers::{in_process_supervisor, init_tracing, REFRESH_TOKEN, RUN_ID},
    mock_control::{MockControl, MockControlServer},
};
use anyhow::{anyhow, Result};
use runwatch::{ConnectionLost, ExecutionMode, LifecycleState, RunOutcome, Severity};
use serde_json::json;
use tokio::time::sleep;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn successful_run_reports_heartbeats_metrics_and_logs() -> Result<()> {
    init_tracing();
    let control = MockControl::new(REFRESH_TOKEN).with_run(RUN_ID, json!({ "lr": 0.01 }));
    let server = MockControlServer::start(control.clone()).await?;
    let root = tempfile::tempdir()?;
    let mut supervisor = in_process_supervisor(server.url(), root.path(), ExecutionMode::Local);

    let report = supervisor
        .execute(|ctx| async move {
            assert_eq!(ctx.parameter("lr"), Some(&json!(0.01)));
            ctx.log(Severity::Info, "step 1");
            sleep(Duration::from_millis(300)).await;
            let artifact = ctx.artifact_dir().join("weights.bin");
            tokio::fs::write(&artifact, vec![1u8; 100]).await?;
            let upload_id = ctx.upload_artifact(&artifact).await?;
            ctx.log(Severity::Info, format!("uploaded {upload_id}"));
            Ok::<_, anyhow::Error>(())
        })
        .await?;

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(report.exit_code, 0);
    assert_eq!(
        supervisor.transitions(),
        &[
            LifecycleState::Created,
            LifecycleState::Started,
            LifecycleState::Succeeded,
            LifecycleState::CleanedUp
        ]
    );
    assert_eq!(control.statuses(), vec!["inProgress", "completedWithSuccess"]);
    assert!(control.heartbeats() >= 2, "heartbeats: {}", control.heartbeats());

    let registered = control.params_of("run.createMetrics");
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0]["metrics"][0]["name"], json!("cpu_usage"));
    assert!(!control.params_of("run.submitMetrics").is_empty());

    let messages: Vec<String> = control.log_records().into_iter().map(|(_, m)| m).collect();
    assert_eq!(messages, vec!["step 1".to_owned(), "uploaded upload-1".to_owned()]);
    assert_eq!(control.uploaded_bytes("upload-1"), Some(vec![1u8; 100]));
    assert!(root.path().join("artifacts/weights.bin").exists());
    assert!(!root.path().join("tmp").exists());

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_run_reports_error_and_fatal_log() -> Result<()> {
    init_tracing();
    let control = MockControl::new(REFRESH_TOKEN).with_run(RUN_ID, json!({}));
    let server = MockControlServer::start(control.clone()).await?;
    let root = tempfile::tempdir()?;
    let mut supervisor = in_process_supervisor(server.url(), root.path(), ExecutionMode::Remote);

    let report = supervisor
        .execute(|ctx| async move {
            tokio::fs::write(ctx.artifact_dir().join("partial.ckpt"), b"ckpt").await?;
            Err(anyhow!("out of memory"))
        })
        .await?;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.exit_code, 1);
    assert_eq!(control.statuses(), vec!["inProgress", "completedWithError"]);
    let last = control
        .params_of("run.updateStatus")
        .into_iter()
        .filter(|params| params.get("status").is_some())
        .last()
        .unwrap();
    assert_eq!(last["message"], json!("out of memory"));
    assert!(control
        .log_records()
        .contains(&("fatal".to_owned(), "out of memory".to_owned())));
    assert!(!root.path().join("artifacts").exists());
    assert!(!root.path().join("leases/device.lease").exists());

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_run_never_starts() -> Result<()> {
    init_tracing();
    let control = MockControl::new(REFRESH_TOKEN);
    let server = MockControlServer::start(control.clone()).await?;
    let root = tempfile::tempdir()?;
    let mut supervisor = in_process_supervisor(server.url(), root.path(), ExecutionMode::Local);

    let report = supervisor
        .execute(|_| async { Err(anyhow!("payload must not run")) })
        .await?;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert!(report.error.unwrap().contains("unknown run"));
    assert_eq!(control.statuses(), vec!["completedWithError"]);
    assert_eq!(control.heartbeats(), 0);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn payload_connection_loss_skips_final_status() -> Result<()> {
    init_tracing();
    let control = MockControl::new(REFRESH_TOKEN).with_run(RUN_ID, json!({}));
    let server = MockControlServer::start(control.clone()).await?;
    let root = tempfile::tempdir()?;
    let mut supervisor = in_process_supervisor(server.url(), root.path(), ExecutionMode::Local);

    let report = supervisor
        .execute(|_| async { Err(anyhow::Error::new(ConnectionLost::new("link down"))) })
        .await?;

    assert_eq!(report.outcome, RunOutcome::ConnectionLost);
    assert_eq!(report.exit_code, 2);
    assert_eq!(control.statuses(), vec!["inProgress"]);
    assert!(control.log_records().is_empty());

    server.shutdown().await;
    Ok(())
}
