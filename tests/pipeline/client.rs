use std::time::Duration;

use crate::support::{
    helpers::{init_tracing, REFRESH_TOKEN, RUN_ID},
    mock_control::{MockControl, MockControlServer},
};
use anyhow::Result;
use runwatch::{
    is_connection_lost, ApiErrorKind, ControlPlaneOptions, JsonRpcControlPlane, LogRecord,
    RunStatus, Severity,
};
use serde_json::json;
use tokio::net::TcpListener;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn authenticate_installs_bearer_token() -> Result<()> {
    init_tracing();
    let control = MockControl::new(REFRESH_TOKEN).with_run(RUN_ID, json!({ "epochs": 3 }));
    let server = MockControlServer::start(control.clone()).await?;
    let client = JsonRpcControlPlane::new(server.url())?;

    let access = client.authenticate(REFRESH_TOKEN).await?;
    assert_eq!(access, control.access_token());

    let run = client.fetch_run(RUN_ID).await?;
    assert_eq!(run.id, RUN_ID);
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.parameter("epochs"), Some(&json!(3)));

    let calls = control.calls();
    assert_eq!(calls[0].method, "auth.authenticate");
    assert_eq!(calls[0].authorization, None);
    assert_eq!(
        calls[1].authorization.as_deref(),
        Some(format!("Bearer {}", control.access_token()).as_str())
    );
    let metrics = client.metrics();
    assert_eq!(metrics.total_calls, 2);
    assert_eq!(metrics.total_errors, 0);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_heartbeat_and_logs_use_expected_methods() -> Result<()> {
    init_tracing();
    let control = MockControl::new(REFRESH_TOKEN).with_run(RUN_ID, json!({}));
    let server = MockControlServer::start(control.clone()).await?;
    let client = JsonRpcControlPlane::new(server.url())?;
    client.authenticate(REFRESH_TOKEN).await?;

    client.update_status(RUN_ID, None, None).await?;
    client
        .update_status(RUN_ID, Some(RunStatus::CompletedWithError), Some("boom"))
        .await?;
    client
        .upload_logs(RUN_ID, &[LogRecord::new(Severity::Warning, "disk almost full")])
        .await?;

    assert_eq!(
        control.methods(),
        vec![
            "auth.authenticate",
            "run.updateStatus",
            "run.updateStatus",
            "log.upload"
        ]
    );
    assert_eq!(control.heartbeats(), 1);
    assert_eq!(control.statuses(), vec!["completedWithError"]);
    assert_eq!(control.params_of("run.updateStatus")[1]["message"], json!("boom"));
    assert_eq!(
        control.log_records(),
        vec![("warning".to_owned(), "disk almost full".to_owned())]
    );

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejections_are_not_connection_loss() -> Result<()> {
    init_tracing();
    let control = MockControl::new(REFRESH_TOKEN).with_run(RUN_ID, json!({}));
    let server = MockControlServer::start(control.clone()).await?;
    let client = JsonRpcControlPlane::new(server.url())?;

    let err = client.authenticate("wrong-token").await.unwrap_err();
    assert_eq!(err.kind(), ApiErrorKind::Rejected);
    assert!(!err.is_connection_lost());
    assert!(err.to_string().contains("invalid refresh token"));

    let err = client.fetch_run(RUN_ID).await.unwrap_err();
    assert_eq!(err.kind(), ApiErrorKind::Rejected);
    assert_eq!(err.method(), "run.fetch");

    client.authenticate(REFRESH_TOKEN).await?;
    let err = client.fetch_run("run-missing").await.unwrap_err();
    assert!(err.message().contains("unknown run run-missing"));

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_endpoint_is_connection_loss() -> Result<()> {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let client = JsonRpcControlPlane::with_options(
        format!("http://{addr}"),
        ControlPlaneOptions {
            request_timeout: Duration::from_secs(2),
            ..ControlPlaneOptions::default()
        },
    )?;
    let err = client.authenticate(REFRESH_TOKEN).await.unwrap_err();
    assert!(err.is_connection_lost(), "unexpected error: {err}");
    assert!(is_connection_lost(&anyhow::Error::new(err)));
    Ok(())
}
