use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{init_tracing, REFRESH_TOKEN, RUN_ID},
    mock_control::{MockControl, MockControlServer},
};
use anyhow::Result;
use runwatch::upload::{LogUploaderParams, WaitSchedule};
use runwatch::{ChunkedUpload, ControlPlane, JsonRpcControlPlane, LogUploader, Severity, Telemetry};
use serde_json::json;

async fn authenticated_client(server: &MockControlServer) -> Result<Arc<JsonRpcControlPlane>> {
    let client = JsonRpcControlPlane::new(server.url())?;
    client.authenticate(REFRESH_TOKEN).await?;
    Ok(Arc::new(client))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chunked_upload_reassembles_on_the_server() -> Result<()> {
    init_tracing();
    let control = MockControl::new(REFRESH_TOKEN);
    let server = MockControlServer::start(control.clone()).await?;
    let client = authenticated_client(&server).await?;

    let data: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(&data)?;
    file.flush()?;

    let telemetry = Arc::new(Telemetry::default());
    let upload = ChunkedUpload::new(client, telemetry.clone(), file.path(), 1_024)?;
    let upload_id = upload.upload().await?;

    assert_eq!(control.params_of("upload.start"), vec![json!({ "size": 5_000 })]);
    let ranges: Vec<(u64, u64)> = control
        .params_of("upload.chunk")
        .iter()
        .map(|params| (params["start"].as_u64().unwrap(), params["end"].as_u64().unwrap()))
        .collect();
    assert_eq!(
        ranges,
        vec![(0, 1_023), (1_024, 2_047), (2_048, 3_071), (3_072, 4_095), (4_096, 4_999)]
    );
    assert_eq!(control.uploaded_bytes(&upload_id), Some(data));
    assert_eq!(telemetry.snapshot().chunks_uploaded, 5);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn log_uploader_retries_after_rejection() -> Result<()> {
    init_tracing();
    let control = MockControl::new(REFRESH_TOKEN).with_run(RUN_ID, json!({}));
    let server = MockControlServer::start(control.clone()).await?;
    let client: Arc<dyn ControlPlane> = authenticated_client(&server).await?;

    let mut uploader = LogUploader::spawn(LogUploaderParams {
        control: client,
        run_id: RUN_ID.to_owned(),
        schedule: WaitSchedule::new(Duration::from_secs(30), Duration::from_secs(60)),
        telemetry: Arc::default(),
    });
    let sink = uploader.sink();
    sink.log(Severity::Info, "epoch 1");
    sink.log(Severity::Error, "nan loss");

    control.fail_next_log_uploads(1);
    let err = uploader.flush().await.unwrap_err();
    assert!(format!("{err:#}").contains("log storage unavailable"));
    assert_eq!(uploader.pending(), 2);
    assert_eq!(uploader.current_wait(), Duration::from_secs(60));

    sink.log(Severity::Info, "epoch 2");
    uploader.stop().await;

    assert_eq!(
        control.log_records(),
        vec![
            ("info".to_owned(), "epoch 1".to_owned()),
            ("error".to_owned(), "nan loss".to_owned()),
            ("info".to_owned(), "epoch 2".to_owned()),
        ]
    );
    assert!(sink.is_stopped());

    server.shutdown().await;
    Ok(())
}
