use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const UNAUTHORIZED: i64 = -32001;
const NOT_FOUND: i64 = -32004;
const UNAVAILABLE: i64 = -32003;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub params: Value,
    pub authorization: Option<String>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<RecordedCall>,
    runs: HashMap<String, Value>,
    log_failures_left: usize,
    uploads: HashMap<String, Vec<u8>>,
}

/// In-memory control plane speaking the JSON-RPC methods the client uses.
#[derive(Clone)]
pub struct MockControl {
    refresh_token: Arc<String>,
    state: Arc<Mutex<MockState>>,
}

impl MockControl {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: Arc::new(refresh_token.into()),
            state: Arc::default(),
        }
    }

    pub fn with_run(self, run_id: &str, parameters: Value) -> Self {
        self.state().runs.insert(
            run_id.to_owned(),
            json!({
                "id": run_id,
                "status": "queued",
                "parameters": parameters,
                "metrics": [],
            }),
        );
        self
    }

    pub fn access_token(&self) -> String {
        format!("access-{}", self.refresh_token)
    }

    pub fn fail_next_log_uploads(&self, count: usize) {
        self.state().log_failures_left = count;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .map(|call| call.method.clone())
            .collect()
    }

    pub fn params_of(&self, method: &str) -> Vec<Value> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .map(|call| call.params.clone())
            .collect()
    }

    /// Explicit status transitions, heartbeats excluded.
    pub fn statuses(&self) -> Vec<String> {
        self.params_of("run.updateStatus")
            .iter()
            .filter_map(|params| params.get("status").and_then(Value::as_str))
            .map(str::to_owned)
            .collect()
    }

    pub fn heartbeats(&self) -> usize {
        self.params_of("run.updateStatus")
            .iter()
            .filter(|params| params.get("status").is_none())
            .count()
    }

    /// `(severity, message)` of every accepted log record, in upload order.
    pub fn log_records(&self) -> Vec<(String, String)> {
        self.params_of("log.upload")
            .iter()
            .flat_map(|params| {
                params
                    .get("records")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
            })
            .map(|record| {
                (
                    record["severity"].as_str().unwrap_or_default().to_owned(),
                    record["message"].as_str().unwrap_or_default().to_owned(),
                )
            })
            .collect()
    }

    pub fn uploaded_bytes(&self, upload_id: &str) -> Option<Vec<u8>> {
        self.state().uploads.get(upload_id).cloned()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock control plane poisoned")
    }

    fn handle_call(&self, call: Value, authorization: Option<String>) -> Value {
        let id = call.get("id").cloned().unwrap_or(Value::Null);
        let method = call
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let params = call.get("params").cloned().unwrap_or(Value::Null);

        let mut state = self.state();
        state.calls.push(RecordedCall {
            method: method.clone(),
            params: params.clone(),
            authorization: authorization.clone(),
        });

        if method == "auth.authenticate" {
            return if params["refreshToken"].as_str() == Some(self.refresh_token.as_str()) {
                success(id, json!({ "accessToken": self.access_token() }))
            } else {
                error(id, UNAUTHORIZED, "invalid refresh token")
            };
        }

        let expected = format!("Bearer {}", self.access_token());
        if authorization.as_deref() != Some(expected.as_str()) {
            state.calls.pop();
            return error(id, UNAUTHORIZED, "missing or invalid access token");
        }

        match method.as_str() {
            "run.fetch" => {
                let run_id = params["runId"].as_str().unwrap_or_default();
                match state.runs.get(run_id) {
                    Some(run) => success(id, run.clone()),
                    None => error(id, NOT_FOUND, format!("unknown run {run_id}")),
                }
            }
            "run.updateStatus" => {
                let run_id = params["runId"].as_str().unwrap_or_default().to_owned();
                if let (Some(status), Some(run)) = (params.get("status"), state.runs.get_mut(&run_id)) {
                    run["status"] = status.clone();
                }
                success(id, Value::Null)
            }
            "run.createMetrics" | "run.submitMetrics" => success(id, Value::Null),
            "log.upload" => {
                if state.log_failures_left > 0 {
                    state.log_failures_left -= 1;
                    state.calls.pop();
                    return error(id, UNAVAILABLE, "log storage unavailable");
                }
                success(id, Value::Null)
            }
            "upload.start" => {
                let upload_id = format!("upload-{}", state.uploads.len() + 1);
                state.uploads.insert(upload_id.clone(), Vec::new());
                success(id, json!({ "uploadId": upload_id }))
            }
            "upload.chunk" => {
                let upload_id = params["uploadId"].as_str().unwrap_or_default().to_owned();
                let start = params["start"].as_u64().unwrap_or(u64::MAX);
                let end = params["end"].as_u64().unwrap_or(0);
                let data = params["data"].as_str().unwrap_or_default();
                let Ok(bytes) = BASE64_STANDARD.decode(data) else {
                    return error(id, -32602, "chunk data is not base64");
                };
                let Some(buffer) = state.uploads.get_mut(&upload_id) else {
                    return error(id, NOT_FOUND, format!("unknown upload {upload_id}"));
                };
                if start != buffer.len() as u64 || end + 1 - start != bytes.len() as u64 {
                    return error(id, -32602, format!("unexpected range {start}-{end}"));
                }
                buffer.extend_from_slice(&bytes);
                success(id, Value::Null)
            }
            _ => error(id, -32601, format!("unknown method {method}")),
        }
    }
}

pub struct MockControlServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockControlServer {
    pub async fn start(control: MockControl) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock control listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let control = control.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| serve_request(control.clone(), req)))
            }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock control server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(control: MockControl, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        let mut response = Response::new(Body::from("Unsupported method"));
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }

    let authorization = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("failed to read body: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("invalid JSON payload: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let response_value = control.handle_call(payload, authorization);

    let mut response = Response::new(Body::from(response_value.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}

fn error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message.into(),
        },
        "id": id,
    })
}
