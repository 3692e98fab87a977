//! In-process stand-ins for the backend and a device worker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use devicedock_backend::{BackendClient, BackendConfig};
use devicedock_protocol::backend::ActiveDeviceSession;
use devicedock_protocol::{DeviceSession, Platform};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::config::ManagerConfig;
use crate::manager::DeviceSessionManager;

pub(crate) const UNREACHABLE_URL: &str = "http://127.0.0.1:1";

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve stub");
    });
    format!("http://{addr}")
}

pub(crate) fn fast_config(work_dir: &Path) -> ManagerConfig {
    let mut config = ManagerConfig::new(work_dir).with_viewer_base_url("http://viewer.test");
    config.worker_request_timeout = Duration::from_secs(2);
    config.health_check_timeout = Duration::from_millis(500);
    config.worker_url_timeout = Duration::from_millis(300);
    config.worker_url_interval = Duration::from_millis(10);
    config.device_connect_timeout = Duration::from_millis(100);
    config.device_connect_interval = Duration::from_millis(10);
    config.retry_delay = Duration::from_millis(10);
    config.status_lookup_timeout = Duration::from_millis(500);
    config.sync_interval = Duration::from_millis(50);
    config
}

pub(crate) fn manager_for(backend: &StubBackend, work_dir: &Path) -> DeviceSessionManager {
    manager_with_backend_url(&backend.base_url, work_dir)
}

pub(crate) fn manager_with_backend_url(base_url: &str, work_dir: &Path) -> DeviceSessionManager {
    let client = BackendClient::new(BackendConfig::new(base_url, "test-key")).expect("backend client");
    DeviceSessionManager::new(fast_config(work_dir), client).expect("manager")
}

pub(crate) fn session_record(id: &str, idle_timeout: Duration) -> DeviceSession {
    session_on_worker(id, UNREACHABLE_URL, idle_timeout)
}

pub(crate) fn session_on_worker(id: &str, worker_base_url: &str, idle_timeout: Duration) -> DeviceSession {
    let now = Utc::now();
    DeviceSession {
        index: 0,
        session_id: id.to_string(),
        workflow_run_id: format!("wf-{id}"),
        worker_base_url: worker_base_url.to_string(),
        viewer_url: format!("http://viewer.test/tests/execute?workflowRunId=wf-{id}&platform=android"),
        platform: Platform::Android,
        started_at: now,
        last_activity: now,
        idle_timeout,
    }
}

pub(crate) async fn seed(manager: &DeviceSessionManager, sessions: Vec<DeviceSession>) {
    let mut registry = manager.shared.registry.write().await;
    for session in sessions {
        registry.insert_new(session);
    }
}

// Backend

#[derive(Default)]
pub(crate) struct BackendState {
    pub identity: Option<(String, String)>,
    pub start_workflow_run_id: Option<String>,
    pub start_requests: Vec<Value>,
    pub cancelled: Vec<String>,
    pub fail_cancels: bool,
    pub worker_ws_urls: HashMap<String, String>,
    pub worker_statuses: HashMap<String, String>,
    pub worker_connection_polls: usize,
    pub worker_connection_delay: Option<Duration>,
    pub active_sessions: Vec<ActiveDeviceSession>,
    pub build_versions: Vec<Value>,
    /// Build ids whose download lookup answers with an empty URL.
    pub builds_without_download: HashSet<String>,
    pub proxy_calls: Vec<(String, String, Value)>,
    pub proxy_response: Option<(u16, String)>,
    pub ground_calls: Vec<Value>,
    pub ground_response: Option<Value>,
}

#[derive(Clone)]
pub(crate) struct StubBackend {
    pub base_url: String,
    pub state: Arc<Mutex<BackendState>>,
}

type Shared<T> = State<Arc<Mutex<T>>>;

impl StubBackend {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(BackendState {
            identity: Some(("org-1".to_string(), "dev@example.com".to_string())),
            start_workflow_run_id: Some("wf-new".to_string()),
            ..BackendState::default()
        }));
        let app = Router::new()
            .route("/api/v1/entity/users/get_user_uuid", get(validate_api_key))
            .route("/api/v1/execution/start_device", post(start_device))
            .route("/api/v1/execution/cancel_device/{wf}", post(cancel_device))
            .route(
                "/api/v1/execution/streaming/worker-connection/{wf}",
                get(worker_connection),
            )
            .route("/api/v1/builds/builds/{id}", get(build_detail))
            .route("/api/v1/builds/vars/{app}/versions", get(build_versions))
            .route("/api/v1/execution/device-sessions/active", get(active_sessions))
            .route(
                "/api/v1/execution/device-proxy/{wf}/{action}",
                post(device_proxy),
            )
            .route("/api/v1/execution/ground", post(ground))
            .with_state(state.clone());
        let base_url = serve(app).await;
        Self { base_url, state }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut BackendState) -> R) -> R {
        let mut state = self.state.lock().expect("backend state");
        f(&mut state)
    }

    pub fn fail_cancels(&self) {
        self.with(|state| state.fail_cancels = true);
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.with(|state| state.cancelled.clone())
    }

    pub fn set_worker(&self, workflow_run_id: &str, ws_url: &str) {
        self.with(|state| {
            state
                .worker_ws_urls
                .insert(workflow_run_id.to_string(), ws_url.to_string());
        });
    }

    pub fn set_worker_status(&self, workflow_run_id: &str, status: &str) {
        self.with(|state| {
            state
                .worker_statuses
                .insert(workflow_run_id.to_string(), status.to_string());
        });
    }

    pub fn add_active(&self, id: &str, workflow_run_id: &str, email: &str, created_at: &str) {
        self.with(|state| {
            state.active_sessions.push(ActiveDeviceSession {
                id: id.to_string(),
                org_id: "org-1".to_string(),
                platform: "android".to_string(),
                source: "cli".to_string(),
                status: "running".to_string(),
                workflow_run_id: Some(workflow_run_id.to_string()),
                user_email: Some(email.to_string()),
                created_at: Some(created_at.to_string()),
                started_at: Some(created_at.to_string()),
            });
        });
    }
}

async fn validate_api_key(State(state): Shared<BackendState>) -> Response {
    let identity = state.lock().expect("backend state").identity.clone();
    match identity {
        Some((org_id, email)) => Json(json!({
            "user_id": "user-1",
            "org_id": org_id,
            "email": email,
            "concurrency_limit": 5
        }))
        .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "invalid api key"})),
        )
            .into_response(),
    }
}

async fn start_device(State(state): Shared<BackendState>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = state.lock().expect("backend state");
    state.start_requests.push(body);
    match state.start_workflow_run_id.clone() {
        Some(wf) => Json(json!({"workflow_run_id": wf})),
        None => Json(json!({"workflow_run_id": null, "error": "no devices available"})),
    }
}

async fn cancel_device(State(state): Shared<BackendState>, UrlPath(wf): UrlPath<String>) -> Response {
    let mut state = state.lock().expect("backend state");
    state.cancelled.push(wf);
    if state.fail_cancels {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "cancel exploded"})),
        )
            .into_response();
    }
    Json(json!({"message": "cancelled"})).into_response()
}

async fn worker_connection(State(state): Shared<BackendState>, UrlPath(wf): UrlPath<String>) -> Json<Value> {
    let delay = state.lock().expect("backend state").worker_connection_delay;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let mut state = state.lock().expect("backend state");
    state.worker_connection_polls += 1;
    let status = state
        .worker_statuses
        .get(&wf)
        .cloned()
        .unwrap_or_else(|| "running".to_string());
    Json(json!({
        "status": status,
        "workflow_run_id": wf,
        "worker_ws_url": state.worker_ws_urls.get(&wf),
    }))
}

async fn build_detail(State(state): Shared<BackendState>, UrlPath(id): UrlPath<String>) -> Json<Value> {
    let download_url = if state.lock().expect("backend state").builds_without_download.contains(&id) {
        String::new()
    } else {
        format!("https://builds.test/{id}.apk")
    };
    Json(json!({
        "id": id,
        "version": "1.0.0",
        "download_url": download_url,
        "package_name": format!("com.example.{id}"),
    }))
}

async fn build_versions(State(state): Shared<BackendState>) -> Json<Value> {
    let versions = state.lock().expect("backend state").build_versions.clone();
    Json(json!({"versions": versions}))
}

async fn active_sessions(State(state): Shared<BackendState>) -> Json<Value> {
    let sessions = state.lock().expect("backend state").active_sessions.clone();
    Json(json!({"org_id": "org-1", "sessions": sessions}))
}

async fn device_proxy(
    State(state): Shared<BackendState>,
    UrlPath((wf, action)): UrlPath<(String, String)>,
    body: Bytes,
) -> Response {
    let mut state = state.lock().expect("backend state");
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state.proxy_calls.push((wf, action, body));
    let (status, text) = state
        .proxy_response
        .clone()
        .unwrap_or_else(|| (200, r#"{"success":true,"action":"proxied"}"#.to_string()));
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
        text,
    )
        .into_response()
}

async fn ground(State(state): Shared<BackendState>, Json(body): Json<Value>) -> Json<Value> {
    let mut state = state.lock().expect("backend state");
    state.ground_calls.push(body);
    Json(
        state
            .ground_response
            .clone()
            .unwrap_or_else(|| json!({"found": true, "x": 321, "y": 654})),
    )
}

// Worker

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WorkerCall {
    pub method: Method,
    pub path: String,
    pub body: Value,
}

#[derive(Default)]
pub(crate) struct WorkerState {
    pub calls: Vec<WorkerCall>,
    /// Scripted answers per path, consumed in order. Unscripted paths get `200 {"success":true}`.
    pub scripted: HashMap<String, VecDeque<(u16, Vec<u8>)>>,
    pub device_connected: bool,
    pub health_status: u16,
}

#[derive(Clone)]
pub(crate) struct StubWorker {
    pub base_url: String,
    pub state: Arc<Mutex<WorkerState>>,
}

impl StubWorker {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(WorkerState {
            device_connected: true,
            health_status: 200,
            ..WorkerState::default()
        }));
        let app = Router::new()
            .fallback(worker_endpoint)
            .with_state(state.clone());
        let base_url = serve(app).await;
        Self { base_url, state }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut WorkerState) -> R) -> R {
        let mut state = self.state.lock().expect("worker state");
        f(&mut state)
    }

    pub fn script(&self, path: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.with(|state| {
            state
                .scripted
                .entry(path.to_string())
                .or_default()
                .push_back((status, body.into()));
        });
    }

    pub fn calls_to(&self, path: &str) -> Vec<WorkerCall> {
        self.with(|state| {
            state
                .calls
                .iter()
                .filter(|call| call.path == path)
                .cloned()
                .collect()
        })
    }

    /// The `ws://` URL the backend would advertise for this worker.
    pub fn ws_url(&self) -> String {
        format!(
            "{}/ws/stream?token=abc",
            self.base_url.replacen("http://", "ws://", 1)
        )
    }
}

async fn worker_endpoint(
    State(state): Shared<WorkerState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let mut state = state.lock().expect("worker state");
    let path = uri.path().to_string();
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state.calls.push(WorkerCall {
        method,
        path: path.clone(),
        body,
    });

    if let Some((status, bytes)) = state.scripted.get_mut(&path).and_then(VecDeque::pop_front) {
        return (
            StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            bytes,
        )
            .into_response();
    }

    if path == "/health" {
        let status = StatusCode::from_u16(state.health_status).unwrap_or(StatusCode::OK);
        return (
            status,
            Json(json!({"status": "ok", "device_connected": state.device_connected})),
        )
            .into_response();
    }

    Json(json!({"success": true})).into_response()
}

/// A worker that reads each request in full and then aborts the connection
/// with a TCP reset instead of answering. Returns its base URL and the count
/// of requests it has read.
pub(crate) async fn resetting_worker() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind resetting worker");
    let addr = listener.local_addr().expect("local addr");
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            if read_full_request(&mut stream).await {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            let _ = stream.set_linger(Some(Duration::ZERO));
            drop(stream);
        }
    });
    (format!("http://{addr}"), received)
}

async fn read_full_request(stream: &mut TcpStream) -> bool {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return true;
            }
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Minimal PNG header with the given dimensions.
pub(crate) fn png_header(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    bytes
}
