//! DeviceDock Backend Client
//!
//! Bearer-authenticated JSON client for the device backend: device
//! lifecycle, worker discovery, build artifact lookup, identity validation,
//! the device-proxy passthrough and vision grounding.

use std::time::Duration;

use devicedock_protocol::backend::{
    ActiveDeviceSessionsResponse, BuildVersion, BuildVersionDetail, BuildVersionList,
    CancelDeviceResponse, GroundElementRequest, GroundElementResponse, StartDeviceRequest,
    StartDeviceResponse, ValidateApiKeyResponse, WorkerConnectionResponse,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_BACKEND_URL: &str = "https://backend.devicedock.dev";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const CLIENT_HEADER: &str = "x-devicedock-client";
const CLIENT_NAME: &str = "devicedock-cli";
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Errors returned by backend calls
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend base url is empty")]
    BaseUrlMissing,

    #[error("invalid backend path segment '{0}'")]
    InvalidPath(String),

    #[error("api key is not a valid header value")]
    InvalidApiKey,

    #[error("backend request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("backend returned {status}: {message}")]
    Http {
        status: u16,
        message: String,
        body: String,
    },

    #[error("failed to decode backend response: {0}")]
    Decode(String),

    #[error("backend response missing {0}")]
    MissingField(&'static str),
}

impl BackendError {
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Transport-level failure, as opposed to an answer from the backend.
    pub fn transport(&self) -> Option<&reqwest::Error> {
        match self {
            BackendError::Request(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let base_url = normalize_base_url(&config.base_url)?;

        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", config.api_key.trim());
        let mut auth = HeaderValue::from_str(&bearer)
            .map_err(|_| BackendError::InvalidApiKey)?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("devicedock/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(CLIENT_HEADER, HeaderValue::from_static(CLIENT_NAME));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(BackendError::Request)?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    /// Validates the API key and returns the caller's org and user identity.
    pub async fn validate_api_key(&self) -> Result<ValidateApiKeyResponse> {
        self.get_json("/api/v1/entity/users/get_user_uuid").await
    }

    pub async fn start_device(&self, request: &StartDeviceRequest) -> Result<StartDeviceResponse> {
        self.send_json(Method::POST, "/api/v1/execution/start_device", Some(request))
            .await
    }

    pub async fn cancel_device(&self, workflow_run_id: &str) -> Result<CancelDeviceResponse> {
        let path = format!(
            "/api/v1/execution/cancel_device/{}",
            path_segment(workflow_run_id)?
        );
        self.send_json::<(), _>(Method::POST, &path, None).await
    }

    pub async fn worker_connection(&self, workflow_run_id: &str) -> Result<WorkerConnectionResponse> {
        let path = format!(
            "/api/v1/execution/streaming/worker-connection/{}",
            path_segment(workflow_run_id)?
        );
        self.get_json(&path).await
    }

    pub async fn build_version_download(&self, version_id: &str) -> Result<BuildVersionDetail> {
        let path = format!("/api/v1/builds/builds/{}", path_segment(version_id)?);
        self.get_json(&path).await
    }

    /// Current build of an app, else the most recently uploaded one.
    pub async fn latest_build_version(&self, app_id: &str) -> Result<Option<BuildVersion>> {
        let path = format!("/api/v1/builds/vars/{}/versions", path_segment(app_id)?);
        let list: BuildVersionList = self.get_json(&path).await?;
        Ok(pick_latest(list.versions))
    }

    pub async fn active_device_sessions(&self, org_id: &str) -> Result<ActiveDeviceSessionsResponse> {
        let url = self.url("/api/v1/execution/device-sessions/active")?;
        let response = self
            .http
            .get(url)
            .query(&[("org_id", org_id)])
            .send()
            .await
            .map_err(BackendError::Request)?;
        decode_json_response(response).await
    }

    /// Forwards a worker action through the backend. Returns the raw status
    /// and body; only transport failures are errors.
    pub async fn proxy_worker_request(
        &self,
        workflow_run_id: &str,
        action: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(u16, Vec<u8>)> {
        let path = format!(
            "/api/v1/execution/device-proxy/{}/{}",
            path_segment(workflow_run_id)?,
            path_segment(action)?
        );
        let url = self.url(&path)?;
        let mut request = self.http.post(url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(BackendError::Request)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(BackendError::Request)?;
        tracing::debug!(
            component = "backend",
            event = "backend.device_proxy",
            workflow_run_id = %workflow_run_id,
            action = %action,
            status,
        );
        Ok((status, bytes.to_vec()))
    }

    pub async fn ground_element(&self, request: &GroundElementRequest) -> Result<GroundElementResponse> {
        self.send_json(Method::POST, "/api/v1/execution/ground", Some(request))
            .await
    }

    fn url(&self, path: &str) -> Result<String> {
        self.endpoint(path)
            .ok_or_else(|| BackendError::InvalidPath(path.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json::<(), T>(Method::GET, path, None).await
    }

    async fn send_json<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path)?;
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(BackendError::Request)?;
        decode_json_response(response).await
    }
}

fn pick_latest(versions: Vec<BuildVersion>) -> Option<BuildVersion> {
    if let Some(current) = versions.iter().find(|v| v.is_current) {
        return Some(current.clone());
    }
    versions.into_iter().max_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at))
}

fn normalize_base_url(base_url: &str) -> Result<String> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(BackendError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

fn path_segment(value: &str) -> Result<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.contains(['/', '?', '#']) {
        return Err(BackendError::InvalidPath(value.to_string()));
    }
    Ok(trimmed)
}

async fn decode_json_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(BackendError::Request)?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|err| BackendError::Decode(err.to_string()))
}

/// Builds an `Http` error, preferring the `error`, `message` or `detail`
/// field of a JSON body over the raw text.
pub fn format_http_error(status: StatusCode, body: &[u8]) -> BackendError {
    let raw = String::from_utf8_lossy(body).trim().to_string();
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            ["error", "message", "detail"].iter().find_map(|key| {
                value
                    .get(*key)
                    .and_then(|field| field.as_str())
                    .filter(|text| !text.trim().is_empty())
                    .map(str::to_string)
            })
        })
        .unwrap_or_else(|| {
            if raw.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                truncate_chars(&raw, MAX_ERROR_BODY_CHARS)
            }
        });

    BackendError::Http {
        status: status.as_u16(),
        message,
        body: raw,
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &value[..cut]),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, Query};
    use axum::http::HeaderMap as AxumHeaders;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    async fn spawn_backend(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub backend");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve stub backend");
        });
        format!("http://{addr}")
    }

    fn client(base_url: &str) -> BackendClient {
        BackendClient::new(BackendConfig::new(base_url, "test-key")).expect("backend client")
    }

    #[test]
    fn endpoint_builder_normalizes_paths() {
        let client = client("https://backend.example.com/");
        assert_eq!(
            client.endpoint("/api/v1/execution/ground"),
            Some("https://backend.example.com/api/v1/execution/ground".to_string())
        );
        assert_eq!(
            client.endpoint("api/v1/execution/ground"),
            Some("https://backend.example.com/api/v1/execution/ground".to_string())
        );
        assert_eq!(client.endpoint(" "), None);
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let err = BackendClient::new(BackendConfig::new("  ", "key")).unwrap_err();
        assert!(matches!(err, BackendError::BaseUrlMissing));
    }

    #[test]
    fn http_error_prefers_json_message_fields() {
        let err = format_http_error(StatusCode::BAD_REQUEST, br#"{"detail":"bad platform"}"#);
        assert_eq!(err.to_string(), "backend returned 400: bad platform");

        let long = "x".repeat(300);
        match format_http_error(StatusCode::BAD_GATEWAY, long.as_bytes()) {
            BackendError::Http { message, body, .. } => {
                assert_eq!(message.len(), MAX_ERROR_BODY_CHARS + 3);
                assert_eq!(body.len(), 300);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn latest_build_prefers_current_then_newest() {
        let versions = vec![
            BuildVersion {
                id: "old".into(),
                uploaded_at: "2026-01-01T00:00:00Z".into(),
                ..Default::default()
            },
            BuildVersion {
                id: "new".into(),
                uploaded_at: "2026-03-01T00:00:00Z".into(),
                ..Default::default()
            },
        ];
        assert_eq!(pick_latest(versions.clone()).map(|v| v.id), Some("new".into()));

        let mut pinned = versions;
        pinned[0].is_current = true;
        assert_eq!(pick_latest(pinned).map(|v| v.id), Some("old".into()));
        assert_eq!(pick_latest(Vec::new()), None);
    }

    #[tokio::test]
    async fn requests_carry_auth_and_client_headers() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_route = seen.clone();
        let app = Router::new().route(
            "/api/v1/entity/users/get_user_uuid",
            get(move |headers: AxumHeaders| {
                let seen = seen_in_route.clone();
                async move {
                    let header = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string()
                    };
                    seen.lock().expect("lock").push((
                        header("authorization"),
                        header(CLIENT_HEADER),
                    ));
                    Json(json!({
                        "user_id": "u-1",
                        "org_id": "org-1",
                        "email": "dev@example.com",
                        "concurrency_limit": 4
                    }))
                }
            }),
        );
        let base_url = spawn_backend(app).await;

        let identity = client(&base_url)
            .validate_api_key()
            .await
            .expect("validate api key");
        assert_eq!(identity.org_id, "org-1");
        assert_eq!(identity.email, "dev@example.com");

        let seen = seen.lock().expect("lock").clone();
        assert_eq!(
            seen,
            vec![("Bearer test-key".to_string(), CLIENT_NAME.to_string())]
        );
    }

    #[tokio::test]
    async fn active_sessions_are_queried_by_org() {
        let app = Router::new().route(
            "/api/v1/execution/device-sessions/active",
            get(
                |Query(params): Query<std::collections::HashMap<String, String>>| async move {
                    Json(json!({
                        "org_id": params.get("org_id").cloned().unwrap_or_default(),
                        "sessions": [{"id": "s-1", "platform": "ios", "workflow_run_id": "wf-1"}]
                    }))
                },
            ),
        );
        let base_url = spawn_backend(app).await;

        let resp = client(&base_url)
            .active_device_sessions("org-9")
            .await
            .expect("list sessions");
        assert_eq!(resp.org_id, "org-9");
        assert_eq!(resp.sessions.len(), 1);
        assert_eq!(resp.sessions[0].workflow_run_id.as_deref(), Some("wf-1"));
    }

    #[tokio::test]
    async fn proxy_returns_error_statuses_without_failing() {
        let app = Router::new().route(
            "/api/v1/execution/device-proxy/{wf}/{action}",
            post(|Path((wf, action)): Path<(String, String)>| async move {
                (
                    axum::http::StatusCode::BAD_GATEWAY,
                    format!("{wf}:{action} unavailable"),
                )
            }),
        );
        let base_url = spawn_backend(app).await;

        let (status, body) = client(&base_url)
            .proxy_worker_request("wf-1", "tap", Some(&json!({"x": 1, "y": 2})))
            .await
            .expect("proxy call");
        assert_eq!(status, 502);
        assert_eq!(String::from_utf8_lossy(&body), "wf-1:tap unavailable");
    }

    #[tokio::test]
    async fn start_device_surfaces_backend_error_message() {
        let app = Router::new().route(
            "/api/v1/execution/start_device",
            post(|| async {
                (
                    axum::http::StatusCode::PAYMENT_REQUIRED,
                    Json(json!({"error": "concurrency limit reached"})),
                )
            }),
        );
        let base_url = spawn_backend(app).await;

        let err = client(&base_url)
            .start_device(&StartDeviceRequest {
                platform: "android".into(),
                is_simulation: true,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(402));
        assert!(err.to_string().contains("concurrency limit reached"));
    }

    #[tokio::test]
    async fn path_segments_are_validated() {
        let client = client("http://127.0.0.1:1");
        let err = client.cancel_device("wf/../x").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidPath(_)));
    }
}
