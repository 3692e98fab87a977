//! Worker gateway: HTTP calls to a session's worker, with a single retry on
//! `503`, a backend proxy fallback on connectivity loss, and failure
//! diagnosis through the backend's view of the session.

use std::fmt;

use devicedock_protocol::backend::WorkerConnectionStatus;
use devicedock_protocol::worker::WorkerHealth;
use devicedock_protocol::DeviceSession;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connectivity::classify_reqwest;
use crate::error::{ConnectivityKind, Result, SessionError, WorkerHttpError};
use crate::fallback::{run_in_order, Disposition};
use crate::manager::DeviceSessionManager;

const NOT_CONNECTED_HINT: &str = "The device may not be fully connected yet. Wait a few seconds and retry, or run `devicedock doctor`";
const DOCTOR_HINT: &str = "Run `devicedock doctor` to check the device";
const DEVICE_NOT_CONNECTED: &str = "worker healthy but device not connected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Direct,
    BackendProxy,
}

#[derive(Debug)]
enum RouteError {
    /// The route answered with an error status.
    Http(WorkerHttpError),
    /// The request never got an answer.
    Transport(reqwest::Error),
    Failed(SessionError),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::Http(err) => fmt::Display::fmt(err, f),
            RouteError::Transport(err) => fmt::Display::fmt(err, f),
            RouteError::Failed(err) => fmt::Display::fmt(err, f),
        }
    }
}

/// Result of a worker health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReadiness {
    pub index: usize,
    pub device_ready: bool,
    /// Why the device is not ready.
    pub detail: Option<String>,
}

#[derive(Debug)]
pub(crate) enum HealthIssue {
    Unreachable(reqwest::Error),
    Unhealthy(String),
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthIssue::Unreachable(err) => write!(f, "worker unreachable: {err}"),
            HealthIssue::Unhealthy(detail) => f.write_str(detail),
        }
    }
}

impl DeviceSessionManager {
    /// Sends one request to a session's worker and returns the response body.
    /// `index` follows the `resolve_session` rules.
    pub async fn worker_request(
        &self,
        index: Option<usize>,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Vec<u8>> {
        let session = self.resolve_session(index).await?;
        self.request_for_session(&session, method, path, body.as_ref())
            .await
    }

    pub(crate) async fn request_for_session(
        &self,
        session: &DeviceSession,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Vec<u8>> {
        self.record_activity(session).await;
        let path = normalize_path(path);

        let outcome = run_in_order(
            &[Route::Direct, Route::BackendProxy],
            |route| self.attempt_route(route, session, &method, &path, body),
            |route, err| match (route, err) {
                (Route::Direct, RouteError::Transport(source)) if classify_reqwest(source).is_some() => {
                    Disposition::TryNext
                }
                _ => Disposition::Stop,
            },
        )
        .await;

        let mut attempts = match outcome {
            Ok(bytes) => return Ok(bytes),
            Err(attempts) => attempts,
        };
        let last = attempts.pop();
        let direct = attempts.into_iter().next();
        match (direct, last) {
            (_, Some((_, RouteError::Http(err)))) => Err(err.into()),
            (Some((_, RouteError::Transport(source))), Some((_, proxy_failure))) => {
                warn!(
                    component = "gateway",
                    event = "worker.proxy_failed",
                    index = session.index,
                    path = %path,
                    error = %proxy_failure,
                );
                Err(self.diagnose_transport(session, &path, source).await)
            }
            (None, Some((_, RouteError::Transport(source)))) => {
                Err(self.diagnose_transport(session, &path, source).await)
            }
            (_, Some((_, RouteError::Failed(err)))) => Err(err),
            _ => Err(SessionError::InvalidResponse(format!(
                "worker request failed for {path}"
            ))),
        }
    }

    async fn attempt_route(
        &self,
        route: Route,
        session: &DeviceSession,
        method: &Method,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<Vec<u8>, RouteError> {
        match route {
            Route::Direct => self.send_direct(session, method, path, body).await,
            Route::BackendProxy => self.send_via_proxy(session, path, body).await,
        }
    }

    async fn send_direct(
        &self,
        session: &DeviceSession,
        method: &Method,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<Vec<u8>, RouteError> {
        let url = worker_url(&session.worker_base_url, path);
        let response = self
            .send_once(method, &url, body)
            .await
            .map_err(RouteError::Transport)?;
        let status = response.status().as_u16();
        let bytes = read_body(response, path).await?;
        debug!(
            component = "gateway",
            event = "worker.response",
            index = session.index,
            method = %method,
            path = %path,
            status,
        );

        if status == 503 {
            tokio::time::sleep(self.shared.config.retry_delay).await;
            match self.send_once(method, &url, body).await {
                Ok(retry) => {
                    let retry_status = retry.status().as_u16();
                    let retry_bytes = read_body(retry, path).await?;
                    if retry_status < 400 {
                        return Ok(retry_bytes);
                    }
                    return Err(RouteError::Http(
                        WorkerHttpError::new(retry_status, path, lossy(&retry_bytes))
                            .with_hint(NOT_CONNECTED_HINT),
                    ));
                }
                Err(err) => {
                    warn!(
                        component = "gateway",
                        event = "worker.retry_failed",
                        index = session.index,
                        path = %path,
                        error = %err,
                    );
                }
            }
        }

        if status >= 500 {
            return Err(RouteError::Http(
                WorkerHttpError::new(status, path, lossy(&bytes)).with_hint(DOCTOR_HINT),
            ));
        }
        if status >= 400 {
            return Err(RouteError::Http(WorkerHttpError::new(
                status,
                path,
                lossy(&bytes),
            )));
        }
        Ok(bytes)
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let mut request = self.shared.http.request(method.clone(), url);
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await
    }

    async fn send_via_proxy(
        &self,
        session: &DeviceSession,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<Vec<u8>, RouteError> {
        let action = proxy_action_from_path(path).map_err(RouteError::Failed)?;
        let (status, bytes) = self
            .shared
            .backend
            .proxy_worker_request(&session.workflow_run_id, &action, body)
            .await
            .map_err(|err| RouteError::Failed(SessionError::backend("device proxy request failed", err)))?;
        if status >= 400 {
            return Err(RouteError::Http(WorkerHttpError::new(
                status,
                path,
                lossy(&bytes),
            )));
        }
        info!(
            component = "gateway",
            event = "worker.proxy_fallback",
            index = session.index,
            workflow_run_id = %session.workflow_run_id,
            action = %action,
            status,
        );
        Ok(bytes)
    }

    /// Turns a transport failure into the most specific error available:
    /// the backend's view of the session first, then the network symptom.
    pub(crate) async fn diagnose_transport(
        &self,
        session: &DeviceSession,
        path: &str,
        source: reqwest::Error,
    ) -> SessionError {
        if let Some(err) = self.lookup_remote_status(session).await {
            return err;
        }

        let url = &session.worker_base_url;
        let Some(kind) = classify_reqwest(&source) else {
            return SessionError::Transport {
                path: path.to_string(),
                source,
            };
        };
        let message = match kind {
            ConnectivityKind::Dns => format!(
                "worker DNS lookup failed for {url}: the device session has likely been terminated. Run `devicedock list` to check status or `devicedock start` for a new session"
            ),
            ConnectivityKind::Timeout => format!(
                "worker request timed out for {path} on {url}. Run `devicedock doctor` to diagnose or `devicedock stop -s {}` to clean up",
                session.index
            ),
            other => format!(
                "worker at {url} is unreachable ({other}). Run `devicedock doctor` to diagnose or `devicedock start` for a new session"
            ),
        };
        SessionError::Connectivity {
            kind,
            message,
            source,
        }
    }

    /// Best-effort backend status lookup. `None` when the backend cannot be
    /// reached or reports nothing conclusive.
    async fn lookup_remote_status(&self, session: &DeviceSession) -> Option<SessionError> {
        let lookup = tokio::time::timeout(
            self.shared.config.status_lookup_timeout,
            self.shared
                .backend
                .worker_connection(&session.workflow_run_id),
        )
        .await;
        let connection = match lookup {
            Ok(Ok(connection)) => connection,
            Ok(Err(err)) => {
                debug!(
                    component = "gateway",
                    event = "worker.status_lookup_failed",
                    workflow_run_id = %session.workflow_run_id,
                    error = %err,
                );
                return None;
            }
            Err(_) => return None,
        };

        if connection.status.is_terminated() {
            Some(SessionError::TerminatedExternally {
                index: session.index,
            })
        } else if connection.status == WorkerConnectionStatus::Failed {
            Some(SessionError::WorkerFailed {
                index: session.index,
            })
        } else {
            None
        }
    }

    /// Pings `/health` on a worker base URL.
    pub(crate) async fn probe_health(&self, base_url: &str) -> std::result::Result<(), HealthIssue> {
        let response = self
            .shared
            .http
            .get(worker_url(base_url, "/health"))
            .timeout(self.shared.config.health_check_timeout)
            .send()
            .await
            .map_err(HealthIssue::Unreachable)?;
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(HealthIssue::Unhealthy(format!(
                "worker health check returned {}",
                status.as_u16()
            )));
        }

        // A reachable worker with an unreadable body counts as healthy.
        let Ok(bytes) = response.bytes().await else {
            return Ok(());
        };
        match serde_json::from_slice::<WorkerHealth>(&bytes) {
            Ok(health) if !health.device_connected => {
                Err(HealthIssue::Unhealthy(DEVICE_NOT_CONNECTED.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Checks whether a session's device is reachable and attached.
    /// Unreachable workers are diagnosed like a failed worker request.
    pub async fn health_check(&self, index: Option<usize>) -> Result<DeviceReadiness> {
        let session = self.resolve_session(index).await?;
        match self.probe_health(&session.worker_base_url).await {
            Ok(()) => Ok(DeviceReadiness {
                index: session.index,
                device_ready: true,
                detail: None,
            }),
            Err(HealthIssue::Unhealthy(detail)) => Ok(DeviceReadiness {
                index: session.index,
                device_ready: false,
                detail: Some(detail),
            }),
            Err(HealthIssue::Unreachable(source)) => {
                Err(self.diagnose_transport(&session, "/health", source).await)
            }
        }
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn worker_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

async fn read_body(response: reqwest::Response, path: &str) -> std::result::Result<Vec<u8>, RouteError> {
    response
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|err| {
            RouteError::Failed(SessionError::InvalidResponse(format!(
                "failed to read worker response for {path}: {err}"
            )))
        })
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Maps a worker path to the single-segment action name the backend proxy
/// expects: `/tap?x=1` becomes `tap`.
pub(crate) fn proxy_action_from_path(path: &str) -> Result<String> {
    let invalid = || SessionError::Validation(format!("invalid worker path '{path}' for proxy fallback"));
    let trimmed = path.trim();
    let without_query = trimmed.split('?').next().unwrap_or_default();
    let action = without_query.trim_matches('/');
    if action.is_empty() || action.contains('/') {
        return Err(invalid());
    }
    Ok(action.to_string())
}
