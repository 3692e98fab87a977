//! Provisioning pipeline: allocate a remote device, wait for its worker and
//! register the new session.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use devicedock_backend::BackendClient;
use devicedock_protocol::backend::{BuildVersionDetail, StartDeviceRequest};
use devicedock_protocol::{DeviceSession, Platform};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::manager::DeviceSessionManager;

/// Inputs of [`DeviceSessionManager::start_session`]. Install artifact
/// priority: `app_url`, then `build_version_id`, then the latest build of
/// `app_id`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub platform: String,
    pub app_id: Option<String>,
    pub build_version_id: Option<String>,
    pub app_url: Option<String>,
    pub app_link: Option<String>,
    /// Defaults to the resolved build's package name.
    pub app_package: Option<String>,
    /// Runs the device as part of a test instead of a free-form simulation.
    pub test_id: Option<String>,
    /// Zero or `None` uses the configured default.
    pub idle_timeout: Option<Duration>,
}

impl StartOptions {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartedSession {
    pub index: usize,
    pub session: DeviceSession,
    /// `false` when the device had not reported itself connected by the end
    /// of the connect window. The session is registered either way.
    pub device_ready: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct InstallArtifact {
    app_url: String,
    app_package: String,
}

impl InstallArtifact {
    fn apply(&mut self, detail: BuildVersionDetail) {
        self.app_url = detail.download_url.unwrap_or_default().trim().to_string();
        if self.app_package.is_empty() {
            self.app_package = detail.package_name.unwrap_or_default().trim().to_string();
        }
        debug!(
            component = "provisioning",
            event = "provision.artifact_resolved",
            build_version_id = %detail.id,
            has_download_url = !self.app_url.is_empty(),
            app_package = %self.app_package,
        );
    }
}

#[derive(Debug)]
enum WaitError {
    Cancelled,
    TimedOut(Duration),
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Cancelled => f.write_str("cancelled"),
            WaitError::TimedOut(after) => {
                write!(f, "timed out waiting for worker URL after {}s", after.as_secs())
            }
        }
    }
}

/// Cancels the remote device unless disarmed. Dropping an armed guard (the
/// provisioning future was dropped mid-poll) fires the cancel in the
/// background.
struct RemoteDeviceGuard {
    backend: BackendClient,
    workflow_run_id: String,
    armed: bool,
}

impl RemoteDeviceGuard {
    fn new(backend: BackendClient, workflow_run_id: &str) -> Self {
        Self {
            backend,
            workflow_run_id: workflow_run_id.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    async fn cancel_now(mut self) {
        self.armed = false;
        cancel_device_logged(&self.backend, &self.workflow_run_id).await;
    }
}

impl Drop for RemoteDeviceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let backend = self.backend.clone();
        let workflow_run_id = std::mem::take(&mut self.workflow_run_id);
        handle.spawn(async move {
            cancel_device_logged(&backend, &workflow_run_id).await;
        });
    }
}

async fn cancel_device_logged(backend: &BackendClient, workflow_run_id: &str) {
    match backend.cancel_device(workflow_run_id).await {
        Ok(_) => info!(
            component = "provisioning",
            event = "provision.device_cancelled",
            workflow_run_id = %workflow_run_id,
        ),
        Err(err) => warn!(
            component = "provisioning",
            event = "provision.device_cancel_failed",
            workflow_run_id = %workflow_run_id,
            error = %err,
        ),
    }
}

impl DeviceSessionManager {
    /// Provisions a cloud device and registers it as a new session. The
    /// new session becomes active when it is the only one.
    ///
    /// Cancelling `cancel` (or dropping the returned future) while waiting
    /// for the worker or the device cancels the remote device.
    pub async fn start_session(
        &self,
        options: StartOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<StartedSession> {
        let platform = Platform::from_str(&options.platform)
            .map_err(|err| SessionError::Validation(err.to_string()))?;
        let idle_timeout = options
            .idle_timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(self.shared.config.default_idle_timeout);

        let artifact = self.resolve_install_artifact(&options).await?;
        let test_id = trimmed(&options.test_id).unwrap_or_default();
        let request = StartDeviceRequest {
            platform: platform.as_str().to_string(),
            is_simulation: test_id.is_empty(),
            test_id: test_id.to_string(),
            app_url: artifact.app_url,
            app_link: trimmed(&options.app_link).unwrap_or_default().to_string(),
            app_package: artifact.app_package,
        };

        let response = self
            .shared
            .backend
            .start_device(&request)
            .await
            .map_err(|err| SessionError::backend("failed to start device", err))?;
        let Some(workflow_run_id) = response.workflow_run_id.filter(|id| !id.is_empty()) else {
            let reason = response
                .error
                .unwrap_or_else(|| "no workflow run ID returned".to_string());
            return Err(SessionError::Provisioning(format!(
                "failed to start device: {reason}"
            )));
        };
        info!(
            component = "provisioning",
            event = "provision.device_requested",
            workflow_run_id = %workflow_run_id,
            platform = %platform,
            is_simulation = request.is_simulation,
        );

        let guard = RemoteDeviceGuard::new(self.shared.backend.clone(), &workflow_run_id);

        let worker_base_url = match self.wait_for_worker_url(&workflow_run_id, cancel).await {
            Ok(url) => url,
            Err(WaitError::Cancelled) => {
                guard.cancel_now().await;
                return Err(SessionError::Cancelled("waiting for worker URL".to_string()));
            }
            Err(err) => {
                guard.cancel_now().await;
                return Err(SessionError::Provisioning(format!(
                    "device started but worker not ready: {err}. Try again or run `devicedock doctor` to diagnose"
                )));
            }
        };
        info!(
            component = "provisioning",
            event = "provision.worker_ready",
            workflow_run_id = %workflow_run_id,
            worker_base_url = %worker_base_url,
        );

        let device_ready = match self.wait_for_device(&worker_base_url, cancel).await {
            Ok(ready) => ready,
            Err(_) => {
                guard.cancel_now().await;
                return Err(SessionError::Cancelled(
                    "waiting for device to connect".to_string(),
                ));
            }
        };
        guard.disarm();
        if !device_ready {
            warn!(
                component = "provisioning",
                event = "provision.device_not_ready",
                workflow_run_id = %workflow_run_id,
                window_secs = self.shared.config.device_connect_timeout.as_secs(),
            );
        }

        let viewer_url = self
            .shared
            .config
            .viewer_url(&workflow_run_id, platform.as_str());
        let session_id = self
            .backend_session_id_for(&workflow_run_id)
            .await
            .unwrap_or_else(|| workflow_run_id.clone());

        let now = Utc::now();
        let mut session = DeviceSession {
            index: 0,
            session_id,
            workflow_run_id,
            worker_base_url,
            viewer_url,
            platform,
            started_at: now,
            last_activity: now,
            idle_timeout,
        };

        let index = {
            let mut registry = self.shared.registry.write().await;
            let index = registry.insert_new(session.clone());
            self.shared.store.save_logged(&registry.snapshot());
            index
        };
        session.index = index;
        info!(
            component = "provisioning",
            event = "session.started",
            index,
            workflow_run_id = %session.workflow_run_id,
            session_id = %session.session_id,
            device_ready,
        );

        Ok(StartedSession {
            index,
            session,
            device_ready,
        })
    }

    async fn resolve_install_artifact(&self, options: &StartOptions) -> Result<InstallArtifact> {
        let mut artifact = InstallArtifact {
            app_url: trimmed(&options.app_url).unwrap_or_default().to_string(),
            app_package: trimmed(&options.app_package)
                .unwrap_or_default()
                .to_string(),
        };
        if !artifact.app_url.is_empty() {
            return Ok(artifact);
        }

        // A build version without a download URL falls through to the latest
        // build of the app.
        let backend = &self.shared.backend;
        if let Some(version_id) = trimmed(&options.build_version_id) {
            let detail = backend.build_version_download(version_id).await.map_err(|err| {
                SessionError::backend(format!("failed to resolve build version {version_id}"), err)
            })?;
            artifact.apply(detail);
        }
        if artifact.app_url.is_empty() {
            if let Some(app_id) = trimmed(&options.app_id) {
                let latest = backend.latest_build_version(app_id).await.map_err(|err| {
                    SessionError::backend(format!("failed to resolve latest build for app {app_id}"), err)
                })?;
                if let Some(build) = latest {
                    let detail = backend.build_version_download(&build.id).await.map_err(|err| {
                        SessionError::backend(format!("failed to resolve latest build artifact for app {app_id}"), err)
                    })?;
                    artifact.apply(detail);
                }
            }
        }
        Ok(artifact)
    }

    async fn wait_for_worker_url(
        &self,
        workflow_run_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> std::result::Result<String, WaitError> {
        let timeout = self.shared.config.worker_url_timeout;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(WaitError::Cancelled);
            }
            let poll = until_cancelled(self.shared.backend.worker_connection(workflow_run_id), cancel).await?;
            match poll {
                Ok(connection) => {
                    if let Some(ws_url) = connection.worker_ws_url.filter(|url| !url.is_empty()) {
                        return Ok(ws_url_to_http(&ws_url));
                    }
                    debug!(
                        component = "provisioning",
                        event = "provision.worker_pending",
                        workflow_run_id = %workflow_run_id,
                        status = ?connection.status,
                    );
                }
                Err(err) => debug!(
                    component = "provisioning",
                    event = "provision.worker_poll_failed",
                    workflow_run_id = %workflow_run_id,
                    error = %err,
                ),
            }
            pause(self.shared.config.worker_url_interval, cancel).await?;
        }
        Err(WaitError::TimedOut(timeout))
    }

    /// Polls worker health until the device reports connected. `Ok(false)`
    /// when the window closes first.
    async fn wait_for_device(
        &self,
        worker_base_url: &str,
        cancel: Option<&CancellationToken>,
    ) -> std::result::Result<bool, WaitError> {
        let config = &self.shared.config;
        let attempts = poll_attempts(config.device_connect_timeout, config.device_connect_interval);
        for attempt in 0..attempts {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(WaitError::Cancelled);
            }
            match until_cancelled(self.probe_health(worker_base_url), cancel).await? {
                Ok(()) => return Ok(true),
                Err(issue) => debug!(
                    component = "provisioning",
                    event = "provision.device_pending",
                    attempt,
                    issue = %issue,
                ),
            }
            pause(config.device_connect_interval, cancel).await?;
        }
        Ok(false)
    }

    /// Backend session id of a freshly started workflow run, if the backend
    /// already lists it.
    async fn backend_session_id_for(&self, workflow_run_id: &str) -> Option<String> {
        let (org_id, user_email) = match self.ensure_org_info().await {
            Ok(identity) => identity,
            Err(err) => {
                debug!(
                    component = "provisioning",
                    event = "provision.session_lookup_skipped",
                    error = %err,
                );
                return None;
            }
        };
        let active = match self.shared.backend.active_device_sessions(&org_id).await {
            Ok(active) => active,
            Err(err) => {
                debug!(
                    component = "provisioning",
                    event = "provision.session_lookup_failed",
                    error = %err,
                );
                return None;
            }
        };
        active
            .sessions
            .into_iter()
            .filter(|remote| belongs_to(&user_email, remote.user_email.as_deref()))
            .find(|remote| remote.workflow_run_id.as_deref() == Some(workflow_run_id))
            .map(|remote| remote.id)
    }
}

/// Sessions of other users in the same org are skipped once both sides
/// know an email.
pub(crate) fn belongs_to(user_email: &str, remote_email: Option<&str>) -> bool {
    match remote_email {
        Some(remote) if !user_email.is_empty() => remote == user_email,
        _ => true,
    }
}

fn trimmed(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

fn poll_attempts(window: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 1;
    }
    let attempts = window.as_nanos().div_ceil(interval.as_nanos());
    u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
}

async fn pause(interval: Duration, cancel: Option<&CancellationToken>) -> std::result::Result<(), WaitError> {
    until_cancelled(tokio::time::sleep(interval), cancel).await
}

/// Drives `fut` to completion unless `cancel` fires first.
async fn until_cancelled<F: Future>(
    fut: F,
    cancel: Option<&CancellationToken>,
) -> std::result::Result<F::Output, WaitError> {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(WaitError::Cancelled),
            output = fut => Ok(output),
        },
        None => Ok(fut.await),
    }
}

/// Worker HTTP base from the websocket URL the backend advertises:
/// `wss://host/ws/stream?token=abc` becomes `https://host`.
pub fn ws_url_to_http(ws_url: &str) -> String {
    let mut url = if let Some(rest) = ws_url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = ws_url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        ws_url.to_string()
    };
    if let Some(at) = url.find("/ws/") {
        url.truncate(at);
    }
    url
}
