//! Tunables for the session manager.

use std::path::PathBuf;
use std::time::Duration;

use devicedock_protocol::DEFAULT_IDLE_TIMEOUT;

pub const DEFAULT_VIEWER_BASE_URL: &str = "https://app.devicedock.dev";
pub const LOCAL_VIEWER_BASE_URL: &str = "http://localhost:3000";

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root of the session cache (`<work_dir>/.devicedock`).
    pub work_dir: PathBuf,
    pub viewer_base_url: String,
    pub default_idle_timeout: Duration,
    pub worker_request_timeout: Duration,
    pub health_check_timeout: Duration,
    pub worker_url_timeout: Duration,
    pub worker_url_interval: Duration,
    pub device_connect_timeout: Duration,
    pub device_connect_interval: Duration,
    /// Delay before the single retry of a `503`.
    pub retry_delay: Duration,
    pub status_lookup_timeout: Duration,
    pub sync_interval: Duration,
}

impl ManagerConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            viewer_base_url: DEFAULT_VIEWER_BASE_URL.to_string(),
            default_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            worker_request_timeout: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            worker_url_timeout: Duration::from_secs(120),
            worker_url_interval: Duration::from_secs(2),
            device_connect_timeout: Duration::from_secs(30),
            device_connect_interval: Duration::from_secs(2),
            retry_delay: Duration::from_secs(2),
            status_lookup_timeout: Duration::from_secs(5),
            sync_interval: Duration::from_secs(60),
        }
    }

    pub fn with_viewer_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.viewer_base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Browser URL for live-watching a session.
    pub fn viewer_url(&self, workflow_run_id: &str, platform: &str) -> String {
        format!(
            "{}/tests/execute?workflowRunId={}&platform={}",
            self.viewer_base_url, workflow_run_id, platform
        )
    }
}

/// Viewer base URL: explicit value, else `LOCAL=true` for a local frontend,
/// else the hosted app.
pub fn resolve_viewer_base_url(explicit: Option<&str>) -> String {
    if let Some(url) = explicit.map(str::trim).filter(|url| !url.is_empty()) {
        return url.trim_end_matches('/').to_string();
    }
    let local = std::env::var("LOCAL").unwrap_or_default();
    if local.eq_ignore_ascii_case("true") {
        LOCAL_VIEWER_BASE_URL.to_string()
    } else {
        DEFAULT_VIEWER_BASE_URL.to_string()
    }
}
