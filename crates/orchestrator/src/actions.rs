//! Typed device actions on top of the worker gateway.

use devicedock_protocol::worker::{
    ActionResponse, DragRequest, InputRequest, InstallRequest, InstallResponse, LaunchRequest,
    OpenUrlRequest, SwipeDirection, SwipeRequest, TapRequest,
};
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::grounding::ResolvedTarget;
use crate::manager::DeviceSessionManager;

pub const DEFAULT_LONG_PRESS_MS: u64 = 1500;
pub const DEFAULT_SWIPE_MS: u64 = 500;

/// A captured screen plus the anchor token that names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub index: usize,
    /// Empty when the session went away while the capture was in flight.
    pub token: String,
    pub image: Vec<u8>,
}

/// Acknowledgement of the app-lifecycle endpoints, where a missing
/// `success` field is itself a failure.
#[derive(Debug, Deserialize)]
struct Acknowledgement {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn ensure_succeeded(bytes: &[u8], action: &str) -> Result<()> {
    let ack: Acknowledgement = serde_json::from_slice(bytes).map_err(|err| {
        SessionError::InvalidResponse(format!("failed to parse worker {action} response: {err}"))
    })?;
    if let Some(reported) = ack.action.as_deref().filter(|reported| !reported.is_empty()) {
        if reported != action {
            return Err(SessionError::InvalidResponse(format!(
                "worker returned action={reported:?}, expected {action:?}"
            )));
        }
    }
    match ack.success {
        Some(true) => Ok(()),
        Some(false) => {
            let reason = ack
                .error
                .map(|err| err.trim().to_string())
                .filter(|err| !err.is_empty())
                .unwrap_or_else(|| "unknown error".to_string());
            Err(SessionError::InvalidResponse(format!(
                "worker {action} failed: {reason}"
            )))
        }
        None => Err(SessionError::InvalidResponse(format!(
            "worker {action} response missing success field"
        ))),
    }
}

/// Gesture endpoints reply loosely; an unreadable body after a 2xx still
/// counts as done.
fn gesture_response(bytes: &[u8]) -> ActionResponse {
    serde_json::from_slice(bytes).unwrap_or(ActionResponse {
        success: true,
        action: None,
        error: None,
    })
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SessionError::Validation(format!("{what} is required")));
    }
    Ok(())
}

impl DeviceSessionManager {
    async fn post_action<T: Serialize>(&self, index: Option<usize>, path: &str, request: &T) -> Result<Vec<u8>> {
        let body = serde_json::to_value(request)
            .map_err(|err| SessionError::Validation(format!("invalid {path} request: {err}")))?;
        self.worker_request(index, Method::POST, path, Some(body))
            .await
    }

    pub async fn tap(&self, index: Option<usize>, x: i32, y: i32) -> Result<ActionResponse> {
        let request = TapRequest {
            x,
            y,
            duration_ms: None,
        };
        let bytes = self.post_action(index, "/tap", &request).await?;
        Ok(gesture_response(&bytes))
    }

    pub async fn double_tap(&self, index: Option<usize>, x: i32, y: i32) -> Result<ActionResponse> {
        let request = TapRequest {
            x,
            y,
            duration_ms: None,
        };
        let bytes = self.post_action(index, "/double_tap", &request).await?;
        Ok(gesture_response(&bytes))
    }

    pub async fn long_press(
        &self,
        index: Option<usize>,
        x: i32,
        y: i32,
        duration_ms: Option<u64>,
    ) -> Result<ActionResponse> {
        let request = TapRequest {
            x,
            y,
            duration_ms: Some(duration_ms.filter(|ms| *ms > 0).unwrap_or(DEFAULT_LONG_PRESS_MS)),
        };
        let bytes = self.post_action(index, "/longpress", &request).await?;
        Ok(gesture_response(&bytes))
    }

    pub async fn type_text(
        &self,
        index: Option<usize>,
        x: i32,
        y: i32,
        text: &str,
        clear_first: bool,
    ) -> Result<ActionResponse> {
        if text.is_empty() {
            return Err(SessionError::Validation("text is required".to_string()));
        }
        let request = InputRequest {
            x,
            y,
            text: text.to_string(),
            clear_first,
        };
        let bytes = self.post_action(index, "/input", &request).await?;
        Ok(gesture_response(&bytes))
    }

    pub async fn swipe(
        &self,
        index: Option<usize>,
        x: i32,
        y: i32,
        direction: SwipeDirection,
        duration_ms: Option<u64>,
    ) -> Result<ActionResponse> {
        let request = SwipeRequest {
            x,
            y,
            direction,
            duration_ms: duration_ms.filter(|ms| *ms > 0).unwrap_or(DEFAULT_SWIPE_MS),
        };
        let bytes = self.post_action(index, "/swipe", &request).await?;
        Ok(gesture_response(&bytes))
    }

    pub async fn drag(&self, index: Option<usize>, from: (i32, i32), to: (i32, i32)) -> Result<ActionResponse> {
        let request = DragRequest {
            start_x: from.0,
            start_y: from.1,
            end_x: to.0,
            end_y: to.1,
        };
        let bytes = self.post_action(index, "/drag", &request).await?;
        Ok(gesture_response(&bytes))
    }

    /// Installs an app build from a URL and returns what the worker reported.
    pub async fn install_app(
        &self,
        index: Option<usize>,
        app_url: &str,
        bundle_id: Option<&str>,
    ) -> Result<InstallResponse> {
        require(app_url, "app_url")?;
        let request = InstallRequest {
            app_url: app_url.trim().to_string(),
            bundle_id: bundle_id
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
        };
        let bytes = self.post_action(index, "/install", &request).await?;
        ensure_succeeded(&bytes, "install")?;
        serde_json::from_slice(&bytes).map_err(|err| {
            SessionError::InvalidResponse(format!("failed to parse worker install response: {err}"))
        })
    }

    pub async fn launch_app(&self, index: Option<usize>, bundle_id: &str) -> Result<()> {
        require(bundle_id, "bundle_id")?;
        let request = LaunchRequest {
            bundle_id: bundle_id.trim().to_string(),
        };
        let bytes = self.post_action(index, "/launch", &request).await?;
        ensure_succeeded(&bytes, "launch")
    }

    /// Opens a URL or deep link on the device. `Ok(false)` when the worker
    /// build has no `/open_url` endpoint.
    pub async fn open_url(&self, index: Option<usize>, url: &str) -> Result<bool> {
        require(url, "url")?;
        let request = OpenUrlRequest {
            url: url.trim().to_string(),
        };
        match self.post_action(index, "/open_url", &request).await {
            Ok(bytes) => ensure_succeeded(&bytes, "open_url").map(|()| true),
            Err(err)
                if err
                    .worker_http()
                    .is_some_and(|worker| worker.status == 404 && worker.path == "/open_url") =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Captures the current screen and records it as the session's anchor.
    pub async fn screenshot(&self, index: Option<usize>) -> Result<Screenshot> {
        let session = self.resolve_session(index).await?;
        let image = self
            .request_for_session(&session, Method::GET, "/screenshot", None)
            .await?;
        let index = self
            .list_sessions()
            .await
            .into_iter()
            .find(|candidate| candidate.workflow_run_id == session.workflow_run_id)
            .map_or(session.index, |current| current.index);
        let token = self
            .mark_screenshot_anchor(index, Some(&image))
            .await
            .unwrap_or_default();
        Ok(Screenshot {
            index,
            token,
            image,
        })
    }

    /// Resolves `target` on screen, then taps it.
    pub async fn tap_target(&self, index: Option<usize>, target: &str) -> Result<ResolvedTarget> {
        let session = self.resolve_session(index).await?;
        let resolved = self.resolve_target(Some(session.index), target).await?;
        self.tap(Some(session.index), resolved.x, resolved.y).await?;
        Ok(resolved)
    }
}
