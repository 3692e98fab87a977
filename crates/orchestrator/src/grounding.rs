//! Target resolution: natural-language element descriptions to device
//! pixel coordinates.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use devicedock_protocol::backend::GroundElementRequest;
use devicedock_protocol::worker::{ResolveTargetRequest, ResolveTargetResponse};
use devicedock_protocol::DeviceSession;
use reqwest::Method;
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::fallback::{run_in_order, Disposition};
use crate::manager::DeviceSessionManager;

/// Screen size assumed when a screenshot has no readable PNG header.
pub const FALLBACK_SCREEN_SIZE: (u32, u32) = (1080, 1920);

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroundingSource {
    Worker,
    Backend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub x: i32,
    pub y: i32,
    pub source: GroundingSource,
}

/// Width and height from the IHDR chunk of a PNG.
pub fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 24 || bytes[..8] != PNG_SIGNATURE || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
    (width > 0 && height > 0).then_some((width, height))
}

/// Worker answers that mean "ask someone else", as opposed to a real miss.
fn worker_unavailable(err: &SessionError) -> bool {
    match err {
        SessionError::Worker(worker) => worker.status >= 500 || worker.is_unsupported(),
        SessionError::InvalidResponse(_) => true,
        _ => false,
    }
}

impl DeviceSessionManager {
    /// Resolves `target` on the session's current screen. The worker is
    /// asked first; the backend vision service is used only when the
    /// worker cannot answer. A worker miss is final.
    pub async fn resolve_target(&self, index: Option<usize>, target: &str) -> Result<ResolvedTarget> {
        let target = target.trim();
        if target.is_empty() {
            return Err(SessionError::Validation(
                "target description is required".to_string(),
            ));
        }
        let session = self.resolve_session(index).await?;

        let outcome = run_in_order(
            &[GroundingSource::Worker, GroundingSource::Backend],
            |source| self.ground_with(source, &session, target),
            |source, err| {
                if source == GroundingSource::Worker && worker_unavailable(err) {
                    warn!(
                        component = "grounding",
                        event = "grounding.fallback",
                        index = session.index,
                        error = %err,
                    );
                    Disposition::TryNext
                } else {
                    Disposition::Stop
                }
            },
        )
        .await;

        match outcome {
            Ok(resolved) => {
                debug!(
                    component = "grounding",
                    event = "grounding.resolved",
                    index = session.index,
                    source = ?resolved.source,
                    x = resolved.x,
                    y = resolved.y,
                );
                Ok(resolved)
            }
            Err(mut attempts) => Err(attempts.pop().map_or_else(
                || SessionError::grounding_miss(target, None),
                |(_, err)| err,
            )),
        }
    }

    async fn ground_with(
        &self,
        source: GroundingSource,
        session: &DeviceSession,
        target: &str,
    ) -> Result<ResolvedTarget> {
        match source {
            GroundingSource::Worker => self.ground_on_worker(session, target).await,
            GroundingSource::Backend => self.ground_on_backend(session, target).await,
        }
    }

    async fn ground_on_worker(&self, session: &DeviceSession, target: &str) -> Result<ResolvedTarget> {
        let request = ResolveTargetRequest {
            target: target.to_string(),
            session_id: session.session_id.clone(),
        };
        let body = serde_json::to_value(&request)
            .map_err(|err| SessionError::InvalidResponse(err.to_string()))?;
        let bytes = self
            .request_for_session(session, Method::POST, "/resolve_target", Some(&body))
            .await?;
        let response: ResolveTargetResponse = serde_json::from_slice(&bytes).map_err(|err| {
            SessionError::InvalidResponse(format!(
                "worker resolve_target returned invalid JSON: {err}"
            ))
        })?;
        if !response.found {
            return Err(SessionError::grounding_miss(target, response.error));
        }
        Ok(ResolvedTarget {
            x: response.x,
            y: response.y,
            source: GroundingSource::Worker,
        })
    }

    async fn ground_on_backend(&self, session: &DeviceSession, target: &str) -> Result<ResolvedTarget> {
        let screenshot = self
            .request_for_session(session, Method::GET, "/screenshot", None)
            .await?;
        let (width, height) = png_dimensions(&screenshot).unwrap_or(FALLBACK_SCREEN_SIZE);
        let request = GroundElementRequest {
            target: target.to_string(),
            image_base64: STANDARD.encode(&screenshot),
            width,
            height,
            platform: session.platform.as_str().to_string(),
            session_id: session.session_id.clone(),
        };
        let response = self
            .shared
            .backend
            .ground_element(&request)
            .await
            .map_err(|err| SessionError::backend("grounding request failed", err))?;
        if !response.found {
            return Err(SessionError::grounding_miss(target, response.error));
        }
        Ok(ResolvedTarget {
            x: response.x,
            y: response.y,
            source: GroundingSource::Backend,
        })
    }
}
