//! `DeviceSessionManager`: the shared handle over the session registry.
//!
//! All registry state sits behind one `RwLock`. Writers take it for short,
//! synchronous critical sections only; network calls (provisioning polls,
//! worker RPCs, backend cancels) always run with the lock released, so
//! actions against different devices never queue behind each other.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use chrono::Utc;
use devicedock_backend::BackendClient;
use devicedock_protocol::DeviceSession;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::anchor::{anchor_image_path, write_png_atomic, ScreenAnchor};
use crate::config::ManagerConfig;
use crate::error::{Result, SessionError};
use crate::idle::IdleExpiry;
use crate::persistence::SessionStore;
use crate::state::Registry;

pub(crate) struct Shared {
    pub registry: RwLock<Registry>,
    pub backend: BackendClient,
    pub http: reqwest::Client,
    pub config: ManagerConfig,
    pub store: SessionStore,
}

/// Cheap to clone; every clone drives the same registry.
#[derive(Clone)]
pub struct DeviceSessionManager {
    pub(crate) shared: Arc<Shared>,
}

impl DeviceSessionManager {
    /// Builds a manager and starts its idle reaper. Must be called from
    /// within a Tokio runtime.
    pub fn new(config: ManagerConfig, backend: BackendClient) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.worker_request_timeout)
            .build()
            .map_err(SessionError::HttpClient)?;
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let store = SessionStore::new(&config.work_dir);

        let shared = Arc::new(Shared {
            registry: RwLock::new(Registry::new(expiry_tx)),
            backend,
            http,
            config,
            store,
        });
        tokio::spawn(run_idle_reaper(Arc::downgrade(&shared), expiry_rx));

        Ok(Self { shared })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> &BackendClient {
        &self.shared.backend
    }

    pub fn store(&self) -> &SessionStore {
        &self.shared.store
    }

    /// Stops one session. The session is always removed locally; a failed
    /// backend cancel is still reported.
    pub async fn stop_session(&self, index: usize) -> Result<()> {
        let session = {
            let mut registry = self.shared.registry.write().await;
            let session = registry
                .remove(index)
                .ok_or(SessionError::NotFound { index })?;
            registry.recompact(Utc::now());
            self.shared.store.save_logged(&registry.snapshot());
            session
        };
        info!(
            component = "registry",
            event = "session.stopped",
            index,
            workflow_run_id = %session.workflow_run_id,
        );
        self.cancel_remote(&session).await
    }

    /// Stops every session, attempting every remote cancel. Returns the
    /// first cancel failure.
    pub async fn stop_all_sessions(&self) -> Result<()> {
        let sessions = {
            let mut registry = self.shared.registry.write().await;
            let sessions = registry.remove_all();
            registry.recompact(Utc::now());
            self.shared.store.save_logged(&registry.snapshot());
            sessions
        };
        info!(
            component = "registry",
            event = "session.stopped_all",
            count = sessions.len(),
        );

        let mut first_error = None;
        for session in &sessions {
            if let Err(err) = self.cancel_remote(session).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub(crate) async fn cancel_remote(&self, session: &DeviceSession) -> Result<()> {
        match self
            .shared
            .backend
            .cancel_device(&session.workflow_run_id)
            .await
        {
            Ok(response) => {
                debug!(
                    component = "registry",
                    event = "session.remote_cancelled",
                    workflow_run_id = %session.workflow_run_id,
                    message = response.message.as_deref().unwrap_or_default(),
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    component = "registry",
                    event = "session.remote_cancel_failed",
                    workflow_run_id = %session.workflow_run_id,
                    error = %err,
                );
                Err(SessionError::backend("backend cancel failed", err))
            }
        }
    }

    pub async fn set_active(&self, index: usize) -> Result<()> {
        let mut registry = self.shared.registry.write().await;
        if !registry.sessions.contains_key(&index) {
            return Err(SessionError::NotFound { index });
        }
        registry.active = Some(index);
        self.shared.store.save_logged(&registry.snapshot());
        Ok(())
    }

    /// Sessions ordered by index.
    pub async fn list_sessions(&self) -> Vec<DeviceSession> {
        let registry = self.shared.registry.read().await;
        registry.sessions.values().cloned().collect()
    }

    pub async fn get_session(&self, index: usize) -> Option<DeviceSession> {
        let registry = self.shared.registry.read().await;
        registry.sessions.get(&index).cloned()
    }

    pub async fn get_active(&self) -> Option<DeviceSession> {
        let registry = self.shared.registry.read().await;
        registry
            .active
            .and_then(|active| registry.sessions.get(&active))
            .cloned()
    }

    pub async fn active_index(&self) -> Option<usize> {
        self.shared.registry.read().await.active
    }

    pub async fn session_count(&self) -> usize {
        self.shared.registry.read().await.sessions.len()
    }

    /// `Some(index)` must exist. `None` means the active session, or the
    /// only session when exactly one exists.
    pub async fn resolve_session(&self, index: Option<usize>) -> Result<DeviceSession> {
        let registry = self.shared.registry.read().await;
        registry.resolve(index).cloned()
    }

    /// Marks activity on a session and restarts its idle window. No-op for
    /// an unknown index.
    pub async fn reset_idle_timer(&self, index: usize) {
        let mut registry = self.shared.registry.write().await;
        if registry.touch(index, Utc::now()) {
            self.shared.store.save_logged(&registry.snapshot());
        }
    }

    /// Activity from a worker action. Looks the session up by workflow run
    /// id, since its index may have moved since it was resolved.
    pub(crate) async fn record_activity(&self, session: &DeviceSession) {
        let mut registry = self.shared.registry.write().await;
        let index = registry
            .sessions
            .values()
            .find(|candidate| candidate.workflow_run_id == session.workflow_run_id)
            .map(|candidate| candidate.index);
        if let Some(index) = index {
            registry.touch(index, Utc::now());
            registry.note_action(index);
            self.shared.store.save_logged(&registry.snapshot());
        }
    }

    pub async fn set_org_info(&self, org_id: impl Into<String>, user_email: impl Into<String>) {
        let mut registry = self.shared.registry.write().await;
        registry.org_id = org_id.into();
        registry.user_email = user_email.into();
    }

    pub async fn org_info(&self) -> (String, String) {
        let registry = self.shared.registry.read().await;
        (registry.org_id.clone(), registry.user_email.clone())
    }

    /// Cache-first load for callers that cannot reach the backend. Returns
    /// the active session, if any.
    pub async fn load_persisted_session(&self) -> Option<DeviceSession> {
        let mut registry = self.shared.registry.write().await;
        if let Some(session) = registry.active.and_then(|i| registry.sessions.get(&i)) {
            return Some(session.clone());
        }

        self.load_cache_locked(&mut registry);
        registry
            .active
            .and_then(|active| registry.sessions.get(&active))
            .cloned()
    }

    /// Merges the on-disk cache if nothing is tracked yet.
    pub(crate) async fn load_cache_if_empty(&self) {
        let mut registry = self.shared.registry.write().await;
        if registry.sessions.is_empty() {
            self.load_cache_locked(&mut registry);
        }
    }

    fn load_cache_locked(&self, registry: &mut Registry) {
        registry.cache_loaded = true;
        let Some(state) = self.shared.store.load() else {
            return;
        };
        let count = state.sessions.len();
        registry.restore(state, Utc::now());
        info!(
            component = "persistence",
            event = "persistence.cache_loaded",
            session_count = count,
            active = ?registry.active,
        );
    }

    /// Records a fresh screenshot anchor for a session and returns its
    /// token, or `None` when the index is unknown.
    pub async fn mark_screenshot_anchor(&self, index: usize, image: Option<&[u8]>) -> Option<String> {
        let mut registry = self.shared.registry.write().await;
        if !registry.sessions.contains_key(&index) {
            return None;
        }
        let anchor = ScreenAnchor::capture(index, image, Utc::now());
        let token = anchor.token.clone();
        registry.anchors.insert(index, anchor);
        Some(token)
    }

    pub async fn screen_anchor(&self, index: usize) -> Option<ScreenAnchor> {
        let registry = self.shared.registry.read().await;
        registry.anchors.get(&index).cloned()
    }

    /// Writes the anchored screenshot to disk. The token must match the
    /// session's latest anchor.
    pub async fn persist_anchor_image(&self, index: usize, token: &str, image: &[u8]) -> Result<PathBuf> {
        if image.is_empty() {
            return Err(SessionError::Anchor(
                "cannot persist empty anchor image".to_string(),
            ));
        }
        let token = token.trim();
        if token.is_empty() {
            return Err(SessionError::Anchor(
                "screen token is required to persist anchor image".to_string(),
            ));
        }

        {
            let registry = self.shared.registry.read().await;
            check_anchor_token(registry.anchors.get(&index), token)?;
        }

        let path = anchor_image_path(self.shared.store.dir(), index, token);
        write_png_atomic(&path, image).map_err(|source| SessionError::Persistence {
            path: path.clone(),
            source,
        })?;

        let mut registry = self.shared.registry.write().await;
        if let Some(anchor) = registry.anchors.get_mut(&index) {
            if anchor.token == token {
                anchor.image_path = Some(path.clone());
            }
        }
        Ok(path)
    }

    /// Anchored screenshot bytes: from memory first, else from the
    /// persisted file.
    pub async fn load_anchor_image(&self, index: usize, token: &str) -> Result<(Vec<u8>, Option<PathBuf>)> {
        let token = token.trim();
        if token.is_empty() {
            return Err(SessionError::Anchor("screen token is required".to_string()));
        }

        let (image, path) = {
            let registry = self.shared.registry.read().await;
            let anchor = check_anchor_token(registry.anchors.get(&index), token)?;
            (anchor.image.clone(), anchor.image_path.clone())
        };

        if !image.is_empty() {
            return Ok((image, path));
        }
        let Some(path) = path else {
            return Err(SessionError::Anchor(
                "no image data available for anchor".to_string(),
            ));
        };
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| SessionError::Persistence {
                path: path.clone(),
                source,
            })?;
        Ok((bytes, Some(path)))
    }

    #[cfg(test)]
    pub(crate) async fn timer_indices(&self) -> Vec<usize> {
        self.shared.registry.read().await.timers.indices()
    }
}

fn check_anchor_token<'a>(anchor: Option<&'a ScreenAnchor>, token: &str) -> Result<&'a ScreenAnchor> {
    let anchor = anchor
        .filter(|anchor| !anchor.token.is_empty())
        .ok_or_else(|| SessionError::Anchor("no screenshot anchor found for session".to_string()))?;
    if anchor.token != token {
        return Err(SessionError::Anchor(
            "screen token does not match the latest screenshot for this session".to_string(),
        ));
    }
    Ok(anchor)
}

async fn run_idle_reaper(shared: Weak<Shared>, mut expiry_rx: mpsc::UnboundedReceiver<IdleExpiry>) {
    while let Some(expiry) = expiry_rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let manager = DeviceSessionManager { shared };
        manager.expire_idle_session(expiry).await;
    }
}

impl DeviceSessionManager {
    async fn expire_idle_session(&self, expiry: IdleExpiry) {
        let session = {
            let mut registry = self.shared.registry.write().await;
            if !registry.timers.take_if_current(expiry) {
                return;
            }
            let Some(session) = registry.remove(expiry.index) else {
                return;
            };
            registry.recompact(Utc::now());
            self.shared.store.save_logged(&registry.snapshot());
            session
        };

        info!(
            component = "idle",
            event = "session.idle_expired",
            index = expiry.index,
            workflow_run_id = %session.workflow_run_id,
            idle_timeout_secs = session.effective_idle_timeout().as_secs(),
        );
        let _ = self.cancel_remote(&session).await;
    }
}
