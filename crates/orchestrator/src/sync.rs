//! Reconciliation of the local registry against the backend's list of
//! active sessions.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devicedock_protocol::backend::ActiveDeviceSession;
use devicedock_protocol::{DeviceSession, Platform};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::manager::DeviceSessionManager;
use crate::provisioning::{belongs_to, ws_url_to_http};

/// What one sync pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Provisional session ids replaced with the backend's id.
    pub reconciled: usize,
    pub pruned: usize,
    pub adopted: usize,
    /// Sessions tracked after the pass.
    pub total: usize,
}

impl DeviceSessionManager {
    /// Org id and user email of the API key. A successful validation always
    /// replaces the cached identity; a failed one falls back to the cache.
    pub(crate) async fn ensure_org_info(&self) -> Result<(String, String)> {
        match self.shared.backend.validate_api_key().await {
            Ok(identity) => {
                self.set_org_info(identity.org_id.clone(), identity.email.clone())
                    .await;
                Ok((identity.org_id, identity.email))
            }
            Err(err) => {
                let (org_id, user_email) = self.org_info().await;
                if org_id.is_empty() {
                    return Err(SessionError::backend("failed to validate API key", err));
                }
                debug!(
                    component = "sync",
                    event = "sync.identity_cached",
                    org_id = %org_id,
                    error = %err,
                );
                Ok((org_id, user_email))
            }
        }
    }

    /// Brings the registry in line with the backend: reconciles provisional
    /// ids, prunes sessions the backend no longer lists, adopts reachable
    /// sessions started elsewhere, then recompacts and persists.
    pub async fn sync_sessions(&self) -> Result<SyncReport> {
        self.load_cache_if_empty().await;
        let (org_id, user_email) = self.ensure_org_info().await?;

        let listed_at = Utc::now();
        let listing = self
            .shared
            .backend
            .active_device_sessions(&org_id)
            .await
            .map_err(|err| SessionError::backend("failed to fetch active sessions", err))?;

        let mut remote: Vec<ActiveDeviceSession> = listing
            .sessions
            .into_iter()
            .filter(|session| belongs_to(&user_email, session.user_email.as_deref()))
            .collect();
        remote.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let backend_ids: HashSet<&str> = remote.iter().map(|session| session.id.as_str()).collect();
        let ids_by_workflow: HashMap<&str, &str> = remote
            .iter()
            .filter_map(|session| {
                let workflow_run_id = session.workflow_run_id.as_deref()?;
                (!workflow_run_id.is_empty()).then_some((workflow_run_id, session.id.as_str()))
            })
            .collect();

        let known: HashSet<String> = {
            let registry = self.shared.registry.read().await;
            registry
                .sessions
                .values()
                .map(|session| {
                    ids_by_workflow
                        .get(session.workflow_run_id.as_str())
                        .map_or_else(|| session.session_id.clone(), |id| id.to_string())
                })
                .collect()
        };

        let mut adoptable = Vec::new();
        for candidate in remote.iter().filter(|candidate| !known.contains(&candidate.id)) {
            if let Some(session) = self.adopt_remote_session(candidate).await {
                adoptable.push(session);
            }
        }

        let mut report = SyncReport::default();
        {
            let mut registry = self.shared.registry.write().await;

            for session in registry.sessions.values_mut() {
                if let Some(id) = ids_by_workflow.get(session.workflow_run_id.as_str()) {
                    if session.session_id != *id {
                        session.session_id = id.to_string();
                        report.reconciled += 1;
                    }
                }
            }

            // Sessions registered after the listing was taken are not in it yet.
            let stale: Vec<usize> = registry
                .sessions
                .values()
                .filter(|session| {
                    !backend_ids.contains(session.session_id.as_str())
                        && session.started_at <= listed_at
                })
                .map(|session| session.index)
                .collect();
            for index in stale {
                if let Some(session) = registry.remove(index) {
                    report.pruned += 1;
                    info!(
                        component = "sync",
                        event = "sync.pruned",
                        index,
                        session_id = %session.session_id,
                        workflow_run_id = %session.workflow_run_id,
                    );
                }
            }
            registry.repair_active();

            for session in adoptable {
                let duplicate = registry.sessions.values().any(|existing| {
                    existing.session_id == session.session_id
                        || existing.workflow_run_id == session.workflow_run_id
                });
                if duplicate {
                    continue;
                }
                let session_id = session.session_id.clone();
                let index = registry.insert_new(session);
                report.adopted += 1;
                info!(
                    component = "sync",
                    event = "sync.adopted",
                    index,
                    session_id = %session_id,
                );
            }

            registry.repair_active();
            registry.recompact(Utc::now());
            report.total = registry.sessions.len();
            self.shared.store.save_logged(&registry.snapshot());
        }

        info!(
            component = "sync",
            event = "sync.completed",
            reconciled = report.reconciled,
            pruned = report.pruned,
            adopted = report.adopted,
            total = report.total,
        );
        Ok(report)
    }

    /// Builds a local record for a backend session started elsewhere, or
    /// `None` when its worker cannot be resolved or does not answer.
    async fn adopt_remote_session(&self, remote: &ActiveDeviceSession) -> Option<DeviceSession> {
        let workflow_run_id = remote
            .workflow_run_id
            .as_deref()
            .filter(|id| !id.is_empty())?;

        let connection = match self.shared.backend.worker_connection(workflow_run_id).await {
            Ok(connection) => connection,
            Err(err) => {
                debug!(
                    component = "sync",
                    event = "sync.adoption_skipped",
                    session_id = %remote.id,
                    reason = "worker lookup failed",
                    error = %err,
                );
                return None;
            }
        };
        let worker_base_url = connection
            .worker_ws_url
            .filter(|url| !url.is_empty())
            .map(|url| ws_url_to_http(&url))?;

        let Ok(platform) = Platform::from_str(&remote.platform) else {
            debug!(
                component = "sync",
                event = "sync.adoption_skipped",
                session_id = %remote.id,
                reason = "unsupported platform",
                platform = %remote.platform,
            );
            return None;
        };

        // The worker DNS entry can outlive the device, so a URL alone is not enough.
        if let Err(issue) = self.probe_health(&worker_base_url).await {
            debug!(
                component = "sync",
                event = "sync.adoption_skipped",
                session_id = %remote.id,
                reason = "worker unreachable",
                issue = %issue,
            );
            return None;
        }

        let now = Utc::now();
        let started_at = remote
            .started_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map_or(now, |parsed| parsed.with_timezone(&Utc));

        Some(DeviceSession {
            index: 0,
            session_id: remote.id.clone(),
            workflow_run_id: workflow_run_id.to_string(),
            viewer_url: self
                .shared
                .config
                .viewer_url(workflow_run_id, platform.as_str()),
            worker_base_url,
            platform,
            started_at,
            last_activity: now,
            idle_timeout: self.shared.config.default_idle_timeout,
        })
    }

    /// Runs [`sync_sessions`](Self::sync_sessions) every `interval` until
    /// `cancel` fires. Failures are logged and the loop keeps going.
    pub fn spawn_periodic_sync(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; callers sync on their own first.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = manager.sync_sessions().await {
                            warn!(
                                component = "sync",
                                event = "sync.failed",
                                error = %err,
                            );
                        }
                    }
                }
            }
            debug!(component = "sync", event = "sync.loop_stopped");
        })
    }
}
