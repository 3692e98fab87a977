//! In-memory session registry.
//!
//! Sessions are keyed by a small local index that stays contiguous from zero
//! after every mutating call. The registry owns the active pointer, the
//! next-index counter, screenshot anchors and one idle timer per session.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use devicedock_protocol::{DeviceSession, PersistedState};
use tokio::sync::mpsc;
use tracing::debug;

use crate::anchor::ScreenAnchor;
use crate::error::{Result, SessionError};
use crate::idle::{IdleExpiry, IdleTimers};

pub(crate) struct Registry {
    pub sessions: BTreeMap<usize, DeviceSession>,
    pub active: Option<usize>,
    pub next_index: usize,
    pub anchors: HashMap<usize, ScreenAnchor>,
    pub org_id: String,
    pub user_email: String,
    /// Set once the on-disk cache has been merged in.
    pub cache_loaded: bool,
    pub timers: IdleTimers,
}

impl Registry {
    pub fn new(expiry_tx: mpsc::UnboundedSender<IdleExpiry>) -> Self {
        Self {
            sessions: BTreeMap::new(),
            active: None,
            next_index: 0,
            anchors: HashMap::new(),
            org_id: String::new(),
            user_email: String::new(),
            cache_loaded: false,
            timers: IdleTimers::new(expiry_tx),
        }
    }

    pub fn lowest_index(&self) -> Option<usize> {
        self.sessions.keys().next().copied()
    }

    /// Registers a freshly provisioned session under the next index and
    /// starts its idle timer with the full timeout.
    pub fn insert_new(&mut self, mut session: DeviceSession) -> usize {
        let after_last = self.sessions.keys().next_back().map_or(0, |last| last + 1);
        let index = self.next_index.max(after_last);
        self.next_index = index + 1;

        session.index = index;
        let timeout = session.effective_idle_timeout();
        self.sessions.insert(index, session);

        if self.active.is_none() || self.sessions.len() == 1 {
            self.active = Some(index);
        }
        self.timers.schedule(index, timeout);
        index
    }

    /// Records activity on `index` and restarts its timer. Only that
    /// session's expiry moves.
    pub fn touch(&mut self, index: usize, now: DateTime<Utc>) -> bool {
        let Some(session) = self.sessions.get_mut(&index) else {
            return false;
        };
        session.last_activity = now;
        let timeout = session.effective_idle_timeout();
        self.timers.schedule(index, timeout);
        true
    }

    /// Counts a worker action against the session's current anchor.
    pub fn note_action(&mut self, index: usize) {
        if let Some(anchor) = self.anchors.get_mut(&index) {
            anchor.actions_used = anchor.actions_used.saturating_add(1);
        }
    }

    /// Drops a session locally: timer, anchor, and the active pointer moves
    /// to the lowest remaining index when it pointed here.
    pub fn remove(&mut self, index: usize) -> Option<DeviceSession> {
        self.timers.cancel(index);
        let session = self.sessions.remove(&index)?;
        self.anchors.remove(&index);
        if self.active == Some(index) {
            self.active = self.lowest_index();
        }
        Some(session)
    }

    pub fn remove_all(&mut self) -> Vec<DeviceSession> {
        self.timers.cancel_all();
        self.anchors.clear();
        self.active = None;
        std::mem::take(&mut self.sessions).into_values().collect()
    }

    /// Points `active` at a live session, choosing the lowest index if needed.
    pub fn repair_active(&mut self) {
        if let Some(active) = self.active {
            if !self.sessions.contains_key(&active) {
                self.active = None;
            }
        }
        if self.active.is_none() {
            self.active = self.lowest_index();
        }
    }

    /// Reassigns indices to `0..n` preserving order. Timers of moved sessions
    /// are replaced with ones carrying the remaining idle budget, never a
    /// fresh full timeout.
    pub fn recompact(&mut self, now: DateTime<Utc>) {
        if self.sessions.is_empty() {
            self.timers.cancel_all();
            self.next_index = 0;
            self.active = None;
            self.anchors.clear();
            return;
        }

        let already_compact = self
            .sessions
            .keys()
            .enumerate()
            .all(|(position, index)| position == *index);

        if already_compact {
            let sessions = &self.sessions;
            self.anchors.retain(|index, _| sessions.contains_key(index));
            for index in self.timers.indices() {
                if !self.sessions.contains_key(&index) {
                    self.timers.cancel(index);
                }
            }
            let missing: Vec<usize> = self
                .sessions
                .keys()
                .copied()
                .filter(|index| !self.timers.contains(*index))
                .collect();
            for index in missing {
                self.schedule_remaining(index, now);
            }
            if self.active.is_some_and(|active| !self.sessions.contains_key(&active)) {
                self.active = None;
            }
            self.next_index = self.sessions.len();
            return;
        }

        let old_to_new: HashMap<usize, usize> = self
            .sessions
            .keys()
            .enumerate()
            .map(|(new_index, old_index)| (*old_index, new_index))
            .collect();

        // Old timers go first so no stale index can fire after the remap.
        self.timers.cancel_all();

        let old_sessions = std::mem::take(&mut self.sessions);
        for (old_index, mut session) in old_sessions {
            let new_index = old_to_new[&old_index];
            session.index = new_index;
            self.sessions.insert(new_index, session);
        }

        let old_anchors = std::mem::take(&mut self.anchors);
        self.anchors = old_anchors
            .into_iter()
            .filter_map(|(old_index, anchor)| {
                old_to_new
                    .get(&old_index)
                    .map(|new_index| (*new_index, anchor))
            })
            .collect();

        self.active = self
            .active
            .and_then(|active| old_to_new.get(&active).copied());

        let indices: Vec<usize> = self.sessions.keys().copied().collect();
        for index in indices {
            self.schedule_remaining(index, now);
        }

        self.next_index = self.sessions.len();
        debug!(
            component = "registry",
            event = "registry.recompacted",
            session_count = self.sessions.len(),
            active = ?self.active,
        );
    }

    fn schedule_remaining(&mut self, index: usize, now: DateTime<Utc>) {
        if let Some(session) = self.sessions.get(&index) {
            let remaining = session.remaining_idle(now);
            self.timers.schedule(index, remaining);
        }
    }

    /// Resolves an explicit index, else the active session, else the only one.
    pub fn resolve(&self, index: Option<usize>) -> Result<&DeviceSession> {
        if let Some(index) = index {
            return self
                .sessions
                .get(&index)
                .ok_or(SessionError::NotFound { index });
        }

        if let Some(session) = self.active.and_then(|active| self.sessions.get(&active)) {
            return Ok(session);
        }

        match self.sessions.len() {
            0 => Err(SessionError::NoSessions),
            1 => self
                .sessions
                .values()
                .next()
                .ok_or(SessionError::NoSessions),
            count => Err(SessionError::Ambiguous { count }),
        }
    }

    pub fn snapshot(&self) -> PersistedState {
        let mut state = PersistedState {
            next_index: self.next_index,
            org_id: self.org_id.clone(),
            user_email: self.user_email.clone(),
            sessions: self.sessions.values().cloned().collect(),
            ..PersistedState::default()
        };
        state.set_active(self.active);
        state
    }

    /// Merges a persisted snapshot by index, then heals index gaps and
    /// installs a timer for every restored session.
    pub fn restore(&mut self, state: PersistedState, now: DateTime<Utc>) {
        self.active = state.active_index();
        self.next_index = state.next_index;
        if !state.org_id.is_empty() {
            self.org_id = state.org_id;
        }
        if !state.user_email.is_empty() {
            self.user_email = state.user_email;
        }
        for session in state.sessions {
            self.sessions.insert(session.index, session);
        }
        self.recompact(now);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use devicedock_protocol::Platform;

    use super::*;

    fn session(id: &str, last_activity: DateTime<Utc>, idle_timeout: Duration) -> DeviceSession {
        DeviceSession {
            index: 0,
            session_id: id.to_string(),
            workflow_run_id: format!("wf-{id}"),
            worker_base_url: format!("http://{id}.worker"),
            viewer_url: String::new(),
            platform: Platform::Android,
            started_at: last_activity,
            last_activity,
            idle_timeout,
        }
    }

    fn registry() -> (Registry, mpsc::UnboundedReceiver<IdleExpiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Registry::new(tx), rx)
    }

    fn assert_compact(registry: &Registry) {
        let indices: Vec<usize> = registry.sessions.keys().copied().collect();
        let expected: Vec<usize> = (0..registry.sessions.len()).collect();
        assert_eq!(indices, expected);
        for (index, session) in &registry.sessions {
            assert_eq!(session.index, *index);
        }
        assert_eq!(registry.timers.indices(), expected);
        assert_eq!(registry.next_index, registry.sessions.len());
    }

    #[tokio::test]
    async fn first_session_becomes_active() {
        let (mut registry, _rx) = registry();
        let now = Utc::now();
        let a = registry.insert_new(session("a", now, Duration::from_secs(60)));
        let b = registry.insert_new(session("b", now, Duration::from_secs(60)));

        assert_eq!((a, b), (0, 1));
        assert_eq!(registry.active, Some(0));
        assert_eq!(registry.next_index, 2);
        assert_compact(&registry);
    }

    #[tokio::test]
    async fn stopping_active_head_compacts_and_moves_active() {
        let (mut registry, _rx) = registry();
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            registry.insert_new(session(id, now, Duration::from_secs(60)));
        }

        let removed = registry.remove(0).expect("session 0");
        assert_eq!(removed.session_id, "a");
        assert_eq!(registry.active, Some(1));
        registry.recompact(Utc::now());

        assert_compact(&registry);
        assert_eq!(registry.sessions[&0].session_id, "b");
        assert_eq!(registry.sessions[&1].session_id, "c");
        assert_eq!(registry.active, Some(0));
    }

    #[tokio::test]
    async fn anchors_follow_their_session_through_recompaction() {
        let (mut registry, _rx) = registry();
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            registry.insert_new(session(id, now, Duration::from_secs(60)));
        }
        registry
            .anchors
            .insert(2, ScreenAnchor::capture(2, Some(b"c-screen"), now));
        registry
            .anchors
            .insert(1, ScreenAnchor::capture(1, Some(b"b-screen"), now));

        registry.remove(1);
        registry.recompact(Utc::now());

        assert_eq!(registry.anchors.len(), 1);
        assert_eq!(registry.anchors[&1].image, b"c-screen");
    }

    #[tokio::test]
    async fn recompaction_preserves_remaining_idle_budget() {
        let (mut registry, mut rx) = registry();
        let now = Utc::now();
        registry.insert_new(session("a", now, Duration::from_secs(60)));
        // 60s window with roughly 70ms of it left.
        let spent = now - chrono::Duration::milliseconds(60_000 - 70);
        registry.insert_new(session("b", spent, Duration::from_secs(60)));

        registry.remove(0);
        registry.recompact(Utc::now());
        assert_compact(&registry);

        let expiry = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("remaining budget should fire well before a fresh timeout")
            .expect("expiry");
        assert_eq!(expiry.index, 0);
        assert!(registry.timers.take_if_current(expiry));
    }

    #[tokio::test]
    async fn touch_only_moves_one_timer() {
        let (mut registry, mut rx) = registry();
        let now = Utc::now();
        registry.insert_new(session("a", now, Duration::from_millis(60)));
        registry.insert_new(session("b", now, Duration::from_millis(60)));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.touch(1, Utc::now()));
        assert!(!registry.touch(7, Utc::now()));

        let first = rx.recv().await.expect("first expiry");
        assert_eq!(first.index, 0);
        assert!(registry.timers.take_if_current(first));
        assert!(registry.timers.contains(1));
    }

    #[tokio::test]
    async fn emptying_resets_counters() {
        let (mut registry, _rx) = registry();
        let now = Utc::now();
        registry.insert_new(session("a", now, Duration::from_secs(60)));
        registry
            .anchors
            .insert(0, ScreenAnchor::capture(0, None, now));

        let removed = registry.remove_all();
        assert_eq!(removed.len(), 1);
        registry.recompact(Utc::now());

        assert_eq!(registry.next_index, 0);
        assert_eq!(registry.active, None);
        assert!(registry.anchors.is_empty());
        assert_eq!(registry.timers.len(), 0);
    }

    #[tokio::test]
    async fn resolve_rules() {
        let (mut registry, _rx) = registry();
        assert!(matches!(registry.resolve(None), Err(SessionError::NoSessions)));

        let now = Utc::now();
        registry.insert_new(session("a", now, Duration::from_secs(60)));
        registry.active = None;
        assert_eq!(registry.resolve(None).expect("single").session_id, "a");

        registry.insert_new(session("b", now, Duration::from_secs(60)));
        registry.active = None;
        assert!(matches!(
            registry.resolve(None),
            Err(SessionError::Ambiguous { count: 2 })
        ));
        assert!(matches!(
            registry.resolve(Some(5)),
            Err(SessionError::NotFound { index: 5 })
        ));

        registry.active = Some(1);
        assert_eq!(registry.resolve(None).expect("active").session_id, "b");
    }

    #[tokio::test]
    async fn restore_heals_gaps_and_arms_timers() {
        let (mut registry, _rx) = registry();
        let now = Utc::now();
        let mut a = session("a", now, Duration::from_secs(60));
        a.index = 2;
        let mut b = session("b", now, Duration::from_secs(60));
        b.index = 5;

        let mut state = PersistedState {
            next_index: 6,
            org_id: "org-1".into(),
            user_email: "dev@example.com".into(),
            sessions: vec![a, b],
            ..PersistedState::default()
        };
        state.set_active(Some(5));

        registry.restore(state, now);

        assert_compact(&registry);
        assert_eq!(registry.active, Some(1));
        assert_eq!(registry.org_id, "org-1");
        assert_eq!(registry.sessions[&1].session_id, "b");
    }
}
