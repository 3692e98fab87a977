//! Local session cache.
//!
//! `<work_dir>/.devicedock/device-sessions.json` holds the registry snapshot.
//! It is a crash-recovery cache; the backend's session list wins on sync.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use devicedock_protocol::{DeviceSession, PersistedState};
use tracing::{info, warn};

use crate::error::{Result, SessionError};

pub const CACHE_DIR_NAME: &str = ".devicedock";
const STATE_FILE: &str = "device-sessions.json";
const LEGACY_STATE_FILE: &str = "device-session.json";

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            dir: work_dir.join(CACHE_DIR_NAME),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn legacy_path(&self) -> PathBuf {
        self.dir.join(LEGACY_STATE_FILE)
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let path = self.state_path();
        write_json_atomic(&path, state).map_err(|source| SessionError::Persistence { path, source })
    }

    /// Saves and logs on failure; the cache never fails a registry operation.
    pub fn save_logged(&self, state: &PersistedState) {
        if let Err(err) = self.save(state) {
            warn!(
                component = "persistence",
                event = "persistence.save_failed",
                error = %err,
            );
        }
    }

    /// Reads the cache, migrating a legacy single-session file on first sight.
    /// Unreadable or unparseable files count as no cache.
    pub fn load(&self) -> Option<PersistedState> {
        let path = self.state_path();
        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<PersistedState>(&bytes) {
                Ok(state) => return Some(state),
                Err(err) => warn!(
                    component = "persistence",
                    event = "persistence.parse_failed",
                    path = %path.display(),
                    error = %err,
                ),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                component = "persistence",
                event = "persistence.read_failed",
                path = %path.display(),
                error = %err,
            ),
        }

        self.migrate_legacy()
    }

    fn migrate_legacy(&self) -> Option<PersistedState> {
        let legacy_path = self.legacy_path();
        let bytes = fs::read(&legacy_path).ok()?;
        let mut session: DeviceSession = serde_json::from_slice(&bytes).ok()?;
        session.index = 0;

        let mut state = PersistedState {
            next_index: 1,
            sessions: vec![session],
            ..PersistedState::default()
        };
        state.set_active(Some(0));

        self.save_logged(&state);
        if let Err(err) = fs::remove_file(&legacy_path) {
            warn!(
                component = "persistence",
                event = "persistence.legacy_remove_failed",
                path = %legacy_path.display(),
                error = %err,
            );
        }
        info!(
            component = "persistence",
            event = "persistence.legacy_migrated",
            path = %legacy_path.display(),
        );
        Some(state)
    }
}

fn write_json_atomic(path: &Path, state: &PersistedState) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(state).map_err(io::Error::other)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path)
}
