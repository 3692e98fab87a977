//! Core types shared across the protocol

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Idle window applied when a session carries no usable timeout of its own.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Smallest timer ever scheduled for a session whose budget is already spent.
pub const MIN_IDLE_REMAINING: Duration = Duration::from_millis(1);

/// Device platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a platform string is neither `ios` nor `android`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPlatform(pub String);

impl fmt::Display for UnknownPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "platform must be 'ios' or 'android', got '{}'",
            self.0
        )
    }
}

impl std::error::Error for UnknownPlatform {}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            _ => Err(UnknownPlatform(s.to_string())),
        }
    }
}

/// One live device allocation, as tracked locally and persisted to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSession {
    #[serde(default)]
    pub index: usize,
    /// Backend session id. Seeded with the workflow run id until sync finds the real one.
    pub session_id: String,
    pub workflow_run_id: String,
    pub worker_base_url: String,
    #[serde(default)]
    pub viewer_url: String,
    pub platform: Platform,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(with = "duration_nanos", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
}

fn default_idle_timeout() -> Duration {
    DEFAULT_IDLE_TIMEOUT
}

impl DeviceSession {
    /// True while `session_id` still holds the workflow run id placeholder.
    pub fn has_provisional_id(&self) -> bool {
        self.session_id.is_empty() || self.session_id == self.workflow_run_id
    }

    /// Idle timeout with the zero value mapped to the default window.
    pub fn effective_idle_timeout(&self) -> Duration {
        if self.idle_timeout.is_zero() {
            DEFAULT_IDLE_TIMEOUT
        } else {
            self.idle_timeout
        }
    }

    /// Remaining idle budget at `now`: `last_activity + idle_timeout - now`,
    /// floored at [`MIN_IDLE_REMAINING`].
    pub fn remaining_idle(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = now
            .signed_duration_since(self.last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO);
        match self.effective_idle_timeout().checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => MIN_IDLE_REMAINING,
        }
    }
}

/// On-disk projection of the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Active session index, `-1` when none.
    #[serde(default = "no_active")]
    pub active: i64,
    #[serde(default)]
    pub next_index: usize,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub user_email: String,
    #[serde(default)]
    pub sessions: Vec<DeviceSession>,
}

fn no_active() -> i64 {
    -1
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            active: -1,
            next_index: 0,
            org_id: String::new(),
            user_email: String::new(),
            sessions: Vec::new(),
        }
    }
}

impl PersistedState {
    pub fn active_index(&self) -> Option<usize> {
        usize::try_from(self.active).ok()
    }

    pub fn set_active(&mut self, index: Option<usize>) {
        self.active = index.map_or(-1, |i| i as i64);
    }
}

/// Serialises a [`Duration`] as integer nanoseconds.
pub mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos.max(0) as u64))
    }
}
