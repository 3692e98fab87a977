//! Error taxonomy for session orchestration.

use std::fmt;
use std::path::PathBuf;

use devicedock_backend::BackendError;
use thiserror::Error;

/// Non-success HTTP answer from a worker (or from the backend proxy standing
/// in for it). Callers match on `status` and `path` to tell an unsupported
/// endpoint apart from a broken device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHttpError {
    pub status: u16,
    pub path: String,
    pub body: String,
    /// Remediation appended to the message.
    pub hint: Option<String>,
}

impl WorkerHttpError {
    pub fn new(status: u16, path: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            path: path.into(),
            body: body.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Endpoint missing or not implemented by this worker build.
    pub fn is_unsupported(&self) -> bool {
        matches!(self.status, 404 | 405 | 501)
    }
}

impl fmt::Display for WorkerHttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker returned {} on {}", self.status, self.path)?;
        let body = self.body.trim();
        if !body.is_empty() {
            write!(f, ": {body}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, ". {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkerHttpError {}

/// Shape of a transport failure that never produced an HTTP answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityKind {
    Dns,
    Timeout,
    Refused,
    Unreachable,
    Other,
}

impl fmt::Display for ConnectivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectivityKind::Dns => "dns",
            ConnectivityKind::Timeout => "timeout",
            ConnectivityKind::Refused => "refused",
            ConnectivityKind::Unreachable => "unreachable",
            ConnectivityKind::Other => "other",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),

    #[error("failed to build worker HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("no session at index {index}")]
    NotFound { index: usize },

    #[error("multiple sessions active ({count}). Specify a session index; run `devicedock list` to see them")]
    Ambiguous { count: usize },

    #[error("no active device sessions. Start one with `devicedock start`")]
    NoSessions,

    #[error("{0}")]
    Provisioning(String),

    #[error("cancelled while {0}")]
    Cancelled(String),

    #[error(transparent)]
    Worker(#[from] WorkerHttpError),

    #[error("worker request failed for {path}: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{message}")]
    Connectivity {
        kind: ConnectivityKind,
        message: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("session {index} was stopped externally (from browser or another client). Start a new session with `devicedock start`")]
    TerminatedExternally { index: usize },

    #[error("session {index} failed on the worker. Start a new session with `devicedock start`")]
    WorkerFailed { index: usize },

    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: BackendError,
    },

    #[error("{reason}. Take a screenshot to see the current screen and adjust the target description")]
    GroundingMiss { target: String, reason: String },

    #[error("{0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Anchor(String),

    #[error("failed to write {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    pub(crate) fn backend(context: impl Into<String>, source: BackendError) -> Self {
        SessionError::Backend {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn grounding_miss(target: &str, reported: Option<String>) -> Self {
        let reason = reported
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| format!("could not locate '{target}' in the screenshot"));
        SessionError::GroundingMiss {
            target: target.to_string(),
            reason,
        }
    }

    /// Typed worker error, if this failure is one.
    pub fn worker_http(&self) -> Option<&WorkerHttpError> {
        match self {
            SessionError::Worker(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
