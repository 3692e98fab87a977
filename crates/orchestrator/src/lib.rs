//! DeviceDock
//!
//! Orchestrates ephemeral cloud devices: provisions them through the
//! backend, tracks them as locally indexed sessions with idle expiry,
//! drives their workers over HTTP and keeps the local cache reconciled
//! with the backend.

pub mod actions;
pub mod anchor;
pub mod cli;
pub mod config;
mod connectivity;
pub mod error;
mod fallback;
pub mod gateway;
pub mod grounding;
mod idle;
pub mod logging;
pub mod manager;
pub mod paths;
pub mod persistence;
pub mod provisioning;
mod state;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use actions::Screenshot;
pub use anchor::ScreenAnchor;
pub use config::ManagerConfig;
pub use error::{ConnectivityKind, Result, SessionError, WorkerHttpError};
pub use gateway::DeviceReadiness;
pub use grounding::{GroundingSource, ResolvedTarget};
pub use manager::DeviceSessionManager;
pub use persistence::SessionStore;
pub use provisioning::{StartOptions, StartedSession};
pub use sync::SyncReport;
