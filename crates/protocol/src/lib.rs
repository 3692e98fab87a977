//! DeviceDock Protocol
//!
//! Shared types for the device session orchestrator: the locally persisted
//! session records, and the JSON bodies exchanged with per-device workers and
//! with the backend.

pub mod backend;
pub mod types;
pub mod worker;

pub use types::*;
