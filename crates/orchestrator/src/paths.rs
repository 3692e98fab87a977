//! Path resolution for DeviceDock's own files.
//!
//! The data dir (logs) is resolved once at startup from: CLI `--data-dir` >
//! `DEVICEDOCK_DATA_DIR` env > `~/.devicedock`. The session cache lives
//! under the work dir instead, so each project keeps its own sessions.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

pub const DATA_DIR_ENV: &str = "DEVICEDOCK_DATA_DIR";
const DEFAULT_DIR_NAME: &str = ".devicedock";

/// Resolves and records the data directory.
pub fn init_data_dir(explicit: Option<&Path>) -> io::Result<PathBuf> {
    let dir = match explicit {
        Some(path) => path.to_path_buf(),
        None => match std::env::var_os(DATA_DIR_ENV).filter(|value| !value.is_empty()) {
            Some(value) => PathBuf::from(value),
            None => dirs::home_dir()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "home directory not found"))?
                .join(DEFAULT_DIR_NAME),
        },
    };

    if let Ok(mut guard) = DATA_DIR.write() {
        *guard = Some(dir.clone());
    }
    Ok(dir)
}

/// The recorded data directory, if `init_data_dir` has run.
pub fn data_dir() -> Option<PathBuf> {
    DATA_DIR.read().ok().and_then(|guard| guard.clone())
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Session cache root: explicit work dir, else the current directory.
pub fn resolve_work_dir(explicit: Option<&Path>) -> io::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => std::env::current_dir(),
    }
}
