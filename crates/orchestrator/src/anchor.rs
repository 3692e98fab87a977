//! Screenshot anchors: the latest captured screen of a session, kept for
//! later grounding and replay.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenAnchor {
    pub token: String,
    pub captured_at: DateTime<Utc>,
    /// Worker actions issued since the screenshot was taken.
    pub actions_used: u32,
    pub image: Vec<u8>,
    pub image_path: Option<PathBuf>,
}

impl ScreenAnchor {
    pub(crate) fn capture(index: usize, image: Option<&[u8]>, now: DateTime<Utc>) -> Self {
        let nanos = now
            .timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1000));
        Self {
            token: format!("screen-{index}-{nanos}"),
            captured_at: now,
            actions_used: 0,
            image: image.map(<[u8]>::to_vec).unwrap_or_default(),
            image_path: None,
        }
    }
}

/// `<cache_dir>/screenshots/session-{index}/{token}.png`
pub(crate) fn anchor_image_path(cache_dir: &Path, index: usize, token: &str) -> PathBuf {
    cache_dir
        .join("screenshots")
        .join(format!("session-{index}"))
        .join(format!("{token}.png"))
}

pub(crate) fn write_png_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("png.tmp");
    fs::write(&tmp_path, bytes)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
