//! Status snapshot file
//!
//! The running monitor rewrites a small JSON document on every transition so
//! `fingerlock status` can report the session from another process.

use crate::domain::types::{LockState, PlatformSetting};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: LockState,
    pub platform: PlatformSetting,
    pub lock_delay_seconds: u64,
    pub attempt_count: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StatusWriter {
    path: PathBuf,
    platform: PlatformSetting,
    lock_delay_seconds: u64,
}

impl StatusWriter {
    pub fn new(path: impl Into<PathBuf>, platform: PlatformSetting, lock_delay_seconds: u64) -> Self {
        Self { path: path.into(), platform, lock_delay_seconds }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, state: LockState, attempt_count: u32) -> anyhow::Result<StatusSnapshot> {
        let snapshot = StatusSnapshot {
            state,
            platform: self.platform,
            lock_delay_seconds: self.lock_delay_seconds,
            attempt_count,
            updated_at: Utc::now(),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create status dir {}", parent.display()))?;
        }
        let payload = serde_json::to_vec_pretty(&snapshot).context("Failed to serialize status")?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("Failed to write status {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to commit status {}", self.path.display()))?;
        Ok(snapshot)
    }

    /// Remove the snapshot on clean shutdown
    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Read the last snapshot, `None` when no monitor has written one
pub fn read_status(path: &Path) -> anyhow::Result<Option<StatusSnapshot>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read status {}", path.display()))
        }
    };
    let snapshot = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse status {}", path.display()))?;
    Ok(Some(snapshot))
}
