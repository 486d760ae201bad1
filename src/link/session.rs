//! On-disk session material.
//!
//! Each linking attempt owns one directory under the sessions root holding a
//! single SQLite database. The directory is created when the attempt starts
//! and removed once the onboarding bundle is delivered (or the attempt fails
//! for good). At most one directory exists per pair-flow phone number; this
//! is best effort, nothing locks the root across concurrent requests.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const DB_FILE: &str = "session.db";

/// Handle to one session directory.
#[derive(Debug, Clone)]
pub struct SessionDir {
    path: PathBuf,
}

impl SessionDir {
    /// Fresh directory keyed by a phone number (pair flow). Any leftover
    /// directory for the same number is removed first.
    pub fn for_number(root: &Path, digits: &str) -> Result<Self> {
        let path = root.join(digits);
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("failed to replace session dir {}", path.display()))?;
        }
        Self::create(path)
    }

    /// Fresh directory under a generated identifier (QR flow).
    pub fn generated(root: &Path) -> Result<Self> {
        Self::create(root.join(format!("qr-{}", uuid::Uuid::new_v4())))
    }

    fn create(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create session dir {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn db_path(&self) -> PathBuf {
        self.path.join(DB_FILE)
    }

    /// Best-effort removal. Returns whether the directory is gone afterwards.
    pub fn remove(&self) -> bool {
        if !self.path.exists() {
            return true;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {
                tracing::info!("removed session dir {}", self.path.display());
                true
            }
            Err(e) => {
                tracing::error!("failed to remove session dir {}: {e}", self.path.display());
                false
            }
        }
    }
}

/// Delete every session directory under `root`. Returns how many were removed.
pub fn purge_all(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("failed to read sessions root {}", root.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())
                .with_context(|| format!("failed to remove {}", entry.path().display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}
