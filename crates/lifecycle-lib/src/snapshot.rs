//! Local timestamped model snapshots
//!
//! Snapshots live under a fixed root as `<model_type>_<YYYYMMDD_HHMMSS>`
//! directories. They are staged under a hidden name and renamed into place,
//! so a reader never sees a half-written snapshot, and are never modified
//! afterwards.

use crate::artifact::{self, ArtifactError, InputExample, ModelArtifact, MODEL_FILE};
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Timestamp format used in snapshot directory names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Snapshot directory found on disk
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub path: PathBuf,
    /// Modification time of the model file
    pub modified: SystemTime,
}

pub fn dir_name(model_type: &str, at: DateTime<Local>) -> String {
    format!("{}_{}", model_type, at.format(TIMESTAMP_FORMAT))
}

/// Write a new snapshot and return its directory.
///
/// Two snapshots of the same model type within one second get a numeric
/// suffix (`_2`, `_3`, ...) instead of overwriting each other.
pub fn write(
    root: &Path,
    artifact: &ModelArtifact,
    example: &InputExample,
    at: DateTime<Local>,
) -> Result<PathBuf, ArtifactError> {
    fs::create_dir_all(root).map_err(|source| ArtifactError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let base = dir_name(&artifact.model_type, at);
    let mut target = root.join(&base);
    let mut attempt = 1;
    while target.exists() {
        attempt += 1;
        target = root.join(format!("{}_{}", base, attempt));
    }

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| base.clone());
    let staging = root.join(format!(".{}.staging", name));

    if let Err(e) = artifact::write_dir(&staging, artifact, example) {
        remove_quietly(&staging);
        return Err(e);
    }
    fs::rename(&staging, &target).map_err(|source| {
        remove_quietly(&staging);
        ArtifactError::Io {
            path: target.clone(),
            source,
        }
    })?;

    debug!(path = %target.display(), "Snapshot written");
    Ok(target)
}

/// Snapshot directories under `root` holding a model file, newest first.
///
/// A missing root yields an empty list. Hidden (staging) directories are skipped.
pub fn list(root: &Path) -> std::io::Result<Vec<SnapshotEntry>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || !path.is_dir() {
            continue;
        }

        let model_path = path.join(MODEL_FILE);
        match fs::metadata(&model_path).and_then(|m| m.modified()) {
            Ok(modified) => entries.push(SnapshotEntry { path, modified }),
            Err(_) => debug!(path = %path.display(), "Skipping directory without model file"),
        }
    }

    // Newest first; ties broken by name so the order is stable
    entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    Ok(entries)
}

/// Remove a snapshot directory written by a promotion that is being undone
pub fn remove(path: &Path) -> std::io::Result<()> {
    fs::remove_dir_all(path)
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_dir_all(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove staging directory");
        }
    }
}
