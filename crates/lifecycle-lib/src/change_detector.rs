//! Dataset change detection
//!
//! The dataset file is fingerprinted with a streaming SHA-256 over its raw
//! bytes and compared against the digest stored by the previous run.

use crate::config::HashCommitPolicy;
use crate::dataset::{DataSource, NoopDataSource};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Read size for the streaming digest
pub const CHUNK_SIZE: usize = 4096;

/// Error type for fingerprint and hash store I/O
#[derive(Debug, thiserror::Error)]
#[error("{action} {path:?}: {source}")]
pub struct FingerprintError {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: std::io::Error,
}

impl FingerprintError {
    fn new(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome of comparing the dataset against the stored digest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    /// Dataset file absent; the upstream load was triggered
    Missing,
    /// No digest stored yet
    FirstRun,
    /// Digest differs from the stored one
    Changed,
    Unchanged,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Missing => "missing",
            ChangeStatus::FirstRun => "first_run",
            ChangeStatus::Changed => "changed",
            ChangeStatus::Unchanged => "unchanged",
        }
    }
}

/// Current digest of the dataset plus the digest recorded by the previous run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetFingerprint {
    pub digest: String,
    pub previous: Option<String>,
}

/// Result of one change check
#[derive(Debug, Clone)]
pub struct ChangeCheck {
    pub status: ChangeStatus,
    pub fingerprint: Option<DatasetFingerprint>,
    /// Whether the new digest has already been written to the hash store
    pub committed: bool,
}

impl ChangeCheck {
    /// Everything except `Unchanged` warrants a retraining attempt
    pub fn changed(&self) -> bool {
        self.status != ChangeStatus::Unchanged
    }
}

/// Compute the SHA-256 of a file's exact bytes, reading in fixed-size chunks
pub fn file_digest(path: &Path) -> Result<String, FingerprintError> {
    let mut file = File::open(path).map_err(|e| FingerprintError::new("failed to open", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];

    loop {
        let read = file
            .read(&mut buf)
            .map_err(|e| FingerprintError::new("failed to read", path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Decides whether the dataset changed since the last recorded run
pub struct ChangeDetector {
    hash_store_path: PathBuf,
    policy: HashCommitPolicy,
    source: Box<dyn DataSource>,
}

impl ChangeDetector {
    pub fn new(
        hash_store_path: impl Into<PathBuf>,
        policy: HashCommitPolicy,
        source: Box<dyn DataSource>,
    ) -> Self {
        Self {
            hash_store_path: hash_store_path.into(),
            policy,
            source,
        }
    }

    pub fn policy(&self) -> HashCommitPolicy {
        self.policy
    }

    /// Digest stored by the previous run, if any
    pub fn stored_digest(&self) -> Result<Option<String>, FingerprintError> {
        if !self.hash_store_path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.hash_store_path)
            .map_err(|e| FingerprintError::new("failed to read hash store", &self.hash_store_path, e))?;
        let digest = contents.trim();
        Ok((!digest.is_empty()).then(|| digest.to_string()))
    }

    /// Compare the dataset against the hash store.
    ///
    /// Under [`HashCommitPolicy::Eager`] a new digest is persisted before this
    /// returns; under `OnSuccess` the caller must [`commit`](Self::commit) it.
    pub fn check(&self, dataset_path: &Path) -> Result<ChangeCheck, FingerprintError> {
        if !dataset_path.exists() {
            info!(path = %dataset_path.display(), "Data file not found, triggering data load");
            if let Err(e) = self.source.materialize(dataset_path) {
                error!(error = %e, "Upstream data load failed");
            }
            return Ok(ChangeCheck {
                status: ChangeStatus::Missing,
                fingerprint: None,
                committed: false,
            });
        }

        let mut check = self.compare(dataset_path)?;

        if check.changed() && self.policy == HashCommitPolicy::Eager {
            self.commit(&mut check)?;
        }

        Ok(check)
    }

    /// Compare without side effects: no upstream load and no digest write,
    /// whatever the commit policy.
    pub fn peek(&self, dataset_path: &Path) -> Result<ChangeCheck, FingerprintError> {
        if !dataset_path.exists() {
            return Ok(ChangeCheck {
                status: ChangeStatus::Missing,
                fingerprint: None,
                committed: false,
            });
        }
        self.compare(dataset_path)
    }

    fn compare(&self, dataset_path: &Path) -> Result<ChangeCheck, FingerprintError> {
        let digest = file_digest(dataset_path)?;
        let previous = self.stored_digest()?;

        let status = match &previous {
            None => ChangeStatus::FirstRun,
            Some(prev) if *prev != digest => ChangeStatus::Changed,
            Some(_) => ChangeStatus::Unchanged,
        };

        debug!(digest = %digest, previous = ?previous, status = status.as_str(), "Dataset fingerprinted");

        Ok(ChangeCheck {
            status,
            fingerprint: Some(DatasetFingerprint { digest, previous }),
            committed: status == ChangeStatus::Unchanged,
        })
    }

    /// Persist the digest carried by `check` if it is not stored yet
    pub fn commit(&self, check: &mut ChangeCheck) -> Result<(), FingerprintError> {
        if check.committed {
            return Ok(());
        }
        let Some(fingerprint) = &check.fingerprint else {
            return Ok(());
        };
        self.write_digest(&fingerprint.digest)?;
        check.committed = true;
        Ok(())
    }

    /// Fingerprint the dataset as it is now and store the digest
    pub fn commit_current(&self, dataset_path: &Path) -> Result<String, FingerprintError> {
        let digest = file_digest(dataset_path)?;
        self.write_digest(&digest)?;
        Ok(digest)
    }

    /// True when a retraining attempt is warranted
    pub fn has_data_changed(&self, dataset_path: &Path) -> Result<bool, FingerprintError> {
        Ok(self.check(dataset_path)?.changed())
    }

    fn write_digest(&self, digest: &str) -> Result<(), FingerprintError> {
        let path = &self.hash_store_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| FingerprintError::new("failed to create directory for", path, e))?;
        }

        // Write to temp file first so a crash never leaves a truncated digest
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)
            .map_err(|e| FingerprintError::new("failed to create", &temp_path, e))?;
        file.write_all(digest.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| FingerprintError::new("failed to write", &temp_path, e))?;
        fs::rename(&temp_path, path).map_err(|e| FingerprintError::new("failed to replace", path, e))?;

        debug!(path = %path.display(), "Stored dataset digest");
        Ok(())
    }
}

/// Eager-commit check with no upstream loader
pub fn has_data_changed(dataset_path: &Path, hash_store_path: &Path) -> Result<bool, FingerprintError> {
    ChangeDetector::new(hash_store_path, HashCommitPolicy::Eager, Box::new(NoopDataSource))
        .has_data_changed(dataset_path)
}
