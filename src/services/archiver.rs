//! Archiver contract.
//!
//! Archive assembly (zip layout, manifest, styles) is an external
//! collaborator; finalization only hands it a staged-path → archive-path map
//! plus a manifest and expects an archive path back.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::ExportError;

/// Metadata written into the archive's manifest.
#[derive(Debug, Clone, Default)]
pub struct ArchiveManifest {
    pub run_id: String,
    pub job_name: String,
    pub provider_slugs: Vec<String>,
}

/// Errors from archive assembly.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive requested with no files to include")]
    Empty,

    #[error("produced archive failed integrity check: {0}")]
    Corrupted(String),

    #[error("archive assembly failed: {0}")]
    Assembly(String),
}

impl From<ArchiveError> for ExportError {
    fn from(err: ArchiveError) -> Self {
        ExportError::Archive(err.to_string())
    }
}

/// The archive assembly contract.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Build an archive from `files` (staged path → path inside the
    /// archive). Fails with [`ArchiveError::Empty`] when the file set is
    /// empty and [`ArchiveError::Corrupted`] when the produced archive does
    /// not verify.
    async fn build_archive(
        &self,
        files: BTreeMap<PathBuf, PathBuf>,
        manifest: ArchiveManifest,
    ) -> Result<PathBuf, ArchiveError>;
}

/// Recording double: remembers every request, optionally failing.
#[derive(Debug, Default)]
pub struct RecordingArchiver {
    pub fail_with: parking_lot::Mutex<Option<String>>,
    pub requests: parking_lot::Mutex<Vec<(BTreeMap<PathBuf, PathBuf>, ArchiveManifest)>>,
}

impl RecordingArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: parking_lot::Mutex::new(Some(message.into())),
            requests: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn archive_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Archiver for RecordingArchiver {
    async fn build_archive(
        &self,
        files: BTreeMap<PathBuf, PathBuf>,
        manifest: ArchiveManifest,
    ) -> Result<PathBuf, ArchiveError> {
        if files.is_empty() {
            return Err(ArchiveError::Empty);
        }
        if let Some(message) = self.fail_with.lock().clone() {
            return Err(ArchiveError::Assembly(message));
        }
        let run_id = manifest.run_id.clone();
        self.requests.lock().push((files, manifest));
        Ok(PathBuf::from(format!("{run_id}.zip")))
    }
}
