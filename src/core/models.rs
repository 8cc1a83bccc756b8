use chrono::{DateTime, Local, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::ArchiveError;

/// One backup invocation. Immutable once created.
#[derive(Clone)]
pub struct ArchiveJob {
    pub id: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub label: String,
    pub timestamp: DateTime<Local>,
    password: Option<String>,
}

impl ArchiveJob {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        label: Option<String>,
        password: Option<String>,
    ) -> Result<Self, ArchiveError> {
        let source = source.into();
        if !source.is_dir() {
            return Err(ArchiveError::SourceNotFound(source));
        }

        let label = match label {
            Some(l) if !l.trim().is_empty() => sanitize_label(&l),
            _ => derive_label(&source),
        };

        Ok(Self {
            id: Uuid::now_v7().to_string(),
            source,
            destination: destination.into(),
            label,
            timestamp: Local::now(),
            password: password.filter(|p| !p.is_empty()),
        })
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// `<label>_<YYYY-mm-dd_HH-MM-SS>.<ext>`
    pub fn archive_name(&self, extension: &str) -> String {
        format!(
            "{}_{}.{}",
            self.label,
            self.timestamp.format("%Y-%m-%d_%H-%M-%S"),
            extension
        )
    }

    pub fn archive_path(&self, extension: &str) -> PathBuf {
        self.destination.join(self.archive_name(extension))
    }
}

impl fmt::Debug for ArchiveJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveJob")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("label", &self.label)
            .field("timestamp", &self.timestamp)
            .field("encrypted", &self.password.is_some())
            .finish()
    }
}

/// Short label from the source directory name.
pub fn derive_label(source: &Path) -> String {
    let name = source
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .or_else(|| source.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();

    sanitize_label(&name)
}

fn sanitize_label(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "backup".to_string()
    } else {
        cleaned.chars().take(48).collect()
    }
}

/// A stored file as reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Hex BLAKE3 digest recorded at upload time, if any.
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub id: String,
    pub name: String,
}

/// Orchestrator states for both the backup and restore paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Archiving,
    Uploading,
    CleaningUp,
    Listing,
    Selecting,
    Downloading,
    Extracting,
    RestoringTimestamps,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}
