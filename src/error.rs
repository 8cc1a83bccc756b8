//! Error types for archive, transfer, and metadata operations.
//!
//! Each component has its own enum. `JobError` unifies them for the
//! orchestrator and exposes `kind()`, the short name printed by the CLI.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Source directory not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Archive not found: {}", .0.display())]
    ArchiveNotFound(PathBuf),

    #[error("Archiver '{0}' is not installed or not on PATH")]
    ToolMissing(String),

    #[error("Archiver exited with {}: {stderr}", describe_exit(.exit_code))]
    ToolFailure {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Wrong password for archive")]
    BadPassword,

    #[error("Archive operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "a signal".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Remote file not found: {0}")]
    RemoteNotFound(String),

    #[error("Unexpected response from remote store: {0}")]
    Protocol(String),

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Checksum mismatch for {name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether a caller may reasonably retry the whole step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Network(_))
    }
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Corrupt metadata file {}: {source}", path.display())]
    CorruptMetadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode metadata: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("No archive selected for restore")]
    NothingSelected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Short error kind name, stable across messages.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Archive(e) => match e {
                ArchiveError::SourceNotFound(_) => "SourceNotFound",
                ArchiveError::ArchiveNotFound(_) => "ArchiveNotFound",
                ArchiveError::ToolMissing(_) => "ToolMissing",
                ArchiveError::ToolFailure { .. } => "ToolFailure",
                ArchiveError::BadPassword => "BadPassword",
                ArchiveError::Cancelled => "Cancelled",
                ArchiveError::Io(_) => "IOError",
            },
            JobError::Transfer(e) => match e {
                TransferError::Network(_) => "NetworkError",
                TransferError::Auth(_) => "AuthError",
                TransferError::QuotaExceeded(_) => "QuotaExceeded",
                TransferError::RemoteNotFound(_) => "RemoteNotFound",
                TransferError::Protocol(_) => "ProtocolError",
                TransferError::SizeMismatch { .. } => "SizeMismatch",
                TransferError::ChecksumMismatch { .. } => "ChecksumMismatch",
                TransferError::Cancelled => "Cancelled",
                TransferError::Io(_) => "IOError",
            },
            JobError::Metadata(e) => match e {
                MetadataError::CorruptMetadata { .. } => "CorruptMetadata",
                MetadataError::Encode(_) | MetadataError::Io(_) => "IOError",
            },
            JobError::NothingSelected => "NothingSelected",
            JobError::Io(_) => "IOError",
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, JobError::Transfer(TransferError::Auth(_)))
    }
}
