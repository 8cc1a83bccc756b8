//! Removal of local archives after they have reached the remote.
//!
//! Deletion is best effort: failures are logged and reported, never
//! returned as errors.

use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::core::metadata::metadata_path_for;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    /// Paths that would have been removed in a dry run.
    pub planned: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.planned.extend(other.planned);
        self.failed.extend(other.failed);
    }
}

/// Archives with the given extension directly inside `dir`, sorted by name.
pub fn find_local_archives(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let mut archives: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .collect();

    archives.sort();
    archives
}

/// Remove an archive and its metadata file when present.
pub fn remove_archive_set(archive: &Path, dry_run: bool) -> CleanupReport {
    let mut report = CleanupReport::default();

    for path in [archive.to_path_buf(), metadata_path_for(archive)] {
        if !path.exists() {
            continue;
        }

        if dry_run {
            info!(file = %path.display(), "Would remove");
            report.planned.push(path);
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(file = %path.display(), "Removed local file");
                report.removed.push(path);
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to remove local file");
                report.failed.push(path);
            }
        }
    }

    report
}

/// Remove every archive set in `dir`.
pub fn remove_all_archives(dir: &Path, extension: &str, dry_run: bool) -> CleanupReport {
    let mut report = CleanupReport::default();
    for archive in find_local_archives(dir, extension) {
        report.merge(remove_archive_set(&archive, dry_run));
    }
    report
}
