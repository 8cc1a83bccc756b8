//! Archive backends turn a directory tree into a single (optionally
//! encrypted) archive file and back.

mod progress;
mod sevenzip;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::ArchiveError;

pub use progress::{LineSplitter, ProgressParser};
pub use sevenzip::SevenZipBackend;

/// Capacity that always holds a full 0..=100 percentage sequence.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 128;

pub type ArchiveFuture<T> = Pin<Box<dyn Future<Output = Result<T, ArchiveError>> + Send>>;

/// Creates and extracts archives.
///
/// Progress is sent as strictly increasing percentages (0-100). Senders
/// never block as long as the channel holds `PROGRESS_CHANNEL_CAPACITY`
/// values; receivers may be dropped to ignore progress.
pub trait ArchiveBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// File extension of produced archives, without the dot.
    fn extension(&self) -> &'static str;

    /// Whether access and modification times survive a create/extract
    /// round trip without a separate metadata record.
    fn preserves_timestamps(&self) -> bool;

    /// Archive `source` into `destination`. Nothing appears at
    /// `destination` unless the archiver succeeded.
    fn create_archive(
        &self,
        source: &Path,
        destination: &Path,
        password: Option<&str>,
        progress: mpsc::Sender<u8>,
    ) -> ArchiveFuture<PathBuf>;

    /// Extract `archive` into `target`, overwriting existing files.
    /// `target` is untouched when extraction fails.
    fn extract_archive(
        &self,
        archive: &Path,
        target: &Path,
        password: Option<&str>,
        progress: mpsc::Sender<u8>,
    ) -> ArchiveFuture<()>;
}

pub fn create_backend(config: &AppConfig, cancel: CancellationToken) -> Arc<dyn ArchiveBackend> {
    Arc::new(SevenZipBackend::new(config.archiver.clone(), cancel))
}

/// `x.7z` -> `x.7z.partial`
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}
