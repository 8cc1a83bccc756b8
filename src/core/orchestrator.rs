use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::AppConfig;
use crate::context::AppContext;
use crate::core::archive::{self, ArchiveBackend, PROGRESS_CHANNEL_CAPACITY};
use crate::core::cleanup::{self, CleanupReport};
use crate::core::metadata::{ApplyReport, MetadataStore, metadata_name_for, metadata_path_for};
use crate::core::models::{ArchiveJob, JobState, RemoteEntry};
use crate::core::progress::ProgressTracker;
use crate::core::transfer_engine::{TransferEngine, TransferOptions, TransferStatus};
use crate::error::{JobError, TransferError};
use crate::logging::LogThrottle;
use crate::remote::{self, ARCHIVE_MIME, METADATA_MIME, RemoteStore};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// What to delete locally once the upload has succeeded.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupPlan {
    /// This job's archive and metadata file.
    pub this_job: bool,
    /// Every archive in the destination directory.
    pub all_archives: bool,
    /// Report instead of deleting.
    pub dry_run: bool,
}

/// Local path for a remote file name, refusing names that would leave `dir`.
fn download_path(dir: &Path, name: &str) -> Result<PathBuf, TransferError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(file)), None) => Ok(dir.join(file)),
        _ => Err(TransferError::Protocol(format!(
            "remote file name {name:?} is not a plain file name"
        ))),
    }
}

impl CleanupPlan {
    fn requested(&self) -> bool {
        self.this_job || self.all_archives
    }
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub label: Option<String>,
    pub password: Option<String>,
    pub cleanup: CleanupPlan,
}

#[derive(Debug)]
pub struct BackupOutcome {
    pub job: ArchiveJob,
    pub archive: PathBuf,
    pub metadata: Option<PathBuf>,
    pub remote_archive: RemoteEntry,
    pub remote_metadata: Option<RemoteEntry>,
    pub cleanup: Option<CleanupReport>,
}

#[derive(Debug)]
pub struct RestoreOutcome {
    pub archive: PathBuf,
    pub target: PathBuf,
    pub timestamps: Option<ApplyReport>,
}

/// Drives one backup or restore job at a time through its states.
pub struct BackupOrchestrator {
    config: Arc<AppConfig>,
    archiver: Arc<dyn ArchiveBackend>,
    engine: TransferEngine,
    progress: ProgressTracker,
    cancel: CancellationToken,
    history: Mutex<Vec<JobState>>,
}

impl BackupOrchestrator {
    pub fn new(
        ctx: &AppContext,
        archiver: Arc<dyn ArchiveBackend>,
        store: Arc<dyn RemoteStore>,
    ) -> Self {
        let engine = TransferEngine::new(
            store,
            TransferOptions::from_config(&ctx.config),
            ctx.cancel.clone(),
            ctx.progress.clone(),
        );

        Self {
            config: ctx.config.clone(),
            archiver,
            engine,
            progress: ctx.progress.clone(),
            cancel: ctx.cancel.clone(),
            history: Mutex::new(vec![JobState::Idle]),
        }
    }

    /// Wire the configured archiver and remote store.
    pub fn from_context(ctx: &AppContext) -> anyhow::Result<Self> {
        let archiver = archive::create_backend(&ctx.config, ctx.cancel.clone());
        let store = remote::get_store(&ctx.config)?;
        Ok(Self::new(ctx, archiver, store))
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    /// States visited by the most recent job, starting with `Idle`.
    pub fn history(&self) -> Vec<JobState> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn state(&self) -> JobState {
        self.history().last().copied().unwrap_or(JobState::Idle)
    }

    fn begin_job(&self) {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = history
            .last()
            .filter(|s| **s != JobState::Idle && !s.is_terminal())
        {
            warn!(state = ?previous, "Starting a job while the previous one is unfinished");
        }
        *history = vec![JobState::Idle];
    }

    fn transition(&self, state: JobState) {
        info!(state = ?state, "Job state changed");
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(state);
    }

    fn finish<T>(&self, result: &Result<T, JobError>) {
        match result {
            Ok(_) => self.transition(JobState::Done),
            Err(e) => {
                error!(kind = e.kind(), error = %e, "Job failed");
                self.transition(JobState::Failed);
            }
        }
    }

    fn ensure_not_cancelled(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled.into());
        }
        Ok(())
    }

    /// Archive, upload, then optionally clean up.
    pub async fn run_backup(&self, request: BackupRequest) -> Result<BackupOutcome, JobError> {
        self.begin_job();
        let span = info_span!("backup", source = %request.source.display());
        let result = self.backup_steps(request).instrument(span).await;
        self.finish(&result);
        result
    }

    async fn backup_steps(&self, request: BackupRequest) -> Result<BackupOutcome, JobError> {
        self.transition(JobState::Archiving);
        let job = ArchiveJob::new(
            request.source,
            request.destination,
            request.label,
            request.password,
        )?;
        info!(job_id = %job.id, label = %job.label, "Backup job created");

        let archive_path = job.archive_path(self.archiver.extension());

        let metadata = if self.archiver.preserves_timestamps() {
            None
        } else {
            let source = job.source.clone();
            let store = tokio::task::spawn_blocking(move || MetadataStore::scan(&source))
                .await
                .map_err(std::io::Error::other)??;
            info!(files = store.len(), "Recorded file timestamps");
            Some(store)
        };

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let reporter = spawn_archive_reporter("Archiving", rx);
        let created = self
            .archiver
            .create_archive(&job.source, &archive_path, job.password(), tx)
            .await;
        let _ = reporter.await;
        let archive_path = created?;

        let metadata_path = match metadata {
            Some(store) => {
                let path = metadata_path_for(&archive_path);
                if let Err(e) = store.persist(&path) {
                    // An archive without its timestamps is not a finished backup.
                    if let Err(remove) = tokio::fs::remove_file(&archive_path).await {
                        warn!(file = %archive_path.display(), error = %remove, "Failed to remove archive");
                    }
                    return Err(e.into());
                }
                Some(path)
            }
            None => None,
        };

        self.ensure_not_cancelled()?;
        self.transition(JobState::Uploading);

        let folder_name = self.config.remote_folder.clone();
        let folder_id = self
            .with_retry("resolve remote folder", || {
                remote::resolve_folder(self.engine.store().as_ref(), &folder_name)
            })
            .await?;

        let remote_archive = self.upload(&archive_path, &folder_id, ARCHIVE_MIME).await?;
        let remote_metadata = match &metadata_path {
            Some(path) => Some(self.upload(path, &folder_id, METADATA_MIME).await?),
            None => None,
        };

        let cleanup = if request.cleanup.requested() {
            self.transition(JobState::CleaningUp);
            Some(self.cleanup(&job, &archive_path, request.cleanup))
        } else {
            None
        };

        Ok(BackupOutcome {
            job,
            archive: archive_path,
            metadata: metadata_path,
            remote_archive,
            remote_metadata,
            cleanup,
        })
    }

    async fn upload(
        &self,
        local: &Path,
        folder_id: &str,
        mime_type: &str,
    ) -> Result<RemoteEntry, JobError> {
        let name = file_label(local);
        let entry = self
            .with_retry("upload", || async {
                let (tx, rx) = mpsc::channel(32);
                let reporter = spawn_transfer_reporter(name.clone(), rx);
                let result = self.engine.upload(local, folder_id, mime_type, tx).await;
                let _ = reporter.await;
                result
            })
            .await;
        self.progress.remove(&name).await;
        Ok(entry?)
    }

    fn cleanup(&self, job: &ArchiveJob, archive: &Path, plan: CleanupPlan) -> CleanupReport {
        let report = if plan.all_archives {
            cleanup::remove_all_archives(&job.destination, self.archiver.extension(), plan.dry_run)
        } else {
            cleanup::remove_archive_set(archive, plan.dry_run)
        };

        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "Some local files could not be removed");
        }
        report
    }

    /// Run `op`, repeating it up to `retry_attempts` more times while it
    /// fails with a network error.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.config.retry_attempts => {
                    attempt += 1;
                    warn!(step = what, attempt, error = %e, "Retrying after network error");
                }
                other => return other,
            }
        }
    }

    /// Remote archives, newest first.
    pub async fn list_archives(&self) -> Result<Vec<RemoteEntry>, JobError> {
        let store = self.engine.store().clone();
        let folder_name = self.config.remote_folder.clone();

        let Some(folder_id) = self
            .with_retry("find remote folder", || {
                remote::find_folder(store.as_ref(), &folder_name)
            })
            .await?
        else {
            info!(folder = %folder_name, "Remote folder does not exist yet");
            return Ok(Vec::new());
        };

        let entries = self
            .with_retry("list archives", || {
                store.list_files(&folder_id, Some(ARCHIVE_MIME))
            })
            .await?;
        Ok(entries)
    }

    /// List remote archives, let `select` pick one, then restore it.
    ///
    /// `select` receives the archives newest first and returns an index.
    pub async fn restore_from_remote<F>(
        &self,
        select: F,
        target: &Path,
        password: Option<&str>,
    ) -> Result<RestoreOutcome, JobError>
    where
        F: FnOnce(&[RemoteEntry]) -> Option<usize>,
    {
        self.begin_job();
        let span = info_span!("restore", target = %target.display());
        let result = async move {
            self.transition(JobState::Listing);
            let archives = self.list_archives().await?;

            self.transition(JobState::Selecting);
            let entry = select(&archives)
                .and_then(|i| archives.get(i))
                .ok_or(JobError::NothingSelected)?
                .clone();
            info!(archive = %entry.name, "Selected archive");

            self.restore_entry_steps(&entry, target, password).await
        }
        .instrument(span)
        .await;
        self.finish(&result);
        result
    }

    /// Restore an already chosen remote archive.
    pub async fn restore_entry(
        &self,
        entry: &RemoteEntry,
        target: &Path,
        password: Option<&str>,
    ) -> Result<RestoreOutcome, JobError> {
        self.begin_job();
        let span = info_span!("restore", archive = %entry.name, target = %target.display());
        let result = self
            .restore_entry_steps(entry, target, password)
            .instrument(span)
            .await;
        self.finish(&result);
        result
    }

    async fn restore_entry_steps(
        &self,
        entry: &RemoteEntry,
        target: &Path,
        password: Option<&str>,
    ) -> Result<RestoreOutcome, JobError> {
        self.transition(JobState::Downloading);
        tokio::fs::create_dir_all(&self.config.destination).await?;

        let archive_path = download_path(&self.config.destination, &entry.name)?;
        self.download(entry, &archive_path).await?;

        let metadata_path = match self.find_remote_metadata(entry).await? {
            Some(meta_entry) => {
                let path = download_path(&self.config.destination, &meta_entry.name)?;
                self.download(&meta_entry, &path).await?;
                Some(path)
            }
            None => {
                info!("No metadata file stored with this archive");
                None
            }
        };

        self.extract_and_replay(&archive_path, metadata_path.as_deref(), target, password)
            .await
    }

    async fn find_remote_metadata(
        &self,
        archive: &RemoteEntry,
    ) -> Result<Option<RemoteEntry>, JobError> {
        let store = self.engine.store().clone();
        let folder_name = self.config.remote_folder.clone();
        let wanted = metadata_name_for(&archive.name);

        let Some(folder_id) = self
            .with_retry("find remote folder", || {
                remote::find_folder(store.as_ref(), &folder_name)
            })
            .await?
        else {
            return Ok(None);
        };

        let candidates = self
            .with_retry("list metadata", || {
                store.list_files(&folder_id, Some(METADATA_MIME))
            })
            .await?;
        Ok(candidates.into_iter().find(|e| e.name == wanted))
    }

    async fn download(&self, entry: &RemoteEntry, local: &Path) -> Result<(), JobError> {
        let name = entry.name.clone();
        let result = self
            .with_retry("download", || async {
                let (tx, rx) = mpsc::channel(32);
                let reporter = spawn_transfer_reporter(name.clone(), rx);
                let result = self.engine.download_entry(entry, local, tx).await;
                let _ = reporter.await;
                result
            })
            .await;
        self.progress.remove(&name).await;
        Ok(result?)
    }

    /// Restore from an archive on local disk. The metadata file defaults to
    /// the archive's sibling `<stem>.metadata.json` when it exists.
    pub async fn restore_local(
        &self,
        archive: &Path,
        metadata: Option<&Path>,
        target: &Path,
        password: Option<&str>,
    ) -> Result<RestoreOutcome, JobError> {
        self.begin_job();
        let span = info_span!("restore", archive = %archive.display(), target = %target.display());

        let result = async {
            let sibling = metadata_path_for(archive);
            let metadata = match metadata {
                Some(path) => Some(path.to_path_buf()),
                None if sibling.is_file() => Some(sibling),
                None => None,
            };
            self.extract_and_replay(archive, metadata.as_deref(), target, password)
                .await
        }
        .instrument(span)
        .await;

        self.finish(&result);
        result
    }

    async fn extract_and_replay(
        &self,
        archive: &Path,
        metadata: Option<&Path>,
        target: &Path,
        password: Option<&str>,
    ) -> Result<RestoreOutcome, JobError> {
        self.ensure_not_cancelled()?;
        self.transition(JobState::Extracting);

        // Parse first: a corrupt record should fail before anything is
        // written to the target.
        let store = match metadata {
            Some(path) => Some(MetadataStore::load(path)?),
            None => None,
        };

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let reporter = spawn_archive_reporter("Extracting", rx);
        let extracted = self
            .archiver
            .extract_archive(archive, target, password, tx)
            .await;
        let _ = reporter.await;
        extracted?;

        self.transition(JobState::RestoringTimestamps);
        let timestamps = match store {
            Some(store) => {
                let base = target.to_path_buf();
                let report = tokio::task::spawn_blocking(move || store.apply_timestamps(&base))
                    .await
                    .map_err(std::io::Error::other)??;
                info!(
                    applied = report.applied,
                    skipped = report.skipped,
                    "Timestamps restored"
                );
                Some(report)
            }
            None => {
                warn!("No metadata available, access times were not restored");
                None
            }
        };

        Ok(RestoreOutcome {
            archive: archive.to_path_buf(),
            target: target.to_path_buf(),
            timestamps,
        })
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn format_speed(bytes_per_sec: Option<f64>) -> String {
    match bytes_per_sec {
        Some(speed) if speed >= 1024.0 * 1024.0 => format!("{:.1} MiB/s", speed / (1024.0 * 1024.0)),
        Some(speed) => format!("{:.1} KiB/s", speed / 1024.0),
        None => "unknown".to_string(),
    }
}

fn spawn_archive_reporter(phase: &'static str, mut rx: mpsc::Receiver<u8>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
        while let Some(percentage) = rx.recv().await {
            if percentage == 100 || throttle.should_log() {
                info!(percentage, "{phase}");
            }
        }
    })
}

fn spawn_transfer_reporter(
    name: String,
    mut rx: mpsc::Receiver<TransferStatus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
        while let Some(status) = rx.recv().await {
            match status {
                TransferStatus::InProgress {
                    total_bytes,
                    bytes_transferred,
                    percentage,
                    bytes_per_sec,
                    eta_seconds,
                } => {
                    if throttle.should_log() {
                        info!(
                            file = %name,
                            bytes_transferred,
                            total_bytes,
                            percentage,
                            speed = %format_speed(bytes_per_sec),
                            eta_seconds,
                            "Transfer progress"
                        );
                    }
                }
                TransferStatus::Complete {
                    total_bytes,
                    duration_secs,
                } => {
                    info!(file = %name, total_bytes, duration_secs, "Transfer finished");
                }
                TransferStatus::Failed(message) => {
                    warn!(file = %name, error = %message, "Transfer failed");
                }
                TransferStatus::Ready => {}
            }
        }
    })
}
