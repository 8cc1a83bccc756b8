//! Chunked, resumable transfer of single files against a `RemoteStore`.

mod session;

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::AppConfig;
use crate::core::models::RemoteEntry;
use crate::core::progress::ProgressTracker;
use crate::core::verifier;
use crate::error::TransferError;
use crate::remote::{ChunkAck, RemoteStore, UploadHandle, UploadMetadata};

pub use session::TransferSession;

/// Events sent while a transfer runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferStatus {
    Ready,
    InProgress {
        total_bytes: u64,
        bytes_transferred: u64,
        percentage: u8,
        bytes_per_sec: Option<f64>,
        eta_seconds: Option<u64>,
    },
    Complete {
        total_bytes: u64,
        duration_secs: f64,
    },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub chunk_size: u64,
    pub chunk_timeout: Duration,
    /// Resume attempts per transfer after a chunk fails with a network error.
    pub chunk_retries: u32,
}

impl TransferOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_timeout: config.chunk_timeout(),
            chunk_retries: config.chunk_retries,
        }
    }
}

pub struct TransferEngine {
    store: Arc<dyn RemoteStore>,
    options: TransferOptions,
    cancel: CancellationToken,
    tracker: ProgressTracker,
    current: Mutex<Option<Arc<TransferSession>>>,
}

impl TransferEngine {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        options: TransferOptions,
        cancel: CancellationToken,
        tracker: ProgressTracker,
    ) -> Self {
        Self {
            store,
            options,
            cancel,
            tracker,
            current: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Polling handle for the transfer currently running, if any.
    pub fn session(&self) -> Option<Arc<TransferSession>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn start_session(&self, resource: &str, total_bytes: u64) -> Arc<TransferSession> {
        let session = Arc::new(TransferSession::new(resource, total_bytes));
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session.clone());
        session
    }

    fn end_session(&self) {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    async fn report(&self, tx: &mpsc::Sender<TransferStatus>, key: &str, status: TransferStatus) {
        self.tracker.update(key, status.clone()).await;
        let _ = tx.send(status).await;
    }

    /// Run one remote call under the chunk timeout, giving up early on
    /// cancellation.
    async fn timed<T, F>(&self, what: &str, call: F) -> Result<T, TransferError>
    where
        F: Future<Output = Result<T, TransferError>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            result = tokio::time::timeout(self.options.chunk_timeout, call) => match result {
                Ok(inner) => inner,
                Err(_) => Err(TransferError::Network(format!(
                    "{what} timed out after {:?}",
                    self.options.chunk_timeout
                ))),
            },
        }
    }

    fn ensure_not_cancelled(&self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    /// Upload `local` into `folder_id`.
    ///
    /// The BLAKE3 digest of the file is stored with the remote entry.
    pub async fn upload(
        &self,
        local: &Path,
        folder_id: &str,
        mime_type: &str,
        tx: mpsc::Sender<TransferStatus>,
    ) -> Result<RemoteEntry, TransferError> {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TransferError::Io(std::io::Error::other(format!(
                    "not a file path: {}",
                    local.display()
                )))
            })?;

        let span = info_span!("upload", file = %name, store = self.store.name());
        let result = self
            .upload_inner(local, &name, folder_id, mime_type, &tx)
            .instrument(span)
            .await;

        self.end_session();
        if let Err(e) = &result {
            self.report(&tx, &name, TransferStatus::Failed(e.to_string()))
                .await;
        }
        result
    }

    async fn upload_inner(
        &self,
        local: &Path,
        name: &str,
        folder_id: &str,
        mime_type: &str,
        tx: &mpsc::Sender<TransferStatus>,
    ) -> Result<RemoteEntry, TransferError> {
        let total_bytes = tokio::fs::metadata(local).await?.len();
        self.report(tx, name, TransferStatus::Ready).await;

        debug!("Hashing file before upload");
        let checksum = verifier::hash_file(local).await?;

        let meta = UploadMetadata {
            name: name.to_string(),
            parent_id: folder_id.to_string(),
            mime_type: mime_type.to_string(),
            total_bytes,
            checksum: Some(checksum),
        };
        self.ensure_not_cancelled()?;
        let handle = self
            .timed("opening upload session", self.store.begin_upload(&meta))
            .await?;

        info!(total_bytes, "Starting upload");
        let session = self.start_session(name, total_bytes);
        let mut file = tokio::fs::File::open(local).await?;
        let mut offset = 0u64;
        let mut retries_left = self.options.chunk_retries;

        let entry = loop {
            self.ensure_not_cancelled()?;

            let len = self.options.chunk_size.min(total_bytes - offset);
            let data = read_chunk(&mut file, offset, len).await?;

            let ack = self
                .timed("chunk upload", self.store.put_chunk(&handle, offset, data))
                .await;

            let (ack, resumed) = match ack {
                Ok(ack) => (ack, false),
                Err(e) if e.is_retryable() && retries_left > 0 => {
                    retries_left -= 1;
                    warn!(offset, error = %e, retries_left, "Chunk failed, resuming from committed offset");
                    (self.resume(&handle, &mut retries_left).await?, true)
                }
                Err(e) => return Err(e),
            };

            match ack {
                ChunkAck::Complete(entry) => break entry,
                ChunkAck::Incomplete { committed } => {
                    if committed > total_bytes || (!resumed && committed <= offset) {
                        return Err(TransferError::Protocol(format!(
                            "remote reports {committed} of {total_bytes} bytes after a chunk at {offset}"
                        )));
                    }
                    offset = committed;
                    if session.advance_to(committed) {
                        self.report(tx, name, session.status()).await;
                    }
                }
            }
        };

        if entry.size != total_bytes {
            return Err(TransferError::SizeMismatch {
                expected: total_bytes,
                actual: entry.size,
            });
        }

        if session.advance_to(total_bytes) || total_bytes == 0 {
            self.report(tx, name, session.status()).await;
        }
        let duration_secs = session.elapsed().as_secs_f64();
        self.report(
            tx,
            name,
            TransferStatus::Complete {
                total_bytes,
                duration_secs,
            },
        )
        .await;

        info!(id = %entry.id, duration_secs, "Upload complete");
        Ok(entry)
    }

    /// Ask the remote where an interrupted session stands, spending further
    /// retries if the query itself hits the network.
    async fn resume(
        &self,
        handle: &UploadHandle,
        retries_left: &mut u32,
    ) -> Result<ChunkAck, TransferError> {
        loop {
            self.ensure_not_cancelled()?;
            match self
                .timed("upload status query", self.store.committed_offset(handle))
                .await
            {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retryable() && *retries_left > 0 => {
                    *retries_left -= 1;
                    warn!(error = %e, retries_left = *retries_left, "Upload status query failed");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Download `file_id` into `local`, expecting `expected_size` bytes.
    pub async fn download(
        &self,
        file_id: &str,
        local: &Path,
        expected_size: u64,
        tx: mpsc::Sender<TransferStatus>,
    ) -> Result<(), TransferError> {
        self.ensure_not_cancelled()?;
        let entry = self.timed("stat", self.store.stat(file_id)).await?;
        if entry.size != expected_size {
            return Err(TransferError::SizeMismatch {
                expected: expected_size,
                actual: entry.size,
            });
        }
        self.download_entry(&entry, local, tx).await
    }

    /// Download a listed entry, verifying its checksum when it has one.
    ///
    /// Bytes land in `<local>.part` and are renamed only after the last
    /// chunk. A new call always starts from zero.
    pub async fn download_entry(
        &self,
        entry: &RemoteEntry,
        local: &Path,
        tx: mpsc::Sender<TransferStatus>,
    ) -> Result<(), TransferError> {
        let part = part_path(local);
        let span = info_span!("download", file = %entry.name, store = self.store.name());
        let result = self
            .download_inner(entry, local, &part, &tx)
            .instrument(span)
            .await;

        self.end_session();
        if let Err(e) = &result {
            match tokio::fs::remove_file(&part).await {
                Err(cleanup) if cleanup.kind() != std::io::ErrorKind::NotFound => {
                    warn!(file = %part.display(), error = %cleanup, "Failed to remove partial download");
                }
                _ => {}
            }
            self.report(&tx, &entry.name, TransferStatus::Failed(e.to_string()))
                .await;
        }
        result
    }

    async fn download_inner(
        &self,
        entry: &RemoteEntry,
        local: &Path,
        part: &Path,
        tx: &mpsc::Sender<TransferStatus>,
    ) -> Result<(), TransferError> {
        let name = entry.name.as_str();
        let total_bytes = entry.size;

        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.report(tx, name, TransferStatus::Ready).await;
        info!(total_bytes, "Starting download");

        let session = self.start_session(name, total_bytes);
        let mut file = tokio::fs::File::create(part).await?;
        let mut offset = 0u64;
        let mut retries_left = self.options.chunk_retries;

        while offset < total_bytes {
            self.ensure_not_cancelled()?;

            let len = self.options.chunk_size.min(total_bytes - offset);
            let bytes = match self
                .timed("chunk download", self.store.read_range(&entry.id, offset, len))
                .await
            {
                Ok(bytes) => bytes,
                Err(e) if e.is_retryable() && retries_left > 0 => {
                    retries_left -= 1;
                    warn!(offset, error = %e, retries_left, "Chunk failed, continuing from local bytes");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if bytes.is_empty() {
                return Err(TransferError::SizeMismatch {
                    expected: total_bytes,
                    actual: offset,
                });
            }
            if bytes.len() as u64 > len {
                return Err(TransferError::Protocol(format!(
                    "asked for {len} bytes at {offset}, got {}",
                    bytes.len()
                )));
            }

            file.write_all(&bytes).await?;
            offset += bytes.len() as u64;
            if session.advance_to(offset) {
                self.report(tx, name, session.status()).await;
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let written = tokio::fs::metadata(part).await?.len();
        if written != total_bytes {
            return Err(TransferError::SizeMismatch {
                expected: total_bytes,
                actual: written,
            });
        }

        if let Some(expected) = &entry.checksum {
            verifier::verify_checksum(part, name, expected).await?;
        } else {
            debug!("Remote entry has no checksum, skipping verification");
        }

        tokio::fs::rename(part, local).await?;

        if total_bytes == 0 {
            self.report(tx, name, session.status()).await;
        }
        let duration_secs = session.elapsed().as_secs_f64();
        self.report(
            tx,
            name,
            TransferStatus::Complete {
                total_bytes,
                duration_secs,
            },
        )
        .await;

        info!(file = %local.display(), duration_secs, "Download complete");
        Ok(())
    }
}

/// `x.7z` -> `x.7z.part`
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

async fn read_chunk(
    file: &mut tokio::fs::File,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>, TransferError> {
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buffer = vec![0u8; len as usize];
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("file shrank during upload at byte {}", offset + filled as u64),
            )));
        }
        filled += n;
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/tmp/docs_2024.7z")),
            PathBuf::from("/tmp/docs_2024.7z.part")
        );
    }
}
