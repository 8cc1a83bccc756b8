use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ChunkAck, RemoteStore, UploadHandle, UploadMetadata};
use crate::core::models::{RemoteEntry, RemoteFolder};
use crate::error::TransferError;

const CATALOG_FILE: &str = "catalog.json";

/// A directory on local disk that behaves like the remote store.
///
/// Finished files live under `blobs/<id>`, in-flight uploads under
/// `uploads/<session>`, and names, folders and checksums in `catalog.json`.
/// Faults can be injected to exercise resume and retry paths.
pub struct SimulatedStore {
    root: PathBuf,
    state: Mutex<State>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    folders: BTreeMap<String, String>,
    files: BTreeMap<String, StoredFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredFile {
    name: String,
    parent: String,
    mime_type: String,
    size: u64,
    modified: DateTime<Utc>,
    checksum: Option<String>,
}

#[derive(Debug)]
struct Session {
    meta: UploadMetadata,
    committed: u64,
}

/// Fail `repeat` consecutive `put_chunk` calls starting with call number
/// `at_call` (1-based).
#[derive(Debug, Clone, Copy)]
pub struct UploadFault {
    pub at_call: u32,
    pub repeat: u32,
    /// Store the chunk before failing, like a reply lost after the remote
    /// already accepted the data.
    pub commit_first: bool,
}

#[derive(Debug, Default)]
struct State {
    catalog: Catalog,
    sessions: HashMap<String, Session>,
    upload_calls: u32,
    download_calls: u32,
    upload_fault: Option<UploadFault>,
    download_fault_at: Option<u32>,
    stall: Option<Duration>,
}

impl State {
    fn entry(&self, id: &str) -> Result<RemoteEntry, TransferError> {
        let file = self
            .catalog
            .files
            .get(id)
            .ok_or_else(|| TransferError::RemoteNotFound(id.to_string()))?;
        Ok(to_entry(id, file))
    }

    fn upload_fault_fires(&mut self) -> Option<bool> {
        self.upload_calls += 1;
        let fault = self.upload_fault?;
        let call = self.upload_calls;
        (call >= fault.at_call && call < fault.at_call + fault.repeat).then_some(fault.commit_first)
    }
}

fn to_entry(id: &str, file: &StoredFile) -> RemoteEntry {
    RemoteEntry {
        id: id.to_string(),
        name: file.name.clone(),
        size: file.size,
        modified: file.modified,
        checksum: file.checksum.clone(),
    }
}

impl SimulatedStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("blobs"))
            .with_context(|| format!("Failed to create {}", root.display()))?;
        std::fs::create_dir_all(root.join("uploads"))?;

        let catalog_path = root.join(CATALOG_FILE);
        let catalog = if catalog_path.exists() {
            let raw = std::fs::read(&catalog_path)?;
            serde_json::from_slice(&raw)
                .with_context(|| format!("Corrupt catalog {}", catalog_path.display()))?
        } else {
            Catalog::default()
        };

        Ok(Self {
            root: root.to_path_buf(),
            state: Mutex::new(State {
                catalog,
                ..State::default()
            }),
        })
    }

    pub async fn inject_upload_fault(&self, fault: UploadFault) {
        let mut state = self.state.lock().await;
        state.upload_calls = 0;
        state.upload_fault = Some(fault);
    }

    /// Fail the `at_call`-th (1-based) `read_range` call.
    pub async fn inject_download_fault(&self, at_call: u32) {
        let mut state = self.state.lock().await;
        state.download_calls = 0;
        state.download_fault_at = Some(at_call);
    }

    /// Hold every `put_chunk` and `read_range` call for `delay` before it
    /// does any work, like a connection that stops responding.
    pub async fn inject_stall(&self, delay: Duration) {
        self.state.lock().await.stall = Some(delay);
    }

    pub async fn clear_faults(&self) {
        let mut state = self.state.lock().await;
        state.upload_fault = None;
        state.download_fault_at = None;
        state.stall = None;
    }

    async fn wait_out_stall(&self) {
        let stall = self.state.lock().await.stall;
        if let Some(delay) = stall {
            warn!(?delay, "Simulated stall");
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn upload_calls(&self) -> u32 {
        self.state.lock().await.upload_calls
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join("blobs").join(id)
    }

    fn upload_path(&self, session: &str) -> PathBuf {
        self.root.join("uploads").join(session)
    }

    async fn save_catalog(&self, catalog: &Catalog) -> Result<(), TransferError> {
        let encoded = serde_json::to_vec_pretty(catalog)
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))?;
        let path = self.root.join(CATALOG_FILE);
        let tmp = self.root.join(format!("{CATALOG_FILE}.partial"));
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn write_at(&self, session: &str, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.upload_path(session))
            .await?;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn finish_upload(
        &self,
        state: &mut State,
        session_id: &str,
    ) -> Result<RemoteEntry, TransferError> {
        let session = state
            .sessions
            .remove(session_id)
            .ok_or_else(|| TransferError::RemoteNotFound(session_id.to_string()))?;

        let id = Uuid::now_v7().simple().to_string();
        let staged = self.upload_path(session_id);
        if !staged.exists() {
            tokio::fs::write(&staged, b"").await?;
        }
        tokio::fs::rename(&staged, self.blob_path(&id)).await?;

        let stored = StoredFile {
            name: session.meta.name.clone(),
            parent: session.meta.parent_id.clone(),
            mime_type: session.meta.mime_type.clone(),
            size: session.meta.total_bytes,
            modified: Utc::now(),
            checksum: session.meta.checksum.clone(),
        };
        let entry = to_entry(&id, &stored);
        state.catalog.files.insert(id, stored);
        self.save_catalog(&state.catalog).await?;

        debug!(file = %entry.name, id = %entry.id, "Simulated upload complete");
        Ok(entry)
    }
}

#[async_trait]
impl RemoteStore for SimulatedStore {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn list_folders(&self, name: &str) -> Result<Vec<RemoteFolder>, TransferError> {
        let state = self.state.lock().await;
        Ok(state
            .catalog
            .folders
            .iter()
            .filter(|(_, n)| n.as_str() == name)
            .map(|(id, n)| RemoteFolder {
                id: id.clone(),
                name: n.clone(),
            })
            .collect())
    }

    async fn create_folder(&self, name: &str) -> Result<String, TransferError> {
        let mut state = self.state.lock().await;
        let id = Uuid::now_v7().simple().to_string();
        state.catalog.folders.insert(id.clone(), name.to_string());
        self.save_catalog(&state.catalog).await?;
        Ok(id)
    }

    async fn list_files(
        &self,
        folder_id: &str,
        mime_filter: Option<&str>,
    ) -> Result<Vec<RemoteEntry>, TransferError> {
        let state = self.state.lock().await;
        let mut entries: Vec<RemoteEntry> = state
            .catalog
            .files
            .iter()
            .filter(|(_, f)| f.parent == folder_id)
            .filter(|(_, f)| mime_filter.is_none_or(|m| f.mime_type == m))
            .map(|(id, f)| to_entry(id, f))
            .collect();

        entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        Ok(entries)
    }

    async fn begin_upload(&self, meta: &UploadMetadata) -> Result<UploadHandle, TransferError> {
        let mut state = self.state.lock().await;
        if !state.catalog.folders.contains_key(&meta.parent_id) {
            return Err(TransferError::RemoteNotFound(format!(
                "folder {}",
                meta.parent_id
            )));
        }

        let session = Uuid::now_v7().simple().to_string();
        state.sessions.insert(
            session.clone(),
            Session {
                meta: meta.clone(),
                committed: 0,
            },
        );

        Ok(UploadHandle {
            session,
            total_bytes: meta.total_bytes,
        })
    }

    async fn put_chunk(
        &self,
        handle: &UploadHandle,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<ChunkAck, TransferError> {
        self.wait_out_stall().await;
        let mut state = self.state.lock().await;
        let fault = state.upload_fault_fires();

        let committed = state
            .sessions
            .get(&handle.session)
            .map(|s| s.committed)
            .ok_or_else(|| TransferError::RemoteNotFound(handle.session.clone()))?;

        if offset > committed {
            return Err(TransferError::Protocol(format!(
                "chunk at {offset} leaves a gap after {committed}"
            )));
        }
        let end = offset + data.len() as u64;
        if end > handle.total_bytes {
            return Err(TransferError::Protocol(format!(
                "chunk ends at {end}, past the declared {} bytes",
                handle.total_bytes
            )));
        }

        match fault {
            Some(false) => {
                warn!(offset, "Simulated connection reset before chunk was stored");
                return Err(TransferError::Network("simulated connection reset".into()));
            }
            Some(true) => {
                self.write_at(&handle.session, offset, &data).await?;
                if let Some(session) = state.sessions.get_mut(&handle.session) {
                    session.committed = end;
                }
                warn!(offset, "Simulated connection reset after chunk was stored");
                return Err(TransferError::Network("simulated connection reset".into()));
            }
            None => {}
        }

        self.write_at(&handle.session, offset, &data).await?;
        if let Some(session) = state.sessions.get_mut(&handle.session) {
            session.committed = end;
        }

        if end == handle.total_bytes {
            let entry = self.finish_upload(&mut state, &handle.session).await?;
            return Ok(ChunkAck::Complete(entry));
        }
        Ok(ChunkAck::Incomplete { committed: end })
    }

    async fn committed_offset(&self, handle: &UploadHandle) -> Result<ChunkAck, TransferError> {
        let mut state = self.state.lock().await;
        let committed = state
            .sessions
            .get(&handle.session)
            .map(|s| s.committed)
            .ok_or_else(|| TransferError::RemoteNotFound(handle.session.clone()))?;

        // The final chunk landed but its reply was lost.
        if committed == handle.total_bytes && handle.total_bytes > 0 {
            let entry = self.finish_upload(&mut state, &handle.session).await?;
            return Ok(ChunkAck::Complete(entry));
        }
        Ok(ChunkAck::Incomplete { committed })
    }

    async fn stat(&self, file_id: &str) -> Result<RemoteEntry, TransferError> {
        self.state.lock().await.entry(file_id)
    }

    async fn read_range(
        &self,
        file_id: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, TransferError> {
        self.wait_out_stall().await;
        let mut state = self.state.lock().await;
        let entry = state.entry(file_id)?;

        state.download_calls += 1;
        if state.download_fault_at == Some(state.download_calls) {
            warn!(offset, "Simulated download interruption");
            return Err(TransferError::Network("simulated download interruption".into()));
        }
        drop(state);

        if offset >= entry.size || len == 0 {
            return Ok(Vec::new());
        }

        let take = len.min(entry.size - offset);
        let mut file = tokio::fs::File::open(self.blob_path(file_id)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0u8; take as usize];
        file.read_exact(&mut buffer).await?;
        Ok(buffer)
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), TransferError> {
        let mut state = self.state.lock().await;
        if state.catalog.files.remove(file_id).is_none() {
            return Err(TransferError::RemoteNotFound(file_id.to_string()));
        }
        self.save_catalog(&state.catalog).await?;

        match tokio::fs::remove_file(self.blob_path(file_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
