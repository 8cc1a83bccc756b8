//! Remote object stores that hold the archives.
//!
//! - `drive`: Google Drive v3 over HTTPS
//! - `simulated`: a local directory standing in for the remote, used in
//!   simulation mode and tests

mod drive;
mod simulated;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::core::credentials::{CachedCredentials, GoogleTokenSource};
use crate::core::models::{RemoteEntry, RemoteFolder};
use crate::error::TransferError;

pub use drive::GoogleDriveStore;
pub use simulated::{SimulatedStore, UploadFault};

pub const ARCHIVE_MIME: &str = "application/x-7z-compressed";
pub const METADATA_MIME: &str = "application/json";

/// What the remote needs to know before the first chunk.
#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub name: String,
    pub parent_id: String,
    pub mime_type: String,
    pub total_bytes: u64,
    pub checksum: Option<String>,
}

/// An open resumable upload.
#[derive(Debug, Clone)]
pub struct UploadHandle {
    pub session: String,
    pub total_bytes: u64,
}

/// Remote acknowledgement of a chunk.
#[derive(Debug, Clone)]
pub enum ChunkAck {
    /// Bytes `0..committed` are stored; continue from `committed`.
    Incomplete { committed: u64 },
    Complete(RemoteEntry),
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn list_folders(&self, name: &str) -> Result<Vec<RemoteFolder>, TransferError>;

    async fn create_folder(&self, name: &str) -> Result<String, TransferError>;

    /// Files directly inside `folder_id`, newest first.
    async fn list_files(
        &self,
        folder_id: &str,
        mime_filter: Option<&str>,
    ) -> Result<Vec<RemoteEntry>, TransferError>;

    async fn begin_upload(&self, meta: &UploadMetadata) -> Result<UploadHandle, TransferError>;

    /// Send `data` starting at `offset`. An empty chunk at offset 0 is only
    /// valid for an empty file.
    async fn put_chunk(
        &self,
        handle: &UploadHandle,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<ChunkAck, TransferError>;

    /// Ask how much of an interrupted upload the remote has kept.
    async fn committed_offset(&self, handle: &UploadHandle) -> Result<ChunkAck, TransferError>;

    async fn stat(&self, file_id: &str) -> Result<RemoteEntry, TransferError>;

    /// Up to `len` bytes starting at `offset`.
    async fn read_range(
        &self,
        file_id: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, TransferError>;

    async fn delete_file(&self, file_id: &str) -> Result<(), TransferError>;
}

/// Look up a folder by name, creating it when absent.
///
/// Sequential calls return the same id. Two processes racing on a missing
/// folder may each create one; the first match wins on later lookups.
pub async fn resolve_folder(store: &dyn RemoteStore, name: &str) -> Result<String, TransferError> {
    if let Some(folder) = store.list_folders(name).await?.into_iter().next() {
        return Ok(folder.id);
    }

    let id = store.create_folder(name).await?;
    info!(folder = %name, id = %id, "Created remote folder");
    Ok(id)
}

/// Look up a folder by name without creating it.
pub async fn find_folder(
    store: &dyn RemoteStore,
    name: &str,
) -> Result<Option<String>, TransferError> {
    Ok(store
        .list_folders(name)
        .await?
        .into_iter()
        .next()
        .map(|f| f.id))
}

pub fn get_store(config: &AppConfig) -> Result<Arc<dyn RemoteStore>> {
    if config.simulation {
        info!(root = %config.simulation_root.display(), "Using simulated remote store");
        return Ok(Arc::new(SimulatedStore::open(&config.simulation_root)?));
    }

    let source = GoogleTokenSource::new(
        config.token_url.clone(),
        config.client_id.clone().unwrap_or_default(),
        config.client_secret.clone().unwrap_or_default(),
    );
    let credentials = CachedCredentials::from_file(config.credentials_path.clone(), source);

    Ok(Arc::new(GoogleDriveStore::new(
        config.drive_api_base.clone(),
        config.drive_upload_base.clone(),
        Arc::new(credentials),
        config.chunk_timeout(),
    )?))
}
