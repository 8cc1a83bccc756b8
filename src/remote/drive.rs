use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, LOCATION, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ChunkAck, RemoteStore, UploadHandle, UploadMetadata};
use crate::core::credentials::CredentialProvider;
use crate::core::models::{RemoteEntry, RemoteFolder};
use crate::error::TransferError;

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,size,modifiedTime,appProperties";
const CHECKSUM_PROPERTY: &str = "blake3";
const PAGE_SIZE: &str = "100";

/// Google Drive v3 with resumable uploads and ranged downloads.
pub struct GoogleDriveStore {
    client: Client,
    api_base: String,
    upload_base: String,
    credentials: Arc<dyn CredentialProvider>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    /// Drive encodes int64 as a string.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    app_properties: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl DriveFile {
    fn into_entry(self) -> Result<RemoteEntry, TransferError> {
        let size = match self.size {
            Some(raw) => raw
                .parse()
                .map_err(|_| TransferError::Protocol(format!("bad size '{raw}' for {}", self.id)))?,
            None => 0,
        };

        Ok(RemoteEntry {
            id: self.id,
            name: self.name,
            size,
            modified: self.modified_time.unwrap_or_else(Utc::now),
            checksum: self.app_properties.get(CHECKSUM_PROPERTY).cloned(),
        })
    }
}

impl GoogleDriveStore {
    pub fn new(
        api_base: String,
        upload_base: String,
        credentials: Arc<dyn CredentialProvider>,
        request_timeout: Duration,
    ) -> Result<Self> {
        // 308 is the resumable-upload "keep going" reply, not a redirect.
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, TransferError> {
        let credential = self.credentials.get_valid().await?;
        Ok(request.bearer_auth(credential.access_token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TransferError> {
        self.authorized(request)
            .await?
            .send()
            .await
            .map_err(transport_error)
    }

    async fn list_query(&self, q: String) -> Result<Vec<DriveFile>, TransferError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.client.get(format!("{}/files", self.api_base)).query(&[
                ("q", q.as_str()),
                ("orderBy", "modifiedTime desc"),
                ("pageSize", PAGE_SIZE),
                ("spaces", "drive"),
                ("fields", "nextPageToken,files(id,name,size,modifiedTime,appProperties)"),
            ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = check(self.send(request).await?).await?;
            let page: FileList = response
                .json()
                .await
                .map_err(|e| TransferError::Protocol(format!("file list: {e}")))?;

            files.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(files)
    }

    async fn upload_status(
        &self,
        handle: &UploadHandle,
        response: Response,
    ) -> Result<ChunkAck, TransferError> {
        if response.status() == StatusCode::PERMANENT_REDIRECT {
            let committed = committed_from_range(response.headers())?;
            return Ok(ChunkAck::Incomplete { committed });
        }

        let response = check(response).await?;
        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| TransferError::Protocol(format!("upload response: {e}")))?;
        let reported_size = file.size.is_some();
        let mut entry = file.into_entry()?;

        if !reported_size {
            entry.size = handle.total_bytes;
        } else if entry.size != handle.total_bytes {
            return Err(TransferError::SizeMismatch {
                expected: handle.total_bytes,
                actual: entry.size,
            });
        }
        Ok(ChunkAck::Complete(entry))
    }
}

#[async_trait]
impl RemoteStore for GoogleDriveStore {
    fn name(&self) -> &'static str {
        "google-drive"
    }

    async fn list_folders(&self, name: &str) -> Result<Vec<RemoteFolder>, TransferError> {
        let q = format!(
            "mimeType = '{FOLDER_MIME}' and name = '{}' and trashed = false",
            escape_query(name)
        );
        Ok(self
            .list_query(q)
            .await?
            .into_iter()
            .map(|f| RemoteFolder {
                id: f.id,
                name: f.name,
            })
            .collect())
    }

    async fn create_folder(&self, name: &str) -> Result<String, TransferError> {
        let request = self
            .client
            .post(format!("{}/files", self.api_base))
            .query(&[("fields", "id")])
            .json(&json!({ "name": name, "mimeType": FOLDER_MIME }));

        let response = check(self.send(request).await?).await?;
        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| TransferError::Protocol(format!("create folder: {e}")))?;
        Ok(file.id)
    }

    async fn list_files(
        &self,
        folder_id: &str,
        mime_filter: Option<&str>,
    ) -> Result<Vec<RemoteEntry>, TransferError> {
        let mut q = format!(
            "'{}' in parents and trashed = false and mimeType != '{FOLDER_MIME}'",
            escape_query(folder_id)
        );
        if let Some(mime) = mime_filter {
            q.push_str(&format!(" and mimeType = '{}'", escape_query(mime)));
        }

        let mut entries = self
            .list_query(q)
            .await?
            .into_iter()
            .map(DriveFile::into_entry)
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(entries)
    }

    async fn begin_upload(&self, meta: &UploadMetadata) -> Result<UploadHandle, TransferError> {
        let mut body = json!({
            "name": meta.name,
            "parents": [meta.parent_id],
            "mimeType": meta.mime_type,
        });
        if let Some(checksum) = &meta.checksum {
            let mut properties = serde_json::Map::new();
            properties.insert(CHECKSUM_PROPERTY.to_string(), json!(checksum));
            body["appProperties"] = serde_json::Value::Object(properties);
        }

        let request = self
            .client
            .post(format!("{}/files", self.upload_base))
            .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
            .header("X-Upload-Content-Type", meta.mime_type.as_str())
            .header("X-Upload-Content-Length", meta.total_bytes.to_string())
            .json(&body);

        let response = check(self.send(request).await?).await?;
        let session = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TransferError::Protocol("resumable session without Location".into()))?
            .to_string();

        debug!(file = %meta.name, bytes = meta.total_bytes, "Opened resumable upload session");
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
        let range = if data.is_empty() {
            format!("bytes */{}", handle.total_bytes)
        } else {
            let end = offset + data.len() as u64 - 1;
            format!("bytes {offset}-{end}/{}", handle.total_bytes)
        };

        let request = self
            .client
            .put(&handle.session)
            .header(CONTENT_LENGTH, data.len())
            .header(CONTENT_RANGE, range)
            .body(data);

        let response = self.send(request).await?;
        self.upload_status(handle, response).await
    }

    async fn committed_offset(&self, handle: &UploadHandle) -> Result<ChunkAck, TransferError> {
        let request = self
            .client
            .put(&handle.session)
            .header(CONTENT_LENGTH, 0)
            .header(CONTENT_RANGE, format!("bytes */{}", handle.total_bytes));

        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!("Upload session expired");
        }
        self.upload_status(handle, response).await
    }

    async fn stat(&self, file_id: &str) -> Result<RemoteEntry, TransferError> {
        let request = self
            .client
            .get(format!("{}/files/{}", self.api_base, file_id))
            .query(&[("fields", FILE_FIELDS)]);

        let response = check(self.send(request).await?).await?;
        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| TransferError::Protocol(format!("file metadata: {e}")))?;
        file.into_entry()
    }

    async fn read_range(
        &self,
        file_id: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, TransferError> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let request = self
            .client
            .get(format!("{}/files/{}", self.api_base, file_id))
            .query(&[("alt", "media")])
            .header(RANGE, format!("bytes={}-{}", offset, offset + len - 1));

        let response = self.send(request).await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Vec::new());
        }
        let response = check(response).await?;
        let full_body = response.status() == StatusCode::OK;

        let bytes = response.bytes().await.map_err(transport_error)?;

        // A server that ignores Range sends the whole file.
        if full_body {
            let start = (offset as usize).min(bytes.len());
            let end = (start + len as usize).min(bytes.len());
            return Ok(bytes[start..end].to_vec());
        }
        Ok(bytes.to_vec())
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), TransferError> {
        let request = self
            .client
            .delete(format!("{}/files/{}", self.api_base, file_id));
        check(self.send(request).await?).await?;
        Ok(())
    }
}

/// Pass successful responses through, map everything else to a
/// `TransferError`.
async fn check(response: Response) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify(status, &body))
}

fn classify(status: StatusCode, body: &str) -> TransferError {
    let detail = format!("HTTP {status}: {}", summarize(body));

    match status {
        StatusCode::UNAUTHORIZED => TransferError::Auth(detail),
        StatusCode::FORBIDDEN if is_quota_error(body) => TransferError::QuotaExceeded(detail),
        StatusCode::FORBIDDEN if is_rate_limit(body) => TransferError::Network(detail),
        StatusCode::FORBIDDEN => TransferError::Auth(detail),
        StatusCode::NOT_FOUND => TransferError::RemoteNotFound(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            TransferError::Network(detail)
        }
        s if s.is_server_error() => TransferError::Network(detail),
        _ => TransferError::Protocol(detail),
    }
}

fn is_quota_error(body: &str) -> bool {
    body.contains("storageQuotaExceeded") || body.contains("quotaExceeded")
}

fn is_rate_limit(body: &str) -> bool {
    body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded")
}

fn summarize(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() > 200 {
        let cut = trimmed
            .char_indices()
            .take_while(|(i, _)| *i < 200)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &trimmed[..cut])
    } else {
        trimmed.to_string()
    }
}

fn transport_error(err: reqwest::Error) -> TransferError {
    TransferError::Network(err.to_string())
}

/// `Range: bytes=0-1048575` means 1048576 bytes are committed. No header
/// means nothing is.
fn committed_from_range(headers: &HeaderMap) -> Result<u64, TransferError> {
    let Some(value) = headers.get(RANGE) else {
        return Ok(0);
    };

    let raw = value
        .to_str()
        .map_err(|_| TransferError::Protocol("non-ASCII Range header".into()))?;
    let last = raw
        .trim()
        .strip_prefix("bytes=")
        .and_then(|r| r.split('-').nth(1))
        .and_then(|end| end.trim().parse::<u64>().ok())
        .ok_or_else(|| TransferError::Protocol(format!("malformed Range header '{raw}'")))?;

    Ok(last + 1)
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
