//! Google Drive store tests against an in-process fake of the Drive v3
//! endpoints the store uses.

mod common;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bkdrive::core::ProgressTracker;
use bkdrive::core::credentials::{Credential, StaticCredentials};
use bkdrive::core::transfer_engine::{TransferEngine, TransferOptions};
use bkdrive::error::TransferError;
use bkdrive::remote::{
    ARCHIVE_MIME, GoogleDriveStore, METADATA_MIME, RemoteStore, UploadMetadata, resolve_folder,
};
use chrono::{DateTime, Utc};
use common::pattern_bytes;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "good-token";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const PAGE_SIZE: usize = 2;

struct FakeFile {
    name: String,
    parent: String,
    mime_type: String,
    data: Vec<u8>,
    modified: DateTime<Utc>,
    properties: Value,
}

struct FakeSession {
    name: String,
    parent: String,
    mime_type: String,
    total: usize,
    data: Vec<u8>,
    properties: Value,
    file_id: Option<String>,
}

#[derive(Default)]
struct Fake {
    base: String,
    next_id: u32,
    folders: Vec<(String, String)>,
    files: BTreeMap<String, FakeFile>,
    sessions: HashMap<String, FakeSession>,
    quota_full: bool,
    ignore_range: bool,
    /// 1-based chunk PUT whose reply is replaced by a 503 after the data is kept.
    drop_reply_at: Option<u32>,
    chunk_puts: u32,
    media_reads: u32,
}

impl Fake {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn seed_file(&mut self, name: &str, parent: &str, mime_type: &str, data: &[u8]) -> String {
        let id = self.id("file");
        let modified = Utc::now() + chrono::Duration::seconds(self.next_id as i64);
        self.files.insert(
            id.clone(),
            FakeFile {
                name: name.to_string(),
                parent: parent.to_string(),
                mime_type: mime_type.to_string(),
                data: data.to_vec(),
                modified,
                properties: json!({}),
            },
        );
        id
    }
}

type Shared = Arc<Mutex<Fake>>;

fn file_json(id: &str, file: &FakeFile) -> Value {
    json!({
        "id": id,
        "name": file.name,
        "size": file.data.len().to_string(),
        "modifiedTime": file.modified.to_rfc3339(),
        "appProperties": file.properties,
    })
}

fn error(status: StatusCode, reason: &str) -> Response {
    let body = json!({ "error": { "code": status.as_u16(), "errors": [{ "reason": reason }] } });
    (status, Json(body)).into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(format!("Bearer {TOKEN}").as_str())
}

fn unescape(value: &str) -> String {
    value.replace("\\'", "'").replace("\\\\", "\\")
}

fn quoted_after(q: &str, prefix: &str) -> Option<String> {
    let re = Regex::new(&format!(r"{}'((?:[^'\\]|\\.)*)'", regex::escape(prefix))).ok()?;
    re.captures(q).map(|c| unescape(&c[1]))
}

async fn list_files(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "authError");
    }
    let fake = state.lock().unwrap();
    let q = params.get("q").cloned().unwrap_or_default();

    let matches: Vec<Value> = if q.contains(&format!("mimeType = '{FOLDER_MIME}'")) {
        let name = quoted_after(&q, "name = ").unwrap_or_default();
        fake.folders
            .iter()
            .filter(|(_, n)| *n == name)
            .map(|(id, n)| json!({ "id": id, "name": n }))
            .collect()
    } else {
        let parent = q
            .strip_prefix('\'')
            .and_then(|rest| rest.split("' in parents").next())
            .map(unescape)
            .unwrap_or_default();
        let mime = quoted_after(&q, " and mimeType = ");
        fake.files
            .iter()
            .filter(|(_, f)| f.parent == parent)
            .filter(|(_, f)| mime.as_ref().is_none_or(|m| *m == f.mime_type))
            .map(|(id, f)| file_json(id, f))
            .collect()
    };

    let start: usize = params
        .get("pageToken")
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);
    let start = start.min(matches.len());
    let end = (start + PAGE_SIZE).min(matches.len());

    let mut body = json!({ "files": matches[start..end].to_vec() });
    if end < matches.len() {
        body["nextPageToken"] = json!(end.to_string());
    }
    Json(body).into_response()
}

async fn create_folder(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "authError");
    }
    let mut fake = state.lock().unwrap();
    let id = fake.id("folder");
    let name = body["name"].as_str().unwrap_or_default().to_string();
    fake.folders.push((id.clone(), name));
    Json(json!({ "id": id })).into_response()
}

async fn begin_upload(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "authError");
    }
    if params.get("uploadType").map(String::as_str) != Some("resumable") {
        return error(StatusCode::BAD_REQUEST, "badRequest");
    }

    let mut fake = state.lock().unwrap();
    if fake.quota_full {
        return error(StatusCode::FORBIDDEN, "storageQuotaExceeded");
    }

    let total = headers
        .get("X-Upload-Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let sid = fake.id("session");
    let session = FakeSession {
        name: body["name"].as_str().unwrap_or_default().to_string(),
        parent: body["parents"][0].as_str().unwrap_or_default().to_string(),
        mime_type: body["mimeType"].as_str().unwrap_or_default().to_string(),
        total,
        data: Vec::new(),
        properties: body.get("appProperties").cloned().unwrap_or_else(|| json!({})),
        file_id: None,
    };
    fake.sessions.insert(sid.clone(), session);

    let location = format!("{}/upload/session/{sid}", fake.base);
    (StatusCode::OK, [(header::LOCATION, location)]).into_response()
}

fn incomplete(committed: usize) -> Response {
    if committed == 0 {
        return StatusCode::PERMANENT_REDIRECT.into_response();
    }
    (
        StatusCode::PERMANENT_REDIRECT,
        [(header::RANGE, format!("bytes=0-{}", committed - 1))],
    )
        .into_response()
}

fn finish_session(fake: &mut Fake, sid: &str) -> Response {
    let existing = fake.sessions.get(sid).and_then(|s| s.file_id.clone());
    let id = match existing {
        Some(id) => id,
        None => {
            let id = fake.id("file");
            let modified = Utc::now() + chrono::Duration::seconds(fake.next_id as i64);
            let Some(session) = fake.sessions.get_mut(sid) else {
                return error(StatusCode::NOT_FOUND, "notFound");
            };
            session.file_id = Some(id.clone());
            let file = FakeFile {
                name: session.name.clone(),
                parent: session.parent.clone(),
                mime_type: session.mime_type.clone(),
                data: session.data.clone(),
                modified,
                properties: session.properties.clone(),
            };
            fake.files.insert(id.clone(), file);
            id
        }
    };
    match fake.files.get(&id) {
        Some(file) => Json(file_json(&id, file)).into_response(),
        None => error(StatusCode::NOT_FOUND, "notFound"),
    }
}

async fn put_chunk(
    State(state): State<Shared>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "authError");
    }
    let mut fake = state.lock().unwrap();
    let range = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let Some(session) = fake.sessions.get_mut(&sid) else {
        return error(StatusCode::NOT_FOUND, "notFound");
    };

    // Status query
    if range.starts_with("bytes */") {
        if session.file_id.is_some() || session.data.len() == session.total {
            return finish_session(&mut fake, &sid);
        }
        return incomplete(session.data.len());
    }

    let start: usize = range
        .strip_prefix("bytes ")
        .and_then(|r| r.split('-').next())
        .and_then(|s| s.parse().ok())
        .unwrap_or(usize::MAX);
    if start > session.data.len() {
        return error(StatusCode::BAD_REQUEST, "badContentRange");
    }
    session.data.truncate(start);
    session.data.extend_from_slice(&body);
    let committed = session.data.len();
    let total = session.total;

    fake.chunk_puts += 1;
    if fake.drop_reply_at == Some(fake.chunk_puts) {
        return error(StatusCode::SERVICE_UNAVAILABLE, "backendError");
    }

    if committed >= total {
        finish_session(&mut fake, &sid)
    } else {
        incomplete(committed)
    }
}

async fn get_file(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "authError");
    }
    let mut fake = state.lock().unwrap();
    let ignore_range = fake.ignore_range;
    if params.get("alt").map(String::as_str) == Some("media") {
        fake.media_reads += 1;
    }
    let Some(file) = fake.files.get(&id) else {
        return error(StatusCode::NOT_FOUND, "notFound");
    };

    if params.get("alt").map(String::as_str) != Some("media") {
        return Json(file_json(&id, file)).into_response();
    }

    let requested = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.split_once('-'))
        .and_then(|(s, e)| Some((s.parse::<usize>().ok()?, e.parse::<usize>().ok()?)));

    match requested {
        Some((start, end)) if !ignore_range => {
            if start >= file.data.len() {
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            }
            let end = end.min(file.data.len() - 1);
            (
                StatusCode::PARTIAL_CONTENT,
                file.data[start..=end].to_vec(),
            )
                .into_response()
        }
        _ => (StatusCode::OK, file.data.clone()).into_response(),
    }
}

async fn delete_file(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "authError");
    }
    match state.lock().unwrap().files.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => error(StatusCode::NOT_FOUND, "notFound"),
    }
}

async fn spawn_fake() -> (String, Shared) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let state: Shared = Arc::new(Mutex::new(Fake {
        base: base.clone(),
        ..Fake::default()
    }));

    let app = Router::new()
        .route("/drive/v3/files", get(list_files).post(create_folder))
        .route("/drive/v3/files/{id}", get(get_file).delete(delete_file))
        .route("/upload/drive/v3/files", post(begin_upload))
        .route("/upload/session/{id}", put(put_chunk))
        .with_state(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (base, state)
}

fn drive(base: &str, token: &str) -> Arc<GoogleDriveStore> {
    let credential = Credential {
        access_token: token.to_string(),
        refresh_token: None,
        expires_at: Utc::now() + chrono::Duration::hours(1),
    };
    Arc::new(
        GoogleDriveStore::new(
            format!("{base}/drive/v3"),
            format!("{base}/upload/drive/v3"),
            Arc::new(StaticCredentials(credential)),
            Duration::from_secs(10),
        )
        .unwrap(),
    )
}

fn engine(store: Arc<GoogleDriveStore>, chunk_size: u64) -> TransferEngine {
    TransferEngine::new(
        store,
        TransferOptions {
            chunk_size,
            chunk_timeout: Duration::from_secs(10),
            chunk_retries: 2,
        },
        CancellationToken::new(),
        ProgressTracker::new(),
    )
}

#[tokio::test]
async fn test_folder_is_created_once() {
    let (base, fake) = spawn_fake().await;
    let store = drive(&base, TOKEN);

    let first = resolve_folder(store.as_ref(), "Bob's Backups").await.unwrap();
    let second = resolve_folder(store.as_ref(), "Bob's Backups").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(fake.lock().unwrap().folders.len(), 1);
    assert_eq!(fake.lock().unwrap().folders[0].1, "Bob's Backups");
}

#[tokio::test]
async fn test_upload_and_download_in_chunks() {
    let (base, fake) = spawn_fake().await;
    let store = drive(&base, TOKEN);
    let folder = resolve_folder(store.as_ref(), "Backups").await.unwrap();
    let engine = engine(store.clone(), 1024);

    let temp = tempdir().unwrap();
    let data = pattern_bytes(3000);
    let local = temp.path().join("docs_2024-05-01_10-00-00.7z");
    std::fs::write(&local, &data).unwrap();

    let (tx, _rx) = mpsc::channel(256);
    let entry = engine.upload(&local, &folder, ARCHIVE_MIME, tx).await.unwrap();

    assert_eq!(entry.size, 3000);
    assert_eq!(
        entry.checksum.as_deref(),
        Some(blake3::hash(&data).to_hex().as_str())
    );
    assert_eq!(fake.lock().unwrap().chunk_puts, 3);
    assert_eq!(fake.lock().unwrap().files[&entry.id].data, data);

    let restored = temp.path().join("download/docs.7z");
    let (tx, _rx) = mpsc::channel(256);
    engine.download_entry(&entry, &restored, tx).await.unwrap();

    assert_eq!(std::fs::read(&restored).unwrap(), data);
    assert_eq!(fake.lock().unwrap().media_reads, 3);
}

#[tokio::test]
async fn test_upload_resumes_after_lost_reply() {
    let (base, fake) = spawn_fake().await;
    let store = drive(&base, TOKEN);
    let folder = resolve_folder(store.as_ref(), "Backups").await.unwrap();
    let engine = engine(store.clone(), 1024);
    fake.lock().unwrap().drop_reply_at = Some(2);

    let temp = tempdir().unwrap();
    let data = pattern_bytes(3000);
    let local = temp.path().join("big.7z");
    std::fs::write(&local, &data).unwrap();

    let (tx, _rx) = mpsc::channel(256);
    let entry = engine.upload(&local, &folder, ARCHIVE_MIME, tx).await.unwrap();

    // The second chunk was kept, so only the third is sent again
    assert_eq!(fake.lock().unwrap().chunk_puts, 3);
    assert_eq!(fake.lock().unwrap().files[&entry.id].data, data);
}

#[tokio::test]
async fn test_download_from_server_ignoring_range() {
    let (base, fake) = spawn_fake().await;
    let store = drive(&base, TOKEN);
    let data = pattern_bytes(2500);
    let id = {
        let mut fake = fake.lock().unwrap();
        fake.ignore_range = true;
        fake.seed_file("plain.7z", "root", ARCHIVE_MIME, &data)
    };

    let temp = tempdir().unwrap();
    let local = temp.path().join("plain.7z");
    let (tx, _rx) = mpsc::channel(256);
    engine(store, 1000)
        .download(&id, &local, 2500, tx)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&local).unwrap(), data);
}

#[tokio::test]
async fn test_listing_pages_and_filters_by_type() {
    let (base, fake) = spawn_fake().await;
    let store = drive(&base, TOKEN);
    let folder = resolve_folder(store.as_ref(), "Backups").await.unwrap();
    {
        let mut fake = fake.lock().unwrap();
        fake.seed_file("a_2024-01-01_00-00-00.7z", &folder, ARCHIVE_MIME, b"a");
        fake.seed_file("a_2024-01-01_00-00-00.metadata.json", &folder, METADATA_MIME, b"{}");
        fake.seed_file("b_2024-02-01_00-00-00.7z", &folder, ARCHIVE_MIME, b"bb");
        fake.seed_file("c_2024-03-01_00-00-00.7z", &folder, ARCHIVE_MIME, b"ccc");
        fake.seed_file("elsewhere.7z", "other", ARCHIVE_MIME, b"x");
    }

    let archives = store.list_files(&folder, Some(ARCHIVE_MIME)).await.unwrap();
    let names: Vec<&str> = archives.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "c_2024-03-01_00-00-00.7z",
            "b_2024-02-01_00-00-00.7z",
            "a_2024-01-01_00-00-00.7z"
        ]
    );
    assert_eq!(archives[0].size, 3);

    let everything = store.list_files(&folder, None).await.unwrap();
    assert_eq!(everything.len(), 4);
}

#[tokio::test]
async fn test_rejected_token_is_an_auth_error() {
    let (base, _fake) = spawn_fake().await;
    let store = drive(&base, "stale-token");

    let err = store.list_folders("Backups").await.unwrap_err();
    assert!(matches!(err, TransferError::Auth(_)), "got {err:?}");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_full_quota() {
    let (base, fake) = spawn_fake().await;
    let store = drive(&base, TOKEN);
    fake.lock().unwrap().quota_full = true;

    let err = store
        .begin_upload(&UploadMetadata {
            name: "x.7z".to_string(),
            parent_id: "root".to_string(),
            mime_type: ARCHIVE_MIME.to_string(),
            total_bytes: 10,
            checksum: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::QuotaExceeded(_)), "got {err:?}");
}

#[tokio::test]
async fn test_missing_and_deleted_files() {
    let (base, fake) = spawn_fake().await;
    let store = drive(&base, TOKEN);

    let err = store.stat("nope").await.unwrap_err();
    assert!(matches!(err, TransferError::RemoteNotFound(_)));

    let id = fake
        .lock()
        .unwrap()
        .seed_file("gone.7z", "root", ARCHIVE_MIME, b"data");
    assert_eq!(store.stat(&id).await.unwrap().size, 4);

    // Past the end reads as empty
    assert!(store.read_range(&id, 4, 10).await.unwrap().is_empty());

    store.delete_file(&id).await.unwrap();
    let err = store.read_range(&id, 0, 4).await.unwrap_err();
    assert!(matches!(err, TransferError::RemoteNotFound(_)));
}
