//! Per-file access/modification timestamps recorded at backup time and
//! replayed after extraction.
//!
//! The on-disk form is a flat JSON object keyed by forward-slash relative
//! path:
//!
//! ```json
//! { "a/b.txt": { "accessTime": "2024-05-01T10:00:00Z", "modifiedTime": "2024-05-01T09:00:00Z" } }
//! ```

use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::MetadataError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTimes {
    #[serde(alias = "access_time", with = "iso8601")]
    pub access_time: DateTime<Utc>,
    #[serde(alias = "modified_time", with = "iso8601")]
    pub modified_time: DateTime<Utc>,
}

/// One entry of the mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub relative_path: String,
    pub times: FileTimes,
}

/// Counts from a timestamp replay.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataStore {
    entries: BTreeMap<String, FileTimes>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `relative_path`.
    pub fn record(
        &mut self,
        relative_path: impl Into<String>,
        access_time: DateTime<Utc>,
        modified_time: DateTime<Utc>,
    ) {
        self.entries.insert(
            relative_path.into(),
            FileTimes {
                access_time,
                modified_time,
            },
        );
    }

    /// Record every regular file under `source`. Symlinks are not followed
    /// and not recorded.
    pub fn scan(source: &Path) -> Result<Self, MetadataError> {
        let mut store = Self::new();

        for entry in WalkDir::new(source).follow_links(false) {
            let entry = entry.map_err(|e| {
                MetadataError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
                )
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| {
                MetadataError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("metadata read failed")),
                )
            })?;

            let Ok(relative) = entry.path().strip_prefix(source) else {
                continue;
            };

            store.record(
                to_key(relative),
                from_file_time(FileTime::from_last_access_time(&metadata)),
                from_file_time(FileTime::from_last_modification_time(&metadata)),
            );
        }

        debug!(files = store.len(), source = %source.display(), "Recorded file timestamps");
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileTimes> {
        self.entries.get(relative_path)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = FileRecord> + '_ {
        self.entries.iter().map(|(path, times)| FileRecord {
            relative_path: path.clone(),
            times: *times,
        })
    }

    /// Write the mapping to `path` through a temporary sibling file.
    pub fn persist(&self, path: &Path) -> Result<(), MetadataError> {
        let encoded = serde_json::to_vec_pretty(self)?;

        let tmp = partial_path(path);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }

        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let raw = fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|source| MetadataError::CorruptMetadata {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Set atime/mtime for each recorded file that exists under `base_dir`.
    ///
    /// Missing files and keys that would escape `base_dir` are skipped.
    pub fn apply_timestamps(&self, base_dir: &Path) -> Result<ApplyReport, MetadataError> {
        let mut report = ApplyReport::default();

        for (key, times) in &self.entries {
            let Some(relative) = safe_relative_path(key) else {
                warn!(path = %key, "Skipping metadata entry outside the restore root");
                report.skipped += 1;
                continue;
            };

            let path = base_dir.join(relative);
            if !path.is_file() {
                debug!(path = %key, "Skipping timestamps for missing file");
                report.skipped += 1;
                continue;
            }

            filetime::set_file_times(
                &path,
                to_file_time(times.access_time),
                to_file_time(times.modified_time),
            )?;
            report.applied += 1;
        }

        Ok(report)
    }
}

/// `backup_x.7z` -> `backup_x.metadata.json`, next to the archive.
pub fn metadata_path_for(archive: &Path) -> PathBuf {
    archive.with_file_name(metadata_name_for(
        &archive.file_name().unwrap_or_default().to_string_lossy(),
    ))
}

pub fn metadata_name_for(archive_name: &str) -> String {
    let stem = Path::new(archive_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| archive_name.to_string());
    format!("{stem}.metadata.json")
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

fn to_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn safe_relative_path(key: &str) -> Option<PathBuf> {
    let path = Path::new(key);
    if path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn from_file_time(ft: FileTime) -> DateTime<Utc> {
    DateTime::from_timestamp(ft.unix_seconds(), ft.nanoseconds()).unwrap_or_default()
}

fn to_file_time(dt: DateTime<Utc>) -> FileTime {
    FileTime::from_unix_time(dt.timestamp(), dt.timestamp_subsec_nanos())
}

/// RFC 3339 on write. On read, also accepts naive ISO-8601 strings
/// (interpreted as local time) as written by older tools.
mod iso8601 {
    use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;

        if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(dt.with_timezone(&Utc));
        }

        let naive: NaiveDateTime = raw
            .parse()
            .map_err(|e| D::Error::custom(format!("invalid timestamp '{raw}': {e}")))?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| D::Error::custom(format!("nonexistent local time '{raw}'")))
    }
}
