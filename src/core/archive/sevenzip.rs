use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use super::progress::{LineSplitter, ProgressParser};
use super::{ArchiveBackend, ArchiveFuture, partial_path};
use crate::error::ArchiveError;

/// Non-progress output lines kept for error classification.
const OUTPUT_TAIL_LINES: usize = 20;

/// Archive backend driving the `7z` command line tool.
///
/// Arguments are passed as a vector, never through a shell. Progress is
/// read from `-bsp1` output on stdout.
pub struct SevenZipBackend {
    binary: PathBuf,
    cancel: CancellationToken,
}

impl SevenZipBackend {
    pub fn new(binary: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            binary: binary.into(),
            cancel,
        }
    }
}

impl ArchiveBackend for SevenZipBackend {
    fn name(&self) -> &'static str {
        "7z"
    }

    fn extension(&self) -> &'static str {
        "7z"
    }

    // 7z keeps mtime but drops atime unless asked
    fn preserves_timestamps(&self) -> bool {
        false
    }

    fn create_archive(
        &self,
        source: &Path,
        destination: &Path,
        password: Option<&str>,
        progress: mpsc::Sender<u8>,
    ) -> ArchiveFuture<PathBuf> {
        let binary = self.binary.clone();
        let cancel = self.cancel.clone();
        let source = source.to_path_buf();
        let destination = destination.to_path_buf();
        let password = password.map(str::to_string);

        Box::pin(async move {
            if !source.is_dir() {
                return Err(ArchiveError::SourceNotFound(source));
            }

            let destination = std::path::absolute(&destination)?;
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            // 7z would update an existing file in place
            let partial = partial_path(&destination);
            if partial.exists() {
                tokio::fs::remove_file(&partial).await?;
            }

            let inside_source = partial.starts_with(std::path::absolute(&source)?);
            let args = create_args(&partial, password.as_deref(), inside_source);

            let span = info_span!(
                "archive_create",
                source = %source.display(),
                archive = %destination.display()
            );

            async {
                info!(encrypted = password.is_some(), "Creating archive");

                let output = run_tool(&binary, args, Some(&source), progress, &cancel).await;

                match output {
                    Ok(out) if out.status.success() => {
                        tokio::fs::rename(&partial, &destination).await?;
                        let size = tokio::fs::metadata(&destination).await?.len();
                        info!(bytes = size, "Archive created");
                        Ok(destination.clone())
                    }
                    Ok(out) => {
                        discard_file(&partial).await;
                        Err(classify_failure(out))
                    }
                    Err(e) => {
                        discard_file(&partial).await;
                        Err(e)
                    }
                }
            }
            .instrument(span)
            .await
        })
    }

    fn extract_archive(
        &self,
        archive: &Path,
        target: &Path,
        password: Option<&str>,
        progress: mpsc::Sender<u8>,
    ) -> ArchiveFuture<()> {
        let binary = self.binary.clone();
        let cancel = self.cancel.clone();
        let archive = archive.to_path_buf();
        let target = target.to_path_buf();
        let password = password.map(str::to_string);

        Box::pin(async move {
            if !archive.is_file() {
                return Err(ArchiveError::ArchiveNotFound(archive));
            }

            let archive = std::path::absolute(&archive)?;
            let target = std::path::absolute(&target)?;
            let parent = target
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"));
            tokio::fs::create_dir_all(&parent).await?;

            // Extract beside the target and move in only after success, so a
            // bad password never touches the requested layout.
            let target_name = target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "restore".to_string());
            let staging = parent.join(format!(".{}.restore-{}", target_name, Uuid::now_v7()));

            let mut args: Vec<OsString> = vec![
                "x".into(),
                archive.clone().into_os_string(),
                format!("-o{}", staging.display()).into(),
                "-aoa".into(),
                "-bsp1".into(),
                "-y".into(),
            ];
            if let Some(pw) = &password {
                args.push(format!("-p{pw}").into());
            }

            let span = info_span!(
                "archive_extract",
                archive = %archive.display(),
                target = %target.display()
            );

            async {
                info!("Extracting archive");

                let output = run_tool(&binary, args, None, progress, &cancel).await;

                match output {
                    Ok(out) if out.status.success() => {
                        let (from, to) = (staging.clone(), target.clone());
                        tokio::task::spawn_blocking(move || promote_tree(&from, &to))
                            .await
                            .map_err(io::Error::other)??;
                        info!("Archive extracted");
                        Ok(())
                    }
                    Ok(out) => {
                        discard_dir(&staging).await;
                        Err(classify_failure(out))
                    }
                    Err(e) => {
                        discard_dir(&staging).await;
                        Err(e)
                    }
                }
            }
            .instrument(span)
            .await
        })
    }
}

struct ToolOutput {
    status: ExitStatus,
    stderr: String,
    stdout_tail: VecDeque<String>,
}

/// Spawn the archiver, forward progress, and collect its exit status.
///
/// The child is killed if `cancel` fires before it exits.
async fn run_tool(
    binary: &Path,
    args: Vec<OsString>,
    cwd: Option<&Path>,
    progress: mpsc::Sender<u8>,
    cancel: &CancellationToken,
) -> Result<ToolOutput, ArchiveError> {
    let mut command = Command::new(binary);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            ArchiveError::ToolMissing(binary.display().to_string())
        } else {
            ArchiveError::Io(e)
        }
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("archiver stdout unavailable"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("archiver stderr unavailable"))?;

    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf).await;
        buf
    });

    let run = async move {
        let mut reader = BufReader::new(stdout);
        let mut splitter = LineSplitter::new();
        let mut parser = ProgressParser::new();
        let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        let mut chunk = [0u8; 4096];

        loop {
            let n = reader.read(&mut chunk).await?;
            let lines = if n == 0 {
                splitter.finish().into_iter().collect()
            } else {
                splitter.push(&chunk[..n])
            };

            for line in lines {
                if let Some(percentage) = parser.feed(&line) {
                    let _ = progress.send(percentage).await;
                } else if !line.trim().is_empty() {
                    if tail.len() == OUTPUT_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }

            if n == 0 {
                break;
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        debug!(status = %status, "Archiver exited");

        Ok::<_, ArchiveError>(ToolOutput {
            status,
            stderr,
            stdout_tail: tail,
        })
    };

    tokio::select! {
        output = run => output,
        _ = cancel.cancelled() => {
            warn!("Archiver cancelled");
            Err(ArchiveError::Cancelled)
        }
    }
}

fn classify_failure(output: ToolOutput) -> ArchiveError {
    let tail = output
        .stdout_tail
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n");

    let wrong_password = [output.stderr.as_str(), tail.as_str()].iter().any(|text| {
        text.contains("Wrong password") || text.contains("Can not open encrypted archive")
    });
    if wrong_password {
        return ArchiveError::BadPassword;
    }

    let stderr = output.stderr.trim();
    ArchiveError::ToolFailure {
        exit_code: output.status.code(),
        stderr: if stderr.is_empty() {
            tail
        } else {
            stderr.to_string()
        },
    }
}

/// Move everything under `staging` into `target`, replacing what is there,
/// then remove `staging`.
fn promote_tree(staging: &Path, target: &Path) -> io::Result<()> {
    fs::create_dir_all(target)?;

    let entries = WalkDir::new(staging)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(io::Error::from)?;

    for entry in entries {
        let relative = entry
            .path()
            .strip_prefix(staging)
            .map_err(io::Error::other)?;
        let dest = target.join(relative);
        let existing = fs::symlink_metadata(&dest).ok();

        if entry.file_type().is_dir() {
            if existing.is_some_and(|m| !m.is_dir()) {
                fs::remove_file(&dest)?;
            }
            fs::create_dir_all(&dest)?;
        } else {
            if existing.is_some_and(|m| m.is_dir()) {
                fs::remove_dir_all(&dest)?;
            }
            fs::rename(entry.path(), &dest)?;
        }
    }

    fs::remove_dir_all(staging)
}

async fn discard_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial archive");
        }
    }
}

async fn discard_dir(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove staging directory");
        }
    }
}

/// Arguments for `7z a`, run from inside the source directory.
///
/// `-snl` keeps symlinks as links so their targets never enter the archive
/// without a timestamp record.
fn create_args(partial: &Path, password: Option<&str>, exclude_partial: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "a".into(),
        "-t7z".into(),
        "-mx=9".into(),
        "-snl".into(),
        "-bsp1".into(),
        "-y".into(),
    ];
    if let Some(pw) = password {
        args.push("-mhe=on".into());
        args.push(format!("-p{pw}").into());
    }
    if exclude_partial {
        let name = partial.file_name().unwrap_or_default().to_string_lossy();
        args.push(format!("-xr!{name}").into());
    }
    args.push(partial.as_os_str().to_os_string());
    args.push(".".into());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[cfg(unix)]
    fn exit_status(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_wrong_password() {
        let output = ToolOutput {
            status: exit_status(2),
            stderr: "ERROR: Wrong password : secret.txt\n".to_string(),
            stdout_tail: VecDeque::new(),
        };
        assert!(matches!(classify_failure(output), ArchiveError::BadPassword));
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_encrypted_header_from_stdout() {
        let mut tail = VecDeque::new();
        tail.push_back("Can not open encrypted archive. Wrong password?".to_string());
        let output = ToolOutput {
            status: exit_status(2),
            stderr: String::new(),
            stdout_tail: tail,
        };
        assert!(matches!(classify_failure(output), ArchiveError::BadPassword));
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_generic_failure_keeps_exit_code() {
        let output = ToolOutput {
            status: exit_status(7),
            stderr: "Command line error\n".to_string(),
            stdout_tail: VecDeque::new(),
        };
        match classify_failure(output) {
            ArchiveError::ToolFailure { exit_code, stderr } => {
                assert_eq!(exit_code, Some(7));
                assert_eq!(stderr, "Command line error");
            }
            other => panic!("expected ToolFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_create_args_store_symlinks_as_links() {
        let args = create_args(Path::new("/src/out.7z.partial"), Some("pw"), true);
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(args[0], "a");
        assert!(args.contains(&"-snl".to_string()));
        assert!(args.contains(&"-mhe=on".to_string()));
        assert!(args.contains(&"-xr!out.7z.partial".to_string()));
        assert_eq!(&args[args.len() - 2..], ["/src/out.7z.partial", "."]);
    }

    #[test]
    fn test_promote_tree_overwrites_and_removes_staging() {
        let temp = tempdir().unwrap();
        let staging = temp.path().join("staging");
        let target = temp.path().join("target");

        fs::create_dir_all(staging.join("a")).unwrap();
        fs::write(staging.join("a/b.txt"), b"new").unwrap();
        fs::write(staging.join("c.txt"), b"world").unwrap();

        fs::create_dir_all(target.join("a")).unwrap();
        fs::write(target.join("a/b.txt"), b"old").unwrap();
        fs::write(target.join("keep.txt"), b"untouched").unwrap();

        promote_tree(&staging, &target).unwrap();

        assert_eq!(fs::read(target.join("a/b.txt")).unwrap(), b"new");
        assert_eq!(fs::read(target.join("c.txt")).unwrap(), b"world");
        assert_eq!(fs::read(target.join("keep.txt")).unwrap(), b"untouched");
        assert!(!staging.exists());
    }

    #[test]
    fn test_promote_tree_replaces_file_with_directory() {
        let temp = tempdir().unwrap();
        let staging = temp.path().join("staging");
        let target = temp.path().join("target");

        fs::create_dir_all(staging.join("docs")).unwrap();
        fs::write(staging.join("docs/readme.md"), b"hi").unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("docs"), b"was a file").unwrap();

        promote_tree(&staging, &target).unwrap();
        assert_eq!(fs::read(target.join("docs/readme.md")).unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_create_without_source_reports_missing_source() {
        let temp = tempdir().unwrap();
        let backend = SevenZipBackend::new("7z", CancellationToken::new());
        let (tx, _rx) = mpsc::channel(8);
        let dest = temp.path().join("out.7z");

        let err = backend
            .create_archive(&temp.path().join("missing"), &dest, None, tx)
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::SourceNotFound(_)));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let temp = tempdir().unwrap();
        let backend = SevenZipBackend::new(
            temp.path().join("no-such-7z"),
            CancellationToken::new(),
        );
        let (tx, _rx) = mpsc::channel(8);

        let err = backend
            .create_archive(temp.path(), &temp.path().join("out.7z"), None, tx)
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::ToolMissing(_)));
    }

    #[tokio::test]
    async fn test_extract_missing_archive() {
        let temp = tempdir().unwrap();
        let backend = SevenZipBackend::new("7z", CancellationToken::new());
        let (tx, _rx) = mpsc::channel(8);

        let err = backend
            .extract_archive(&temp.path().join("nope.7z"), temp.path(), None, tx)
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::ArchiveNotFound(_)));
    }
}
