use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

use crate::error::TransferError;

const HASH_BUFFER_SIZE: usize = 128 * 1024;

/// Hex BLAKE3 digest of a file, computed off the async runtime.
pub async fn hash_file(path: &Path) -> Result<String, TransferError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_sync(&path))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
}

/// Compare a local file against the digest recorded at upload time.
///
/// `name` is only used for the error message.
pub async fn verify_checksum(path: &Path, name: &str, expected: &str) -> Result<(), TransferError> {
    debug!(file = %path.display(), "Verifying checksum");

    let actual = hash_file(path).await?;
    if !actual.eq_ignore_ascii_case(expected) {
        info!(file = %name, "Checksum mismatch");
        return Err(TransferError::ChecksumMismatch {
            name: name.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }

    debug!(file = %name, "Checksum verified");
    Ok(())
}

/// Stream a file through BLAKE3 in fixed-size chunks.
fn hash_file_sync(path: &Path) -> Result<String, TransferError> {
    let file = std::fs::File::open(path)?;

    let mut reader = std::io::BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_hash_matches_blake3() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("archive.7z");
        std::fs::write(&path, b"archive bytes").unwrap();

        let digest = hash_file(&path).await.unwrap();
        assert_eq!(digest, blake3::hash(b"archive bytes").to_hex().to_string());
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("archive.7z");
        std::fs::write(&path, b"corrupted").unwrap();

        let expected = blake3::hash(b"original").to_hex().to_string();
        let err = verify_checksum(&path, "archive.7z", &expected)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
        assert!(err.to_string().contains("archive.7z"));
    }

    #[tokio::test]
    async fn test_verify_accepts_matching_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("archive.7z");
        std::fs::write(&path, b"same").unwrap();

        let expected = blake3::hash(b"same").to_hex().to_string();
        assert!(verify_checksum(&path, "archive.7z", &expected).await.is_ok());
    }

    #[tokio::test]
    async fn test_hash_missing_file_is_io_error() {
        let temp = tempdir().unwrap();
        let err = hash_file(&temp.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }
}
