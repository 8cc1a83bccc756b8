//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// A stand-in for `7z` built on `tar`.
///
/// The first line of the "archive" holds the password, the rest is a tar
/// stream. Extraction with a different password fails the way 7z does.
const FAKE_7Z: &str = r#"#!/bin/sh
cmd="$1"; shift
pw=""; out=""; archive=""; excl=""
for arg in "$@"; do
  case "$arg" in
    -p*) pw="${arg#-p}" ;;
    -o*) out="${arg#-o}" ;;
    -xr\!*) excl="${arg#-xr?}" ;;
    -*) ;;
    *) if [ -z "$archive" ]; then archive="$arg"; fi ;;
  esac
done

case "$cmd" in
  a)
    echo "7-Zip (fake) 0.0"
    echo "  0%"
    printf '%s\n' "$pw" > "$archive" || exit 2
    if [ -n "$excl" ]; then
      tar -cf - --exclude="$excl" . >> "$archive" || exit 2
    else
      tar -cf - . >> "$archive" || exit 2
    fi
    echo " 50% 1 + files"
    echo "100%"
    echo "Everything is Ok"
    ;;
  x)
    stored=$(head -n 1 "$archive")
    if [ "$stored" != "$pw" ]; then
      echo "ERROR: Wrong password : $archive" >&2
      exit 2
    fi
    echo "  0%"
    mkdir -p "$out" || exit 2
    tail -n +2 "$archive" | tar -xf - -C "$out" || exit 2
    echo "100%"
    echo "Everything is Ok"
    ;;
  *)
    echo "ERROR: unsupported command $cmd" >&2
    exit 7
    ;;
esac
"#;

/// Write an executable shell script into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

#[cfg(unix)]
pub fn fake_7z(dir: &Path) -> PathBuf {
    write_script(dir, "fake-7z", FAKE_7Z)
}

pub fn has_7z() -> bool {
    Command::new("7z").arg("i").output().is_ok()
}

pub fn create_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// `a/b.txt` = "hello", `c.txt` = "world"
pub fn sample_tree(root: &Path) {
    create_file(&root.join("a/b.txt"), b"hello");
    create_file(&root.join("c.txt"), b"world");
}

/// Relative paths of all regular files under `root`, sorted.
pub fn list_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}

/// Deterministic non-repeating bytes.
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
