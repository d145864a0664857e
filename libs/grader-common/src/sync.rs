/// Directory Sync - Task Content Replication
///
/// **Core Responsibility:**
/// Keep an agent's copy of the task-content root identical to the master's
/// by exchanging per-file digests and shipping only the difference.
///
/// **Flow:**
/// 1. Both sides compute [`directory_hashes`] (sha256 + permission bits)
/// 2. The master runs [`compare`] to get a [`SyncDelta`]
/// 3. Changed/new files go out as a tar.gz built by [`pack_archive`],
///    vanished files as a deletion list
/// 4. The agent calls [`apply_update`]
///
/// **Security:**
/// Every archive member and every deletion path must stay inside the root.
/// One bad path rejects the whole batch before anything is written.
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub hash: String,
    pub mode: u32,
}

/// Relative path (always `/`-separated) → digest
pub type DirectoryHashes = BTreeMap<String, FileDigest>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDelta {
    pub to_send: Vec<String>,
    pub to_delete: Vec<String>,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.to_send.is_empty() && self.to_delete.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("path escapes the task directory: {0}")]
    PathOutsideRoot(String),
    #[error("unsupported archive entry (only files and directories are accepted): {0}")]
    UnsupportedEntry(String),
    #[error("corrupt archive: {0}")]
    Archive(#[source] io::Error),
    #[error("failed to apply update: {0}")]
    Io(#[from] io::Error),
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

/// Digest every regular file under `root`. Symlinks are not followed.
pub fn directory_hashes(root: &Path) -> Result<DirectoryHashes> {
    let mut hashes = DirectoryHashes::new();
    if !root.exists() {
        return Ok(hashes);
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(key) = relative_key(root, entry.path()) else {
            tracing::warn!(path = %entry.path().display(), "Skipping non UTF-8 path");
            continue;
        };

        let content = fs::read(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;
        let metadata = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;

        hashes.insert(
            key,
            FileDigest {
                hash: hex::encode(Sha256::digest(&content)),
                mode: file_mode(&metadata),
            },
        );
    }
    Ok(hashes)
}

/// What must change on `remote` to make it equal to `master`
pub fn compare(master: &DirectoryHashes, remote: &DirectoryHashes) -> SyncDelta {
    let to_send = master
        .iter()
        .filter(|(path, digest)| remote.get(*path) != Some(*digest))
        .map(|(path, _)| path.clone())
        .collect();
    let to_delete = remote
        .keys()
        .filter(|path| !master.contains_key(*path))
        .cloned()
        .collect();
    SyncDelta { to_send, to_delete }
}

/// Build a tar.gz of `paths` (relative to `root`)
pub fn pack_archive(root: &Path, paths: &[String]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for path in paths {
        builder
            .append_path_with_name(root.join(path), path)
            .with_context(|| format!("Failed to add {} to sync archive", path))?;
    }
    let encoder = builder.into_inner().context("Failed to finish sync archive")?;
    encoder.finish().context("Failed to compress sync archive")
}

/// Resolve `relative` under `root`, refusing anything that could leave it
fn contained_path(root: &Path, relative: &Path) -> Result<PathBuf, SyncError> {
    let display = relative.display().to_string();
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SyncError::PathOutsideRoot(display));
            }
        }
    }
    if depth == 0 {
        return Err(SyncError::PathOutsideRoot(display));
    }
    Ok(resolved)
}

enum Staged {
    File { path: PathBuf, mode: u32, content: Vec<u8> },
    Directory(PathBuf),
}

fn stage_archive(root: &Path, archive: &[u8]) -> Result<Vec<Staged>, SyncError> {
    let mut staged = Vec::new();
    if archive.is_empty() {
        return Ok(staged);
    }

    let mut reader = tar::Archive::new(GzDecoder::new(archive));
    for entry in reader.entries().map_err(SyncError::Archive)? {
        let mut entry = entry.map_err(SyncError::Archive)?;
        let relative = entry.path().map_err(SyncError::Archive)?.into_owned();
        let path = contained_path(root, &relative)?;

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            staged.push(Staged::Directory(path));
        } else if kind.is_file() {
            let mode = entry.header().mode().map_err(SyncError::Archive)? & 0o777;
            let mut content = Vec::new();
            entry.read_to_end(&mut content).map_err(SyncError::Archive)?;
            staged.push(Staged::File { path, mode, content });
        } else {
            return Err(SyncError::UnsupportedEntry(relative.display().to_string()));
        }
    }
    Ok(staged)
}

/// Apply a delta produced by the master.
///
/// Validation of the full batch happens before the first write.
pub fn apply_update(root: &Path, archive: &[u8], delete: &[String]) -> Result<(), SyncError> {
    let staged = stage_archive(root, archive)?;
    let deletions = delete
        .iter()
        .map(|path| contained_path(root, Path::new(path)))
        .collect::<Result<Vec<_>, _>>()?;

    for path in deletions {
        let result = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    for item in staged {
        match item {
            Staged::Directory(path) => fs::create_dir_all(&path)?,
            Staged::File { path, mode, content } => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, content)?;
                set_mode(&path, mode)?;
            }
        }
    }
    Ok(())
}
