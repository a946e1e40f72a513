use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::atomic::{AtomicFile, StagedFile, is_staging_name};
use crate::locking::DirectoryLocks;
use crate::naming::candidates;

const FALLBACK_PUBLIC_PREFIX: &str = "uploads";

/// Flat media directory shared by every request.
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    locks: DirectoryLocks,
}

impl Storage {
    pub fn new(root: PathBuf, lock_timeout: Duration) -> Self {
        Self {
            root,
            locks: DirectoryLocks::new(lock_timeout),
        }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// URL segment under which stored files are published: the directory's basename.
    pub fn public_prefix(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| FALLBACK_PUBLIC_PREFIX.to_string())
    }

    /// Public URL path of a stored file.
    pub fn public_url(&self, name: &str) -> String {
        format!(
            "/{}/{}",
            encode_path_segment(&self.public_prefix()),
            encode_path_segment(name)
        )
    }

    /// Resolves a stored file name to its path.
    ///
    /// Only a single visible path component is accepted and the entry must
    /// not be a symlink.
    pub async fn resolve_entry(&self, name: &str) -> Result<PathBuf, StorageError> {
        let mut components = Path::new(name).components();
        let valid = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !valid || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(StorageError::InvalidPath);
        }

        let target = self.root.join(name);
        let metadata = fs::symlink_metadata(&target).await?;
        if metadata.file_type().is_symlink() || !metadata.is_file() {
            return Err(StorageError::InvalidPath);
        }
        Ok(target)
    }

    /// Opens a hidden staging file for an upload that wants `desired`.
    pub async fn stage(&self, desired: &str) -> io::Result<AtomicFile> {
        AtomicFile::new(&self.root, desired).await
    }

    /// Commits a staged file under the first free candidate of `desired`.
    ///
    /// Each candidate is claimed with a no-clobber link while the directory
    /// lock is held, so concurrent commits of the same name always end up
    /// as distinct files. Returns the stored name.
    pub async fn commit(&self, staged: StagedFile, desired: &str) -> Result<String, StorageError> {
        let _guard = match self.locks.acquire(&self.root).await {
            Ok(guard) => guard,
            Err(_) => {
                staged.discard().await;
                return Err(StorageError::Busy);
            }
        };

        for candidate in candidates(desired) {
            let target = self.root.join(&candidate);
            match staged.persist_noclobber(&target).await {
                Ok(()) => {
                    if candidate != desired {
                        debug!(desired, stored = candidate, "name taken, stored with suffix");
                    }
                    return Ok(candidate);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    staged.discard().await;
                    return Err(StorageError::Io(err));
                }
            }
        }

        staged.discard().await;
        Err(StorageError::NameExhausted(desired.to_string()))
    }

    /// Fresh scan of every visible regular file, in directory order.
    pub async fn scan(&self) -> Result<Vec<StoredEntry>, StorageError> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Renamed or removed between read_dir and stat.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::Io(err)),
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().ok().map(format_timestamp);
            entries.push(StoredEntry {
                name,
                size: metadata.len(),
                modified,
            });
        }

        Ok(entries)
    }

    /// Removes staging files older than `ttl`, left behind by interrupted uploads.
    pub async fn sweep_staging(&self, ttl: Duration) -> io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_staging_name(&name) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age < ttl {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    info!(path = ?path, "removed stale staging file");
                }
                Err(err) => warn!(path = ?path, error = %err, "failed to remove stale staging file"),
            }
        }
        let pruned = self.locks.prune_idle().await;
        debug!(removed, pruned_locks = pruned, "staging sweep finished");
        Ok(removed)
    }
}

fn format_timestamp(timestamp: SystemTime) -> String {
    let datetime: DateTime<Utc> = timestamp.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Everything except RFC 3986 unreserved characters.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encodes a file name for use as one URL path segment.
pub fn encode_path_segment(name: &str) -> String {
    utf8_percent_encode(name, PATH_SEGMENT).to_string()
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Busy,
    NameExhausted(String),
    Io(io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::InvalidPath => f.write_str("invalid path"),
            StorageError::Busy => f.write_str("storage directory busy"),
            StorageError::NameExhausted(name) => write!(f, "no free name for {name}"),
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredEntry {
    pub name: String,
    pub size: u64,
    pub modified: Option<String>,
}
