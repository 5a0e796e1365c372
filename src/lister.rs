// src/lister.rs
// File inventory (spec section 4.3): periodic directory sweeps producing a
// checksum-keyed snapshot of locally shared files.

use crate::crypto::sha256_hex;
use crate::error::IoError;
use crate::model::FileEntry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;

/// Out-of-scope collaborator (spec 1): enumerates regular files in one
/// directory, non-recursively. Swappable for tests.
pub trait DirectoryScanner: Send + Sync {
    /// List `(path, size_bytes, mtime_unix)` for every regular file directly
    /// inside `dir`. No recursion; dotfile policy is whatever the OS gives us.
    fn scan(&self, dir: &Path) -> Result<Vec<(PathBuf, u64, i64)>, IoError>;

    /// Read the full contents of `path`, for checksum computation.
    fn read(&self, path: &Path) -> Result<Vec<u8>, IoError>;
}

/// The real, filesystem-backed scanner.
pub struct FsDirectoryScanner;

impl DirectoryScanner for FsDirectoryScanner {
    fn scan(&self, dir: &Path) -> Result<Vec<(PathBuf, u64, i64)>, IoError> {
        let read_dir = std::fs::read_dir(dir).map_err(|source| IoError::Fs {
            path: dir.display().to_string(),
            source,
        })?;
        let mut out = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| IoError::Fs {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            let mtime_unix = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            out.push((path, meta.len(), mtime_unix));
        }
        Ok(out)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, IoError> {
        std::fs::read(path).map_err(|source| IoError::Fs {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Per-workspace file inventory. Owns a `checksum -> FileEntry` snapshot
/// guarded by an RW-lock (readers: publisher tick, `RequestFile`; writer:
/// sweep completion).
pub struct Lister {
    share_dir: PathBuf,
    scanner: Arc<dyn DirectoryScanner>,
    entries: RwLock<HashMap<String, (FileEntry, PathBuf)>>,
    sweeping: AtomicBool,
}

impl Lister {
    pub fn new(share_dir: PathBuf, scanner: Arc<dyn DirectoryScanner>) -> Self {
        Lister {
            share_dir,
            scanner,
            entries: RwLock::new(HashMap::new()),
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn with_fs_scanner(share_dir: PathBuf) -> Self {
        Self::new(share_dir, Arc::new(FsDirectoryScanner))
    }

    /// Perform one sweep. Overlapping sweeps are suppressed by a
    /// single-flight flag; a directory-read failure aborts leaving the map
    /// unchanged; a per-file hash failure logs and skips that file.
    pub async fn sweep(&self) {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            debug!(dir = %self.share_dir.display(), "sweep already in flight, skipping");
            return;
        }
        let result = self.sweep_inner().await;
        self.sweeping.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            warn!(dir = %self.share_dir.display(), error = %e, "directory sweep aborted");
        }
    }

    async fn sweep_inner(&self) -> Result<(), IoError> {
        let files = self.scanner.scan(&self.share_dir)?;
        let mut fresh: HashMap<String, (FileEntry, PathBuf)> = HashMap::new();
        for (path, size_bytes, mtime_unix) in files {
            let data = match self.scanner.read(&path) {
                Ok(d) => d,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            let checksum = sha256_hex(&data);
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let extension = path
                .extension()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let entry = FileEntry {
                name,
                extension,
                size_bytes,
                mtime_unix,
                checksum: checksum.clone(),
            };
            fresh.insert(checksum, (entry, path));
        }
        let mut guard = self.entries.write().await;
        *guard = fresh;
        Ok(())
    }

    /// Snapshot of currently-shared files.
    pub async fn available_files(&self) -> Vec<FileEntry> {
        self.entries
            .read()
            .await
            .values()
            .map(|(entry, _)| entry.clone())
            .collect()
    }

    /// Look up one entry by checksum.
    pub async fn file_info(&self, checksum: &str) -> Option<FileEntry> {
        self.entries
            .read()
            .await
            .get(checksum)
            .map(|(entry, _)| entry.clone())
    }

    /// Absolute path on disk for a checksum, for the transfer service.
    pub async fn file_path(&self, checksum: &str) -> Option<PathBuf> {
        self.entries
            .read()
            .await
            .get(checksum)
            .map(|(_, path)| path.clone())
    }
}
