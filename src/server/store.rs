//! The server's view of the canonical file tree: path resolution, the
//! monotonic version index, and open-time classification.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::{debug, info};

use crate::errors::FsError;
use crate::wire::{OpenMode, normalize_path};

/// Outcome of classifying a path against an open mode — the same verdict a
/// POSIX `open` would reach, plus the flags the proxy needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub error: Option<FsError>,
    pub is_directory: bool,
    /// False for a creatable path that does not exist yet.
    pub exists: bool,
}

impl Verdict {
    fn failure(error: FsError, is_directory: bool) -> Self {
        Self {
            error: Some(error),
            is_directory,
            exists: true,
        }
    }

    fn ok(is_directory: bool, exists: bool) -> Self {
        Self {
            error: None,
            is_directory,
            exists,
        }
    }
}

/// Versioned store rooted at one service directory.
///
/// Timestamps are in-memory only and monotonic per server run: a server-wide
/// clock feeds the per-path index, so within one file the sequence of values
/// installed by successful uploads is strictly increasing, and no client ever
/// observes a downgrade.
pub struct FileStore {
    root: PathBuf,
    timestamps: Mutex<HashMap<String, i64>>,
    clock: AtomicI64,
}

impl FileStore {
    /// Open a store over `root`, scanning the existing tree so every regular
    /// file starts with a timestamp.
    pub async fn open(root: &Path) -> std::io::Result<Self> {
        let root = tokio::fs::canonicalize(root).await?;
        if !tokio::fs::metadata(&root).await?.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("service root is not a directory: {}", root.display()),
            ));
        }

        let store = Self {
            root,
            timestamps: Mutex::new(HashMap::new()),
            clock: AtomicI64::new(0),
        };
        store.scan().await?;
        Ok(store)
    }

    async fn scan(&self) -> std::io::Result<()> {
        let mut pending = vec![self.root.clone()];
        let mut seen = 0usize;
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    let path = entry.path();
                    let Ok(rel) = path.strip_prefix(&self.root) else {
                        continue;
                    };
                    let Some(rel) = rel.to_str() else {
                        debug!(path = %path.display(), "skipping non-utf8 path in scan");
                        continue;
                    };
                    self.mint(rel);
                    seen += 1;
                }
            }
        }
        info!(root = %self.root.display(), files = seen, "service root scanned");
        Ok(())
    }

    fn mint(&self, path: &str) -> i64 {
        let ts = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let mut map = self.timestamps.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.insert(path.to_owned(), ts);
        ts
    }

    /// Normalize a client path and resolve it under the service root.
    /// `None` means the path escapes the root (or is not valid UTF-8 after
    /// normalization) and must be rejected with `PermissionDenied`.
    pub fn resolve(&self, path: &str) -> Option<(String, PathBuf)> {
        let normalized = normalize_path(path)?;
        let absolute = self.root.join(&normalized);
        Some((normalized, absolute))
    }

    /// The path's current timestamp. A regular file present on disk but not
    /// yet in the index (created out-of-band after the startup scan) is
    /// assigned a fresh value, so it behaves like a scanned file.
    pub fn ensure_timestamp(&self, path: &str) -> i64 {
        {
            let map = self.timestamps.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(ts) = map.get(path) {
                return *ts;
            }
        }
        self.mint(path)
    }

    /// Install a fresh timestamp for a successfully uploaded file.
    pub fn bump(&self, path: &str) -> i64 {
        self.mint(path)
    }

    /// Drop a deleted path from the index.
    pub fn forget(&self, path: &str) {
        let mut map = self.timestamps.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.remove(path);
    }

    /// Classify `absolute` against `mode` per the POSIX open rules.
    ///
    /// Permission checks are probes: opening for read, opening for write, or
    /// listing a directory, mapped to `PermissionDenied` on refusal.
    pub async fn classify(&self, absolute: &Path, mode: OpenMode) -> Verdict {
        let metadata = match tokio::fs::metadata(absolute).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return if mode.may_create() {
                    Verdict::ok(false, false)
                } else {
                    Verdict::failure(FsError::NotFound, false)
                };
            }
            Err(e) => return Verdict::failure(e.into(), false),
        };

        if mode == OpenMode::CreateNew {
            return Verdict::failure(FsError::AlreadyExists, metadata.is_dir());
        }

        if metadata.is_dir() {
            if mode != OpenMode::Read {
                return Verdict::failure(FsError::IsDirectory, true);
            }
            return match tokio::fs::read_dir(absolute).await {
                Ok(_) => Verdict::ok(true, true),
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    Verdict::failure(FsError::PermissionDenied, true)
                }
                Err(e) => Verdict::failure(e.into(), true),
            };
        }

        if !metadata.is_file() {
            // Sockets, fifos and friends are not served.
            return Verdict::failure(FsError::PermissionDenied, false);
        }

        let needs_read = matches!(mode, OpenMode::Read | OpenMode::Create);
        let needs_write = matches!(mode, OpenMode::Write | OpenMode::Create);

        if needs_read && !probe(tokio::fs::File::open(absolute).await) {
            return Verdict::failure(FsError::PermissionDenied, false);
        }
        if needs_write {
            let attempt = tokio::fs::OpenOptions::new()
                .write(true)
                .open(absolute)
                .await;
            if !probe(attempt) {
                return Verdict::failure(FsError::PermissionDenied, false);
            }
        }

        Verdict::ok(false, true)
    }
}

fn probe<T>(result: std::io::Result<T>) -> bool {
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_over(files: &[(&str, &[u8])]) -> (tempfile::TempDir, FileStore) {
        let tmp = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            let path = tmp.path().join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, contents).unwrap();
        }
        let store = FileStore::open(tmp.path()).await.unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn scan_assigns_timestamps_to_existing_files() {
        let (_tmp, store) = store_over(&[("a.txt", b"a"), ("sub/b.txt", b"b")]).await;
        let ts_a = store.ensure_timestamp("a.txt");
        let ts_b = store.ensure_timestamp("sub/b.txt");
        assert!(ts_a >= 1);
        assert!(ts_b >= 1);
        assert_ne!(ts_a, ts_b);
    }

    #[tokio::test]
    async fn bump_is_strictly_increasing_per_path() {
        let (_tmp, store) = store_over(&[("a.txt", b"a")]).await;
        let first = store.ensure_timestamp("a.txt");
        let second = store.bump("a.txt");
        let third = store.bump("a.txt");
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn out_of_band_file_gets_lazy_timestamp() {
        let (tmp, store) = store_over(&[]).await;
        std::fs::write(tmp.path().join("late.txt"), b"late").unwrap();
        let ts = store.ensure_timestamp("late.txt");
        assert!(ts >= 1);
        assert_eq!(store.ensure_timestamp("late.txt"), ts, "lazy mint happens once");
    }

    #[tokio::test]
    async fn resolve_rejects_escaping_paths() {
        let (_tmp, store) = store_over(&[]).await;
        assert!(store.resolve("../outside").is_none());
        assert!(store.resolve("/absolute").is_none());
        let (norm, abs) = store.resolve("a/./b.txt").unwrap();
        assert_eq!(norm, "a/b.txt");
        assert!(abs.ends_with("a/b.txt"));
    }

    #[tokio::test]
    async fn classify_missing_file_depends_on_mode() {
        let (tmp, store) = store_over(&[]).await;
        let absent = tmp.path().join("nope");

        let read = store.classify(&absent, OpenMode::Read).await;
        assert_eq!(read.error, Some(FsError::NotFound));

        let create = store.classify(&absent, OpenMode::Create).await;
        assert_eq!(create.error, None);
        assert!(!create.exists);

        let create_new = store.classify(&absent, OpenMode::CreateNew).await;
        assert_eq!(create_new.error, None);
        assert!(!create_new.exists);
    }

    #[tokio::test]
    async fn classify_existing_file_rejects_create_new() {
        let (tmp, store) = store_over(&[("yes.txt", b"y")]).await;
        let verdict = store
            .classify(&tmp.path().join("yes.txt"), OpenMode::CreateNew)
            .await;
        assert_eq!(verdict.error, Some(FsError::AlreadyExists));
    }

    #[tokio::test]
    async fn classify_directory_by_mode() {
        let (tmp, store) = store_over(&[]).await;
        std::fs::create_dir(tmp.path().join("subdir")).unwrap();
        let dir = tmp.path().join("subdir");

        let read = store.classify(&dir, OpenMode::Read).await;
        assert_eq!(read.error, None);
        assert!(read.is_directory);

        let write = store.classify(&dir, OpenMode::Write).await;
        assert_eq!(write.error, Some(FsError::IsDirectory));
        assert!(write.is_directory);

        let create = store.classify(&dir, OpenMode::CreateNew).await;
        assert_eq!(create.error, Some(FsError::AlreadyExists));
    }

    #[tokio::test]
    async fn classify_accepts_readable_regular_file() {
        let (tmp, store) = store_over(&[("f.txt", b"data")]).await;
        let verdict = store.classify(&tmp.path().join("f.txt"), OpenMode::Read).await;
        assert_eq!(verdict, Verdict::ok(false, true));
    }
}
