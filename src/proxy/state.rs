//! Consolidated proxy cache state: file records, timestamps, the version
//! arena, LRU recency order, and byte-accounted capacity.
//!
//! Everything that the original design spread across cache-wide maps lives in
//! one [`CacheState`] value behind one mutex. Every method is a short critical
//! section — no await point, no RPC — so the descriptor layer can reserve
//! space for writes without contending with an `open` that is blocked on the
//! server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hashlink::LinkedHashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Per-file version number. 0 is the base version; the on-disk cache file for
/// version `v` of path `p` is `p` itself for `v = 0` and `p{v}` otherwise.
pub type VersionId = u32;

/// Arena and LRU key: one specific cached version of one path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionKey {
    pub path: String,
    pub version: VersionId,
}

impl VersionKey {
    pub fn new(path: impl Into<String>, version: VersionId) -> Self {
        Self {
            path: path.into(),
            version,
        }
    }
}

/// Why a cache root directory was rejected at startup.
#[derive(Debug, Error)]
pub enum CacheRootError {
    #[error("cache root is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Non-empty directory without our marker file: refuse to sweep data that
    /// does not appear to be ours.
    #[error("cache root contains data from another source: {0}")]
    ForeignContents(PathBuf),

    #[error("i/o error while preparing cache root: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct VersionMeta {
    ref_count: u32,
    /// Bytes this version contributes to `occupancy`.
    size: u64,
}

#[derive(Debug, Default)]
struct FileRecord {
    /// The version new readers share. `None` means no visible version
    /// (deleted, evicted, or never downloaded).
    reader: Option<VersionId>,
    /// Mint counter for writer/download versions; strictly monotonic.
    next_version: VersionId,
    versions: HashMap<VersionId, VersionMeta>,
}

#[derive(Debug, Default)]
struct StateInner {
    records: HashMap<String, FileRecord>,
    /// Last server timestamp known per path. Absent = no cached canonical
    /// copy.
    timestamps: HashMap<String, i64>,
    /// Recency order, least-recently-touched first. Holds keys only; the
    /// version data lives in `records`.
    lru: LinkedHashMap<VersionKey, ()>,
    occupancy: u64,
}

/// The proxy's cache bookkeeping plus its on-disk root.
pub(crate) struct CacheState {
    inner: Mutex<StateInner>,
    capacity: u64,
    cache_root: PathBuf,
}

impl CacheState {
    // Marks a directory as ours so a restart can safely sweep leftovers.
    const MARKER_FILE: &'static str = ".cachefs";

    /// Prepare `cache_root` and return an empty cache bounded by `capacity`
    /// bytes.
    ///
    /// The directory is created if absent. An existing directory must either
    /// be empty or carry the marker file from a previous run; in both cases
    /// its contents are swept, so stale version files never leak into a new
    /// proxy lifetime.
    pub async fn new(cache_root: &Path, capacity: u64) -> Result<Self, CacheRootError> {
        let mut root = match tokio::fs::canonicalize(cache_root).await {
            Ok(mut p) => {
                if !tokio::fs::metadata(&p).await?.is_dir() {
                    return Err(CacheRootError::NotADirectory(p));
                }

                let mut entries = tokio::fs::read_dir(&p).await?;
                let is_empty = entries.next_entry().await?.is_none();

                p.push(Self::MARKER_FILE);
                let marker_exists = tokio::fs::try_exists(&p).await?;
                p.pop();

                if !(is_empty || marker_exists) {
                    return Err(CacheRootError::ForeignContents(p));
                }

                remove_dir_contents(&p).await?;
                p
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(cache_root).await?;
                tokio::fs::canonicalize(cache_root).await?
            }
            Err(e) => return Err(e.into()),
        };

        root.push(Self::MARKER_FILE);
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&root)
            .await?;
        root.pop();

        Ok(Self {
            inner: Mutex::new(StateInner::default()),
            capacity,
            cache_root: root,
        })
    }

    /// On-disk location of one cached version.
    #[must_use]
    pub fn version_path(&self, key: &VersionKey) -> PathBuf {
        if key.version == 0 {
            self.cache_root.join(&key.path)
        } else {
            self.cache_root.join(format!("{}{}", key.path, key.version))
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut StateInner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut inner)
    }

    // --- timestamps ---

    /// Last known server timestamp for `path`, or [`crate::wire::NO_TIMESTAMP`].
    pub fn timestamp(&self, path: &str) -> i64 {
        self.with_inner(|s| {
            s.timestamps
                .get(path)
                .copied()
                .unwrap_or(crate::wire::NO_TIMESTAMP)
        })
    }

    pub fn set_timestamp(&self, path: &str, ts: i64) {
        self.with_inner(|s| {
            s.timestamps.insert(path.to_owned(), ts);
        });
    }

    pub fn clear_timestamp(&self, path: &str) {
        self.with_inner(|s| {
            s.timestamps.remove(path);
        });
    }

    // --- records & versions ---

    /// The version id current readers of `path` share, if any.
    pub fn reader_version(&self, path: &str) -> Option<VersionId> {
        self.with_inner(|s| s.records.get(path).and_then(|r| r.reader))
    }

    /// Point new readers of `path` at `version`.
    pub fn promote_reader(&self, key: &VersionKey) {
        self.with_inner(|s| {
            s.records.entry(key.path.clone()).or_default().reader = Some(key.version);
        });
    }

    /// Mask off the reader version of `path`; existing holders keep their
    /// handles, new opens must revalidate.
    pub fn clear_reader(&self, path: &str) {
        self.with_inner(|s| {
            if let Some(record) = s.records.get_mut(path) {
                record.reader = None;
            }
        });
    }

    /// Mint the next version id for `path`, creating its record on first use.
    /// No arena entry is created yet — a mint that is never installed leaves
    /// no trace beyond the advanced counter.
    pub fn mint_version(&self, path: &str) -> VersionKey {
        self.with_inner(|s| {
            let record = s.records.entry(path.to_owned()).or_default();
            let version = record.next_version;
            record.next_version += 1;
            VersionKey::new(path, version)
        })
    }

    /// Register a minted version in the arena with `size` accounted bytes and
    /// an initial reference count, and touch it in the LRU order.
    ///
    /// The bytes must already have been admitted through [`reserve`]
    /// (or be zero).
    ///
    /// [`reserve`]: Self::reserve
    pub fn install_version(&self, key: &VersionKey, size: u64, ref_count: u32) {
        self.with_inner(|s| {
            let record = s.records.entry(key.path.clone()).or_default();
            record
                .versions
                .insert(key.version, VersionMeta { ref_count, size });
            s.lru.remove(key);
            s.lru.insert(key.clone(), ());
        });
    }

    /// Current reference count of a live version; 0 for unknown keys.
    pub fn ref_count(&self, key: &VersionKey) -> u32 {
        self.with_inner(|s| {
            s.records
                .get(&key.path)
                .and_then(|r| r.versions.get(&key.version))
                .map_or(0, |m| m.ref_count)
        })
    }

    /// Bytes accounted to a live version; 0 for unknown keys.
    pub fn version_size(&self, key: &VersionKey) -> u64 {
        self.with_inner(|s| {
            s.records
                .get(&key.path)
                .and_then(|r| r.versions.get(&key.version))
                .map_or(0, |m| m.size)
        })
    }

    /// Pin a version against eviction (a client opened it, or a copy is in
    /// flight).
    pub fn pin(&self, key: &VersionKey) {
        self.with_inner(|s| {
            if let Some(meta) = s
                .records
                .get_mut(&key.path)
                .and_then(|r| r.versions.get_mut(&key.version))
            {
                meta.ref_count += 1;
            }
        });
    }

    /// Drop one reference from a version, returning the remaining count.
    pub fn release(&self, key: &VersionKey) -> u32 {
        self.with_inner(|s| {
            s.records
                .get_mut(&key.path)
                .and_then(|r| r.versions.get_mut(&key.version))
                .map_or(0, |meta| {
                    meta.ref_count = meta.ref_count.saturating_sub(1);
                    meta.ref_count
                })
        })
    }

    /// Refresh a version's recency (open of a reader, creation of a writer
    /// copy, close of either).
    pub fn touch(&self, key: &VersionKey) {
        self.with_inner(|s| {
            // Remove-then-append refreshes the recency position. Keys that
            // were already evicted must not be resurrected.
            if s.lru.remove(key).is_some() {
                s.lru.insert(key.clone(), ());
            }
        });
    }

    /// Live versions of `path` with no open references, oldest first.
    pub fn unreferenced_versions(&self, path: &str) -> Vec<VersionKey> {
        self.with_inner(|s| {
            s.records.get(path).map_or_else(Vec::new, |record| {
                let mut keys: Vec<_> = record
                    .versions
                    .iter()
                    .filter(|(_, meta)| meta.ref_count == 0)
                    .map(|(v, _)| VersionKey::new(path, *v))
                    .collect();
                keys.sort_by_key(|k| k.version);
                keys
            })
        })
    }

    // --- capacity ---

    /// Admit `bytes` into the cache, evicting unpinned versions in LRU order
    /// if needed. Returns false (occupancy unchanged) when eviction cannot
    /// free enough space; versions evicted along the way stay evicted.
    pub fn reserve(&self, bytes: u64) -> bool {
        self.with_inner(|s| {
            loop {
                if self.capacity - s.occupancy >= bytes {
                    s.occupancy += bytes;
                    return true;
                }
                // Oldest unpinned version, regardless of reader status --
                // evicting a current reader masks it off below.
                let victim = s
                    .lru
                    .keys()
                    .find(|key| {
                        s.records
                            .get(&key.path)
                            .and_then(|r| r.versions.get(&key.version))
                            .is_some_and(|m| m.ref_count == 0)
                    })
                    .cloned();
                let Some(victim) = victim else {
                    debug!(requested = bytes, occupancy = s.occupancy, "cache reservation failed");
                    return false;
                };
                self.evict_locked(s, &victim);
            }
        })
    }

    /// Return `bytes` previously admitted through [`reserve`](Self::reserve)
    /// but never attached to a version (failed copy or write).
    pub fn release_bytes(&self, bytes: u64) {
        self.with_inner(|s| {
            s.occupancy = s.occupancy.saturating_sub(bytes);
        });
    }

    /// Attribute `bytes` of already-reserved space to a live version.
    pub fn grow(&self, key: &VersionKey, bytes: u64) {
        self.with_inner(|s| {
            if let Some(meta) = s
                .records
                .get_mut(&key.path)
                .and_then(|r| r.versions.get_mut(&key.version))
            {
                meta.size += bytes;
            }
        });
    }

    /// Unconditionally evict one version: LRU entry, arena entry, disk file,
    /// and accounted bytes. The caller has ensured its reference count is
    /// zero. Evicting the current reader version masks it off and clears the
    /// path's timestamp, so the next open revalidates from the server.
    pub fn evict(&self, key: &VersionKey) {
        self.with_inner(|s| self.evict_locked(s, key));
    }

    fn evict_locked(&self, s: &mut StateInner, key: &VersionKey) {
        s.lru.remove(key);
        let Some(record) = s.records.get_mut(&key.path) else {
            return;
        };
        let Some(meta) = record.versions.remove(&key.version) else {
            return;
        };
        if record.reader == Some(key.version) {
            record.reader = None;
            s.timestamps.remove(&key.path);
        }
        s.occupancy = s.occupancy.saturating_sub(meta.size);

        // The handle may still be open somewhere; unlink-while-open is fine
        // on unix and the readers keep their snapshot.
        match std::fs::remove_file(self.version_path(key)) {
            Ok(()) => {
                debug!(path = %key.path, version = key.version, freed = meta.size, "evicted cached version");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %key.path, version = key.version, error = %e, "failed to delete evicted version");
            }
        }
    }

    /// Bytes currently admitted into the cache.
    pub fn occupancy(&self) -> u64 {
        self.with_inner(|s| s.occupancy)
    }

    /// Configured capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Remove all entries inside `path` without removing `path` itself.
async fn remove_dir_contents(path: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let entry_path = entry.path();
        if tokio::fs::metadata(&entry_path).await?.is_dir() {
            tokio::fs::remove_dir_all(entry_path).await?;
        } else {
            tokio::fs::remove_file(entry_path).await?;
        }
    }
    Ok(())
}
