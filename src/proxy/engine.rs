//! The proxy cache engine: check-on-use `open`, session-committing `close`,
//! and `unlink`.
//!
//! One async mutex serializes open and close end to end, deliberately held
//! across the Validate round-trip, the chunked download loop, and the chunked
//! upload on writer close. Reads and writes on already-open handles never
//! touch it.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::errors::FsError;
use crate::proxy::state::{CacheState, VersionKey};
use crate::remote::FileManager;
use crate::wire::{FileChunk, OpenMode, SINGLE_CHUNK, ValidateParam, next_chunk_len, normalize_path};

/// What `open` hands back to the descriptor layer.
pub(crate) enum OpenOutcome {
    File {
        file: tokio::fs::File,
        key: VersionKey,
        mode: OpenMode,
    },
    /// Directories get a pseudo-descriptor; no cache state is touched.
    Directory,
}

pub(crate) struct CacheEngine {
    remote: Arc<dyn FileManager>,
    state: Arc<CacheState>,
    /// The engine lock. Guards no data directly — [`CacheState`] has its own
    /// short mutex — but serializes the open/close control flow.
    serial: tokio::sync::Mutex<()>,
}

impl CacheEngine {
    pub(crate) fn new(remote: Arc<dyn FileManager>, state: Arc<CacheState>) -> Self {
        Self {
            remote,
            state,
            serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Validate with the server, refresh the cached copy if stale, and open a
    /// reader or writer version for `mode`.
    pub(crate) async fn open(&self, path: &str, mode: OpenMode) -> Result<OpenOutcome, FsError> {
        let path = normalize_path(path).ok_or(FsError::PermissionDenied)?;

        let _serial = self.serial.lock().await;

        let reply = self
            .remote
            .validate(ValidateParam {
                path: path.clone(),
                mode,
                client_ts: self.state.timestamp(&path),
            })
            .await?;

        if let Some(error) = reply.error {
            if error == FsError::NotFound {
                // The server no longer has it; whatever we cached is stale.
                self.state.clear_reader(&path);
                self.state.clear_timestamp(&path);
            }
            return Err(error);
        }

        if reply.is_directory {
            return Ok(OpenOutcome::Directory);
        }

        if let Some(chunk) = reply.chunk {
            // A chunk-bearing reply always reflects a timestamp this proxy
            // does not have: the engine lock is held across the round-trip
            // and every timestamp mutation takes the same lock.
            self.save_download(&path, chunk, reply.timestamp).await?;
        }

        match mode {
            OpenMode::Read => self.acquire_reader(&path).await,
            _ => self.acquire_writer(&path).await,
        }
    }

    /// Open the current reader version shared by all readers of `path`.
    async fn acquire_reader(&self, path: &str) -> Result<OpenOutcome, FsError> {
        let Some(version) = self.state.reader_version(path) else {
            // Validate succeeded, so the only way to get here is an eviction
            // racing this open; the client can simply retry.
            warn!(path, "no reader version after successful validate");
            return Err(FsError::NotFound);
        };
        let key = VersionKey::new(path, version);
        let file = tokio::fs::File::open(self.state.version_path(&key)).await?;
        self.state.pin(&key);
        self.state.touch(&key);
        Ok(OpenOutcome::File {
            file,
            key,
            mode: OpenMode::Read,
        })
    }

    /// Mint an isolated writer version: a copy of the current reader version
    /// if one exists, an empty file otherwise.
    async fn acquire_writer(&self, path: &str) -> Result<OpenOutcome, FsError> {
        let key = self.state.mint_version(path);
        let writer_path = self.state.version_path(&key);

        if let Some(reader) = self.state.reader_version(path) {
            let reader_key = VersionKey::new(path, reader);
            let size = self.state.version_size(&reader_key);

            // Pin before reserving: the reservation may evict, and the copy
            // source must survive it.
            self.state.pin(&reader_key);
            if !self.state.reserve(size) {
                self.state.release(&reader_key);
                return Err(FsError::OutOfSpace);
            }
            let copied = tokio::fs::copy(self.state.version_path(&reader_key), &writer_path).await;
            self.state.release(&reader_key);
            if let Err(e) = copied {
                self.state.release_bytes(size);
                return Err(e.into());
            }
            self.state.install_version(&key, size, 1);
        } else {
            if let Some(parent) = writer_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&writer_path)
                .await?;
            self.state.install_version(&key, 0, 1);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&writer_path)
            .await?;
        debug!(path, version = key.version, "writer version created");
        Ok(OpenOutcome::File {
            file,
            key,
            mode: OpenMode::Write,
        })
    }

    /// Stream a fresh copy from the server into a new version and promote it
    /// to reader. Space is reserved chunk by chunk; running out aborts the
    /// stream with `CancelChunk` so the server's reader lock is released.
    async fn save_download(
        &self,
        path: &str,
        first_chunk: FileChunk,
        server_ts: i64,
    ) -> Result<(), FsError> {
        let key = self.state.mint_version(path);
        // Pinned while the download is in flight.
        self.state.install_version(&key, 0, 1);
        self.state.touch(&key);

        let disk_path = self.state.version_path(&key);
        if let Some(parent) = disk_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let result = self.run_download(&key, &disk_path, first_chunk).await;
        match result {
            Ok(()) => {
                self.state.release(&key);
                // The superseded reader copy is known-stale; drop it once the
                // replacement is in, unless a session still holds it open.
                if let Some(reader) = self.state.reader_version(path)
                    && reader != key.version
                {
                    let reader_key = VersionKey::new(path, reader);
                    if self.state.ref_count(&reader_key) == 0 {
                        self.state.evict(&reader_key);
                    }
                }
                self.state.promote_reader(&key);
                self.state.set_timestamp(path, server_ts);
                debug!(path, version = key.version, server_ts, "download installed");
                Ok(())
            }
            Err(e) => {
                // The previous reader version and timestamp stay as they
                // were; only the partial download is discarded.
                self.state.release(&key);
                self.state.evict(&key);
                Err(e)
            }
        }
    }

    async fn run_download(
        &self,
        key: &VersionKey,
        disk_path: &Path,
        mut chunk: FileChunk,
    ) -> Result<(), FsError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(disk_path)
            .await?;

        loop {
            let len = chunk.data.len() as u64;
            if !self.state.reserve(len) {
                if !chunk.end_of_file {
                    // The server is holding a reader lock for this stream.
                    if let Err(e) = self.remote.cancel_chunk(chunk.chunk_id).await {
                        warn!(chunk_id = chunk.chunk_id, error = %e, "cancel after failed reservation");
                    }
                }
                return Err(FsError::OutOfSpace);
            }
            self.state.grow(key, len);
            file.write_all(&chunk.data).await?;

            if chunk.end_of_file {
                // The version is reopened by path right after install, so the
                // handle's in-flight writes must reach the OS first.
                file.flush().await?;
                return Ok(());
            }
            chunk = self.remote.download_chunk(chunk.chunk_id).await?;
        }
    }

    /// Close a reader handle: drop the reference and evict the version if it
    /// is unreferenced and no longer the one new readers share.
    pub(crate) async fn release_reader(&self, key: &VersionKey) {
        let _serial = self.serial.lock().await;
        self.state.touch(key);
        let remaining = self.state.release(key);
        if remaining == 0 && self.state.reader_version(&key.path) != Some(key.version) {
            self.state.evict(key);
        }
    }

    /// Discard a writer handle whose session cannot be committed (its final
    /// flush failed). The version is dropped as if the upload had failed.
    pub(crate) async fn discard_writer(&self, key: &VersionKey) {
        let _serial = self.serial.lock().await;
        self.state.release(key);
        self.state.evict(key);
    }

    /// Close a writer handle: upload the version to the server and promote it
    /// to the new reader version.
    ///
    /// If the upload fails the local install is rolled back — the writer
    /// version is discarded, the previous reader version and timestamp stay
    /// as they were, and the close reports EIO.
    pub(crate) async fn release_writer(&self, key: &VersionKey) -> Result<(), FsError> {
        let _serial = self.serial.lock().await;
        self.state.touch(key);

        // The handle's reference is held until the upload finishes; a
        // concurrent reservation must not evict the version mid-stream.
        let uploaded = self.upload_version(key).await;
        self.state.release(key);

        match uploaded {
            Ok(server_ts) => {
                if let Some(prev) = self.state.reader_version(&key.path)
                    && prev != key.version
                {
                    let prev_key = VersionKey::new(key.path.as_str(), prev);
                    if self.state.ref_count(&prev_key) == 0 {
                        self.state.evict(&prev_key);
                    }
                }
                self.state.promote_reader(key);
                self.state.set_timestamp(&key.path, server_ts);
                info!(path = %key.path, version = key.version, server_ts, "writer committed");
                Ok(())
            }
            Err(e) => {
                warn!(path = %key.path, version = key.version, error = %e, "upload failed, discarding writer version");
                self.state.evict(key);
                Err(FsError::Io)
            }
        }
    }

    /// Chunked upload of one on-disk version; returns the server timestamp of
    /// the committed file.
    async fn upload_version(&self, key: &VersionKey) -> Result<i64, FsError> {
        let mut file = tokio::fs::File::open(self.state.version_path(key)).await?;
        let mut remaining = file.metadata().await?.len();

        let (len, mut end_of_file) = next_chunk_len(remaining);
        let data = read_exactly(&mut file, len).await?;
        remaining -= len as u64;

        let reply = self
            .remote
            .upload(
                key.path.clone(),
                FileChunk {
                    data,
                    end_of_file,
                    chunk_id: SINGLE_CHUNK,
                },
            )
            .await?;

        while !end_of_file {
            let (len, last) = next_chunk_len(remaining);
            let data = read_exactly(&mut file, len).await?;
            remaining -= len as u64;
            end_of_file = last;
            self.remote
                .upload_chunk(FileChunk {
                    data,
                    end_of_file,
                    chunk_id: reply.chunk_id,
                })
                .await?;
        }

        Ok(reply.timestamp)
    }

    /// Delete `path` on the server, then drop every local trace nobody still
    /// holds open.
    pub(crate) async fn unlink(&self, path: &str) -> Result<(), FsError> {
        let path = normalize_path(path).ok_or(FsError::PermissionDenied)?;

        let reply = self.remote.delete(path.clone()).await?;
        if let Some(error) = reply.error {
            return Err(error);
        }

        let _serial = self.serial.lock().await;
        self.state.clear_reader(&path);
        self.state.clear_timestamp(&path);
        for key in self.state.unreferenced_versions(&path) {
            self.state.evict(&key);
        }
        info!(%path, "unlinked");
        Ok(())
    }

    pub(crate) fn state(&self) -> &CacheState {
        &self.state
    }
}

async fn read_exactly(file: &mut tokio::fs::File, len: usize) -> Result<Bytes, FsError> {
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
