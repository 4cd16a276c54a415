//! The client-facing proxy: POSIX-like file operations over a local cache
//! with open-close session semantics.

mod engine;
mod handles;
mod state;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::errors::FsError;
use crate::remote::FileManager;
use crate::wire::OpenMode;

use engine::{CacheEngine, OpenOutcome};
use handles::{Descriptor, FdTable, OpenHandle};
use state::CacheState;

pub use handles::{DIR_FD_START, FILE_FD_START, SeekWhence};
pub use state::CacheRootError;

/// A caching file proxy bound to one server.
///
/// All methods are callable concurrently from many tasks. `open` and `close`
/// serialize on the engine (the AFS open/close boundary); `read`, `write`,
/// and `lseek` on distinct descriptors proceed in parallel.
pub struct Proxy {
    engine: CacheEngine,
    fds: FdTable,
}

impl Proxy {
    /// Create a proxy caching into `cache_root`, bounded by `capacity` bytes,
    /// talking to `remote`.
    pub async fn new(
        remote: Arc<dyn FileManager>,
        cache_root: &Path,
        capacity: u64,
    ) -> Result<Self, CacheRootError> {
        let state = Arc::new(CacheState::new(cache_root, capacity).await?);
        Ok(Self {
            engine: CacheEngine::new(remote, state),
            fds: FdTable::new(),
        })
    }

    /// Open `path` in `mode`, returning a file descriptor (≥ 1024) or a
    /// directory pseudo-descriptor.
    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<i32, FsError> {
        match self.engine.open(path, mode).await? {
            OpenOutcome::File { file, key, mode } => Ok(self.fds.register_file(OpenHandle {
                file: tokio::sync::Mutex::new(file),
                key,
                mode,
            })),
            OpenOutcome::Directory => Ok(self.fds.register_directory()),
        }
    }

    /// Close a descriptor. For a writer this commits the session: the version
    /// is uploaded to the server and becomes the new reader version.
    pub async fn close(&self, fd: i32) -> Result<(), FsError> {
        match self.fds.remove(fd).ok_or(FsError::BadDescriptor)? {
            Descriptor::Directory => Ok(()),
            Descriptor::File(handle) => {
                let key = handle.key.clone();
                let mode = handle.mode;
                // The upload reopens the version by path, so buffered writes
                // must reach the OS before the handle goes away.
                let flushed = if mode == OpenMode::Read {
                    Ok(())
                } else {
                    handle.file.lock().await.flush().await
                };
                drop(handle);
                match mode {
                    OpenMode::Read => {
                        self.engine.release_reader(&key).await;
                        Ok(())
                    }
                    _ => {
                        if flushed.is_err() {
                            self.engine.discard_writer(&key).await;
                            return Err(FsError::Io);
                        }
                        self.engine.release_writer(&key).await
                    }
                }
            }
        }
    }

    /// Read up to `len` bytes from the descriptor's current position.
    pub async fn read(&self, fd: i32, len: usize) -> Result<Bytes, FsError> {
        let handle = self.file_handle(fd)?;
        let mut file = handle.file.lock().await;
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Write `data` at the descriptor's current position, growing the cached
    /// version. Growth beyond the cache capacity fails with `OutOfSpace`
    /// before any byte is written.
    pub async fn write(&self, fd: i32, data: &[u8]) -> Result<u64, FsError> {
        let handle = self.file_handle(fd)?;
        if handle.mode == OpenMode::Read {
            return Err(FsError::BadDescriptor);
        }
        let state = self.engine.state();
        let mut file = handle.file.lock().await;

        // Reserve any bytes this write extends the file by.
        let position = file.stream_position().await?;
        let projected_end = position + data.len() as u64;
        let accounted = state.version_size(&handle.key);
        let growth = projected_end.saturating_sub(accounted);
        if growth > 0 && !state.reserve(growth) {
            return Err(FsError::OutOfSpace);
        }

        match file.write_all(data).await {
            Ok(()) => {
                if growth > 0 {
                    state.grow(&handle.key, growth);
                }
                Ok(data.len() as u64)
            }
            Err(e) => {
                if growth > 0 {
                    state.release_bytes(growth);
                }
                Err(e.into())
            }
        }
    }

    /// Reposition the descriptor. Returns the resulting offset from the start
    /// of the file.
    pub async fn lseek(&self, fd: i32, offset: i64, whence: SeekWhence) -> Result<u64, FsError> {
        let handle = self.file_handle(fd)?;
        let mut file = handle.file.lock().await;
        let seek = match whence {
            SeekWhence::Set => {
                if offset < 0 {
                    return Err(FsError::InvalidArgument);
                }
                #[expect(clippy::cast_sign_loss, reason = "checked non-negative above")]
                let start = offset as u64;
                SeekFrom::Start(start)
            }
            SeekWhence::Current => SeekFrom::Current(offset),
            SeekWhence::End => SeekFrom::End(offset),
        };
        match file.seek(seek).await {
            Ok(pos) => Ok(pos),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Err(FsError::InvalidArgument),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove `path` from the server's canonical tree and drop every cached
    /// version no session still holds open.
    pub async fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.engine.unlink(path).await
    }

    /// Bytes of cache currently in use.
    pub fn cache_occupancy(&self) -> u64 {
        self.engine.state().occupancy()
    }

    /// Configured cache capacity in bytes.
    pub fn cache_capacity(&self) -> u64 {
        self.engine.state().capacity()
    }

    fn file_handle(&self, fd: i32) -> Result<Arc<OpenHandle>, FsError> {
        match self.fds.get(fd).ok_or(FsError::BadDescriptor)? {
            Descriptor::File(handle) => Ok(handle),
            Descriptor::Directory => Err(FsError::IsDirectory),
        }
    }
}
