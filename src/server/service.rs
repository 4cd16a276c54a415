//! The server's RPC surface: Validate / DownloadChunk / Upload / UploadChunk /
//! CancelChunk / Delete.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::errors::{FsError, RpcError};
use crate::remote::FileManager;
use crate::server::locks::PathLocks;
use crate::server::store::FileStore;
use crate::server::transfer::{StreamGuard, Transfer, TransferTable};
use crate::wire::{
    DeleteReply, FileChunk, NO_TIMESTAMP, SINGLE_CHUNK, UploadReply, ValidateParam, ValidateReply,
    next_chunk_len,
};

/// The authoritative file server.
///
/// Owns the canonical tree under its service root, the per-path lock table,
/// and the chunk-transfer table. Implements [`FileManager`] directly, so
/// tests (and a co-located proxy) can skip the network.
pub struct FileServer {
    store: FileStore,
    locks: PathLocks,
    transfers: TransferTable,
}

impl FileServer {
    /// Open a server over `root`, scanning the tree for the version index.
    pub async fn open(root: &Path) -> std::io::Result<Self> {
        Ok(Self {
            store: FileStore::open(root).await?,
            locks: PathLocks::new(),
            transfers: TransferTable::new(),
        })
    }

    /// Number of chunk streams currently holding a per-path lock.
    pub fn active_transfers(&self) -> usize {
        self.transfers.active()
    }

    /// Read the next chunk from an open transfer file.
    async fn read_chunk(file: &mut tokio::fs::File, chunk_id: i32) -> Result<FileChunk, RpcError> {
        let len = file.metadata().await?.len();
        let position = file.stream_position().await?;
        let (chunk_len, end_of_file) = next_chunk_len(len.saturating_sub(position));
        let mut buf = vec![0u8; chunk_len];
        file.read_exact(&mut buf).await?;
        Ok(FileChunk {
            data: buf.into(),
            end_of_file,
            chunk_id,
        })
    }
}

#[async_trait]
impl FileManager for FileServer {
    async fn validate(&self, param: ValidateParam) -> Result<ValidateReply, RpcError> {
        let Some((path, absolute)) = self.store.resolve(&param.path) else {
            return Ok(ValidateReply::failure(FsError::PermissionDenied, false));
        };

        let guard = self.locks.read_owned(&path).await;
        let verdict = self.store.classify(&absolute, param.mode).await;

        if let Some(error) = verdict.error {
            return Ok(ValidateReply::failure(error, verdict.is_directory));
        }

        if verdict.is_directory {
            return Ok(ValidateReply {
                error: None,
                is_directory: true,
                timestamp: NO_TIMESTAMP,
                chunk: None,
            });
        }

        if !verdict.exists {
            // Creatable: nothing to transfer, nothing to lock.
            return Ok(ValidateReply {
                error: None,
                is_directory: false,
                timestamp: NO_TIMESTAMP,
                chunk: None,
            });
        }

        let timestamp = self.store.ensure_timestamp(&path);
        if param.client_ts == timestamp {
            // The proxy's copy is current; no content rides back.
            return Ok(ValidateReply {
                error: None,
                is_directory: false,
                timestamp,
                chunk: None,
            });
        }

        // Stale (or unknown) on the proxy: load the first chunk. If more
        // follow, the reader lock moves into the transfer table and is held
        // until the stream drains or is cancelled.
        let mut file = match tokio::fs::File::open(&absolute).await {
            Ok(f) => f,
            Err(e) => return Ok(ValidateReply::failure(e.into(), false)),
        };
        let mut chunk = Self::read_chunk(&mut file, SINGLE_CHUNK).await?;
        if !chunk.end_of_file {
            chunk.chunk_id = self.transfers.register(Transfer {
                file,
                path: path.clone(),
                guard: StreamGuard::Read(guard),
            });
            debug!(%path, chunk_id = chunk.chunk_id, "download stream opened");
        }

        Ok(ValidateReply {
            error: None,
            is_directory: false,
            timestamp,
            chunk: Some(chunk),
        })
    }

    async fn download_chunk(&self, chunk_id: i32) -> Result<FileChunk, RpcError> {
        let mut transfer = self
            .transfers
            .take(chunk_id)
            .ok_or_else(|| RpcError::Remote(format!("unknown download stream {chunk_id}")))?;
        if !transfer.is_download() {
            let msg = format!("chunk {chunk_id} belongs to an upload stream");
            self.transfers.reinsert(chunk_id, transfer);
            return Err(RpcError::Remote(msg));
        }

        let chunk = match Self::read_chunk(&mut transfer.file, chunk_id).await {
            Ok(c) => c,
            Err(e) => {
                // Stream is unusable; drop it so the reader lock releases.
                warn!(path = %transfer.path, chunk_id, error = %e, "download stream failed");
                return Err(e);
            }
        };

        if !chunk.end_of_file {
            self.transfers.reinsert(chunk_id, transfer);
        } else {
            debug!(path = %transfer.path, chunk_id, "download stream drained");
        }
        Ok(chunk)
    }

    async fn upload(&self, path: String, chunk: FileChunk) -> Result<UploadReply, RpcError> {
        let Some((path, absolute)) = self
            .store
            .resolve(&path)
            .filter(|(normalized, _)| !normalized.is_empty())
        else {
            return Err(RpcError::Remote(format!(
                "upload path outside service root: {path}"
            )));
        };

        let guard = self.locks.write_owned(&path).await;
        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&absolute)
            .await?;
        file.write_all(&chunk.data).await?;

        // The commit point: every upload installs a fresh timestamp, even if
        // its tail chunks are still in flight under the writer lock.
        let timestamp = self.store.bump(&path);

        let chunk_id = if chunk.end_of_file {
            // Readers reopen by path the moment the writer lock drops.
            file.flush().await?;
            drop(guard);
            SINGLE_CHUNK
        } else {
            self.transfers.register(Transfer {
                file,
                path: path.clone(),
                guard: StreamGuard::Write(guard),
            })
        };
        info!(%path, timestamp, streaming = chunk_id != SINGLE_CHUNK, "upload");
        Ok(UploadReply {
            timestamp,
            chunk_id,
        })
    }

    async fn upload_chunk(&self, chunk: FileChunk) -> Result<(), RpcError> {
        let mut transfer = self
            .transfers
            .take(chunk.chunk_id)
            .ok_or_else(|| RpcError::Remote(format!("unknown upload stream {}", chunk.chunk_id)))?;
        if transfer.is_download() {
            let msg = format!("chunk {} belongs to a download stream", chunk.chunk_id);
            self.transfers.reinsert(chunk.chunk_id, transfer);
            return Err(RpcError::Remote(msg));
        }

        if let Err(e) = transfer.file.write_all(&chunk.data).await {
            warn!(path = %transfer.path, chunk_id = chunk.chunk_id, error = %e, "upload stream failed");
            return Err(e.into());
        }

        if !chunk.end_of_file {
            self.transfers.reinsert(chunk.chunk_id, transfer);
        } else {
            // Readers reopen by path the moment the writer lock drops.
            transfer.file.flush().await?;
            debug!(path = %transfer.path, chunk_id = chunk.chunk_id, "upload stream complete");
        }
        Ok(())
    }

    async fn cancel_chunk(&self, chunk_id: i32) -> Result<(), RpcError> {
        let transfer = self
            .transfers
            .take(chunk_id)
            .ok_or_else(|| RpcError::Remote(format!("unknown download stream {chunk_id}")))?;
        if !transfer.is_download() {
            let msg = format!("upload stream {chunk_id} cannot be cancelled");
            self.transfers.reinsert(chunk_id, transfer);
            return Err(RpcError::Remote(msg));
        }
        debug!(path = %transfer.path, chunk_id, "download stream cancelled");
        // Dropping the transfer releases the reader lock.
        Ok(())
    }

    async fn delete(&self, path: String) -> Result<DeleteReply, RpcError> {
        let Some((path, absolute)) = self.store.resolve(&path) else {
            return Ok(DeleteReply {
                error: Some(FsError::PermissionDenied),
            });
        };

        let guard = self.locks.write_owned(&path).await;
        let error = match tokio::fs::metadata(&absolute).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(FsError::NotFound),
            Err(e) => Some(e.into()),
            Ok(m) if m.is_dir() => Some(FsError::IsDirectory),
            Ok(_) => match tokio::fs::remove_file(&absolute).await {
                Ok(()) => {
                    self.store.forget(&path);
                    None
                }
                Err(e) => Some(e.into()),
            },
        };
        drop(guard);
        if error.is_none() {
            self.locks.remove(&path);
            info!(%path, "deleted");
        }
        Ok(DeleteReply { error })
    }
}
