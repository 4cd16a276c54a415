//! The transport seam between the proxy and the server.

use async_trait::async_trait;

use crate::errors::RpcError;
use crate::wire::{DeleteReply, FileChunk, UploadReply, ValidateParam, ValidateReply};

/// The six operations the proxy may invoke on the authoritative server.
///
/// The transport underneath is assumed reliable, at-most-once, synchronous
/// request/response. [`crate::server::FileServer`] implements this trait
/// directly for in-process use; [`crate::rpc::RpcClient`] implements it over
/// TCP. An `Err` from any method is a transport or server fault, never a file
/// semantics error — those travel inside the reply types.
#[async_trait]
pub trait FileManager: Send + Sync {
    /// Check-on-use validation of a cached copy at open time. Carries the
    /// first chunk of a fresh copy when the proxy's timestamp is stale.
    async fn validate(&self, param: ValidateParam) -> Result<ValidateReply, RpcError>;

    /// Fetch the next chunk of a download stream started by `validate`.
    async fn download_chunk(&self, chunk_id: i32) -> Result<FileChunk, RpcError>;

    /// Begin (and possibly complete) an upload of a new file version.
    async fn upload(&self, path: String, chunk: FileChunk) -> Result<UploadReply, RpcError>;

    /// Append the next chunk of an upload stream started by `upload`.
    async fn upload_chunk(&self, chunk: FileChunk) -> Result<(), RpcError>;

    /// Abort a download stream, releasing the reader lock the server holds
    /// for it. Only valid for downloads; uploads cannot be cancelled.
    async fn cancel_chunk(&self, chunk_id: i32) -> Result<(), RpcError>;

    /// Remove a file from the canonical tree.
    async fn delete(&self, path: String) -> Result<DeleteReply, RpcError>;
}
