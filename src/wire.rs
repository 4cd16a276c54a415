//! Wire types of the proxy-server protocol.
//!
//! Everything here is `serde`-serializable and transport-agnostic: the same
//! structs cross an in-process trait call in tests and a TCP frame in
//! production.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::FsError;

/// Maximum bytes per transfer RPC payload. Tunable; 200 KiB by default.
pub const CHUNK_SIZE: usize = 200 * 1024;

/// Timestamp value meaning "no canonical copy known" — the client sends it
/// when it has never cached the path, the server returns it for a file that
/// does not exist yet but may be created.
pub const NO_TIMESTAMP: i64 = -1;

/// Chunk id carried by a transfer that fits in a single chunk. No stream is
/// registered on the server, so the receiver ignores it.
pub const SINGLE_CHUNK: i32 = -1;

/// How the client wants to open a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Existing file, read-only. The only mode valid on directories.
    Read,
    /// Existing file, read-write.
    Write,
    /// Read-write; created if absent.
    Create,
    /// Read-write; must not already exist.
    CreateNew,
}

impl OpenMode {
    /// True for the modes that may create a file that does not exist yet.
    #[must_use]
    pub fn may_create(self) -> bool {
        matches!(self, Self::Create | Self::CreateNew)
    }
}

/// One hop of a chunked file transfer.
///
/// A single-chunk file arrives with `end_of_file = true` and
/// `chunk_id = SINGLE_CHUNK`. A streamed file's first chunk carries
/// `end_of_file = false` and a server-minted id identifying the stream for
/// every subsequent `DownloadChunk`/`UploadChunk`/`CancelChunk` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub data: Bytes,
    pub end_of_file: bool,
    pub chunk_id: i32,
}

/// Arguments of the check-on-use `Validate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateParam {
    pub path: String,
    pub mode: OpenMode,
    /// The server timestamp the proxy last recorded for this path, or
    /// [`NO_TIMESTAMP`].
    pub client_ts: i64,
}

/// Reply to `Validate`.
///
/// On success (`error == None`) for a stale regular file, `chunk` carries the
/// first chunk of a fresh copy; equal timestamps or a creatable-nonexistent
/// file come back with no chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateReply {
    pub error: Option<FsError>,
    pub is_directory: bool,
    pub timestamp: i64,
    pub chunk: Option<FileChunk>,
}

impl ValidateReply {
    pub(crate) fn failure(error: FsError, is_directory: bool) -> Self {
        Self {
            error: Some(error),
            is_directory,
            timestamp: NO_TIMESTAMP,
            chunk: None,
        }
    }
}

/// Reply to `Upload`: the freshly minted server timestamp, and the stream id
/// for the remaining chunks ([`SINGLE_CHUNK`] if the first chunk was final).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UploadReply {
    pub timestamp: i64,
    pub chunk_id: i32,
}

/// Reply to `Delete`. `None` means the file is gone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeleteReply {
    pub error: Option<FsError>,
}

/// Size and finality of the next chunk of a transfer with `remaining` bytes
/// left to move.
#[must_use]
pub fn next_chunk_len(remaining: u64) -> (usize, bool) {
    if remaining <= CHUNK_SIZE as u64 {
        #[expect(clippy::cast_possible_truncation, reason = "bounded by CHUNK_SIZE")]
        let len = remaining as usize;
        (len, true)
    } else {
        (CHUNK_SIZE, false)
    }
}

/// Normalize a server-root-relative path, resolving `.` and `..` lexically.
///
/// Returns `None` if the path is absolute or escapes the root — callers map
/// that to `PermissionDenied`. Both sides of the protocol use this, so the
/// proxy's cache keys and the server's timestamp keys agree on spelling.
#[must_use]
pub fn normalize_path(path: &str) -> Option<String> {
    use std::path::Component;

    let mut parts: Vec<&str> = Vec::new();
    for component in std::path::Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping past the root would escape the service tree.
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.join("/"))
}
