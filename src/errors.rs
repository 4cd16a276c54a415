//! Error types shared between the proxy and the server.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The POSIX-shaped error set surfaced to clients of the proxy.
///
/// This enum rides the wire inside server replies, so the server's open-time
/// classification reaches the client unchanged. [`FsError::errno`] maps each
/// variant to the negative integer a C caller would expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("file already exists")]
    AlreadyExists,

    #[error("operation not permitted")]
    PermissionDenied,

    #[error("is a directory")]
    IsDirectory,

    #[error("bad file descriptor")]
    BadDescriptor,

    #[error("invalid argument")]
    InvalidArgument,

    /// The proxy cache cannot admit the bytes, even after eviction.
    #[error("out of cache space")]
    OutOfSpace,

    #[error("i/o error")]
    Io,
}

impl FsError {
    /// The negative errno a POSIX open/read/write would return for this error.
    #[must_use]
    pub fn errno(self) -> i32 {
        match self {
            Self::NotFound => -libc::ENOENT,
            Self::AlreadyExists => -libc::EEXIST,
            Self::PermissionDenied => -libc::EPERM,
            Self::IsDirectory => -libc::EISDIR,
            Self::BadDescriptor => -libc::EBADF,
            Self::InvalidArgument => -libc::EINVAL,
            Self::OutOfSpace => -libc::ENOMEM,
            Self::Io => -libc::EIO,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            _ => Self::Io,
        }
    }
}

/// Transport-level failures of the proxy-server RPC channel.
///
/// None of these carry file semantics; any `RpcError` reaching the client
/// boundary collapses to [`FsError::Io`].
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The server executed the request but reported a fault (bad chunk id,
    /// disk error, path outside the service root on a non-Validate call).
    #[error("server fault: {0}")]
    Remote(String),
}

impl From<RpcError> for FsError {
    fn from(_: RpcError) -> Self {
        Self::Io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_libc() {
        assert_eq!(FsError::NotFound.errno(), -2);
        assert_eq!(FsError::PermissionDenied.errno(), -1);
        assert_eq!(FsError::IsDirectory.errno(), -21);
        assert_eq!(FsError::BadDescriptor.errno(), -9);
        assert_eq!(FsError::OutOfSpace.errno(), -12);
        assert_eq!(FsError::Io.errno(), -5);
    }

    #[test]
    fn io_error_kinds_map_to_fs_errors() {
        let not_found = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(FsError::from(not_found), FsError::NotFound);

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(FsError::from(denied), FsError::PermissionDenied);

        let other = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(FsError::from(other), FsError::Io);
    }

    #[test]
    fn rpc_errors_collapse_to_eio() {
        let err = RpcError::Remote("boom".to_owned());
        assert_eq!(FsError::from(err), FsError::Io);
    }
}
