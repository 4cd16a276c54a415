//! Reference TCP transport for the proxy-server protocol.
//!
//! Frames are a 4-byte little-endian length prefix followed by a `bincode`
//! body. One request gets exactly one response; a proxy serializes its calls
//! over a single connection, which gives the reliable, in-order, synchronous
//! request/response channel the protocol assumes.

mod client;
mod codec;
mod server;

use serde::{Deserialize, Serialize};

use crate::wire::{DeleteReply, FileChunk, UploadReply, ValidateParam, ValidateReply};

pub use client::RpcClient;
pub use codec::{MAX_FRAME_SIZE, read_frame, write_frame};
pub use server::serve;

/// A request frame from proxy to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Validate(ValidateParam),
    DownloadChunk { chunk_id: i32 },
    Upload { path: String, chunk: FileChunk },
    UploadChunk { chunk: FileChunk },
    CancelChunk { chunk_id: i32 },
    Delete { path: String },
}

/// A response frame from server to proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Validate(ValidateReply),
    Chunk(FileChunk),
    Upload(UploadReply),
    Delete(DeleteReply),
    Unit,
    /// The server failed to execute the request (transport-level fault, not a
    /// file-semantics error).
    Fault(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{NO_TIMESTAMP, OpenMode, SINGLE_CHUNK};

    #[tokio::test]
    async fn frames_round_trip_through_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        let request = Request::Validate(ValidateParam {
            path: "dir/file.txt".to_owned(),
            mode: OpenMode::Create,
            client_ts: NO_TIMESTAMP,
        });
        write_frame(&mut a, &request).await.unwrap();
        let echoed: Request = read_frame(&mut b).await.unwrap();
        match echoed {
            Request::Validate(param) => {
                assert_eq!(param.path, "dir/file.txt");
                assert_eq!(param.mode, OpenMode::Create);
            }
            other => panic!("wrong frame decoded: {other:?}"),
        }

        let response = Response::Chunk(FileChunk {
            data: vec![1u8, 2, 3].into(),
            end_of_file: true,
            chunk_id: SINGLE_CHUNK,
        });
        write_frame(&mut b, &response).await.unwrap();
        let echoed: Response = read_frame(&mut a).await.unwrap();
        match echoed {
            Response::Chunk(chunk) => assert_eq!(&chunk.data[..], &[1, 2, 3]),
            other => panic!("wrong frame decoded: {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_pipe_reads_as_connection_closed() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        let result: Result<Request, _> = read_frame(&mut b).await;
        assert!(matches!(
            result,
            Err(crate::errors::RpcError::ConnectionClosed)
        ));
    }
}
