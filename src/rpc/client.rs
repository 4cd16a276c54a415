//! TCP client side of the protocol: a [`crate::remote::FileManager`] backed
//! by one connection to the server.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::errors::RpcError;
use crate::remote::FileManager;
use crate::rpc::codec::{read_frame, write_frame};
use crate::rpc::{Request, Response};
use crate::wire::{DeleteReply, FileChunk, UploadReply, ValidateParam, ValidateReply};

/// A connected proxy-side RPC endpoint.
///
/// Requests are serialized over the single stream — one in flight at a time,
/// replies matched by order.
pub struct RpcClient {
    stream: tokio::sync::Mutex<TcpStream>,
}

impl RpcClient {
    /// Connect to a server at `host:port`.
    pub async fn connect(host: &str, port: u16) -> std::io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        debug!(host, port, "connected to file server");
        Ok(Self {
            stream: tokio::sync::Mutex::new(stream),
        })
    }

    async fn call(&self, request: Request) -> Result<Response, RpcError> {
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &request).await?;
        match read_frame(&mut *stream).await? {
            Response::Fault(message) => Err(RpcError::Remote(message)),
            response => Ok(response),
        }
    }
}

#[async_trait]
impl FileManager for RpcClient {
    async fn validate(&self, param: ValidateParam) -> Result<ValidateReply, RpcError> {
        match self.call(Request::Validate(param)).await? {
            Response::Validate(reply) => Ok(reply),
            other => Err(unexpected(&other)),
        }
    }

    async fn download_chunk(&self, chunk_id: i32) -> Result<FileChunk, RpcError> {
        match self.call(Request::DownloadChunk { chunk_id }).await? {
            Response::Chunk(chunk) => Ok(chunk),
            other => Err(unexpected(&other)),
        }
    }

    async fn upload(&self, path: String, chunk: FileChunk) -> Result<UploadReply, RpcError> {
        match self.call(Request::Upload { path, chunk }).await? {
            Response::Upload(reply) => Ok(reply),
            other => Err(unexpected(&other)),
        }
    }

    async fn upload_chunk(&self, chunk: FileChunk) -> Result<(), RpcError> {
        match self.call(Request::UploadChunk { chunk }).await? {
            Response::Unit => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn cancel_chunk(&self, chunk_id: i32) -> Result<(), RpcError> {
        match self.call(Request::CancelChunk { chunk_id }).await? {
            Response::Unit => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete(&self, path: String) -> Result<DeleteReply, RpcError> {
        match self.call(Request::Delete { path }).await? {
            Response::Delete(reply) => Ok(reply),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> RpcError {
    RpcError::Remote(format!("unexpected response frame: {response:?}"))
}
