//! TCP server side of the protocol: accept loop and per-connection dispatch.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::errors::RpcError;
use crate::remote::FileManager;
use crate::rpc::codec::{read_frame, write_frame};
use crate::rpc::{Request, Response};
use crate::server::FileServer;

/// Serve `server` on `listener` forever. Each accepted connection runs on its
/// own task; a connection error tears down that connection only.
pub async fn serve(listener: TcpListener, server: Arc<FileServer>) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "file server listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "connection accepted");
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &server).await {
                match e {
                    RpcError::ConnectionClosed => debug!(%peer, "connection closed"),
                    e => warn!(%peer, error = %e, "connection failed"),
                }
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, server: &FileServer) -> Result<(), RpcError> {
    stream.set_nodelay(true)?;
    loop {
        let request: Request = read_frame(&mut stream).await?;
        let response = dispatch(server, request).await;
        write_frame(&mut stream, &response).await?;
    }
}

async fn dispatch(server: &FileServer, request: Request) -> Response {
    let result = match request {
        Request::Validate(param) => server.validate(param).await.map(Response::Validate),
        Request::DownloadChunk { chunk_id } => {
            server.download_chunk(chunk_id).await.map(Response::Chunk)
        }
        Request::Upload { path, chunk } => server.upload(path, chunk).await.map(Response::Upload),
        Request::UploadChunk { chunk } => server.upload_chunk(chunk).await.map(|()| Response::Unit),
        Request::CancelChunk { chunk_id } => {
            server.cancel_chunk(chunk_id).await.map(|()| Response::Unit)
        }
        Request::Delete { path } => server.delete(path).await.map(Response::Delete),
    };
    result.unwrap_or_else(|e| Response::Fault(e.to_string()))
}
