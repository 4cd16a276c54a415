//! Length-prefixed bincode framing.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::RpcError;
use crate::wire::CHUNK_SIZE;

/// Upper bound on one frame body: a full chunk plus envelope slack. Anything
/// larger is a protocol violation, not a big message.
pub const MAX_FRAME_SIZE: usize = CHUNK_SIZE + 16 * 1024;

/// Serialize `msg` and write it as one frame.
pub async fn write_frame<T, W>(writer: &mut W, msg: &T) -> Result<(), RpcError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(body.len()));
    }
    #[expect(clippy::cast_possible_truncation, reason = "bounded by MAX_FRAME_SIZE")]
    let len = body.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and deserialize it. A clean EOF before the length prefix
/// reads as [`RpcError::ConnectionClosed`].
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T, RpcError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
            RpcError::ConnectionClosed
        } else {
            RpcError::Io(e)
        });
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}
