//! Length-prefixed frames over any byte stream.
//!
//! A frame is a little-endian `u32` length followed by one code byte and the
//! message payload. Oversized lengths are rejected before any allocation.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::protocol::MAX_MSG_SIZE;

pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    code: u8,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let len = payload.len() + 1;
    if len > MAX_MSG_SIZE {
        return Err(ProtocolError::MsgTooLarge(len, MAX_MSG_SIZE));
    }
    stream.write_u32_le(len as u32).await?;
    stream.write_u8(code).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` signals a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<(u8, Vec<u8>)>, ProtocolError> {
    let len = match stream.read_u32_le().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_MSG_SIZE {
        return Err(ProtocolError::MsgTooLarge(len, MAX_MSG_SIZE));
    }
    if len == 0 {
        return Err(ProtocolError::Decode("empty frame".to_string()));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Decode("truncated frame".to_string())
        } else {
            ProtocolError::Io(e)
        }
    })?;
    let payload = buf.split_off(1);
    Ok(Some((buf[0], payload)))
}
