//! Frame codec: 4-byte big-endian length prefix followed by a JSON body.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;
use crate::Result;

/// Largest accepted frame body
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cr_common::InvocationRequest;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = InvocationRequest::service(12, "S", "m", serde_json::json!([1, 2]));

        write_frame(&mut client, &request).await.unwrap();
        drop(client);

        let decoded: InvocationRequest = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(decoded.seq, 12);
        assert_eq!(decoded.route_key(), "S#m");

        let eof: Option<InvocationRequest> = read_frame(&mut server).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let mut input: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<Option<InvocationRequest>> = read_frame(&mut input).await;
        assert!(matches!(result, Err(RpcError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_encode_prefix() {
        let frame = encode(&serde_json::json!({"k": "v"})).unwrap();
        let body_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(body_len, frame.len() - 4);
    }
}
