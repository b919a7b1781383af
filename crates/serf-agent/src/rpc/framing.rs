//! Length-prefixed MessagePack framing for the RPC protocol (§4.G, §6):
//! a 4-byte big-endian length followed by a `rmp-serde`-encoded value. The
//! same shape as `memberlist::membership`'s own push/pull framing, just
//! without the AEAD envelope the cluster wire protocol needs — RPC clients
//! are local, trusted processes, not gossiping peers.
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("frame too large")]
    FrameTooLarge,
}

pub type FramingResult<T> = Result<T, FramingError>;

pub async fn write_frame<W, T>(writer: &mut W, value: &T, max_frame: usize) -> FramingResult<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let body = rmp_serde::to_vec_named(value)?;
    if body.len() > max_frame {
        return Err(FramingError::FrameTooLarge);
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R, max_frame: usize) -> FramingResult<T>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let buf = read_frame_raw(reader, max_frame).await?;
    Ok(rmp_serde::from_slice(&buf)?)
}

/// Reads one frame's body without decoding it. Connection handling reads a
/// request's body this way because its concrete type depends on the command
/// named in the header frame read just before it.
pub async fn read_frame_raw<R>(reader: &mut R, max_frame: usize) -> FramingResult<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(FramingError::FrameTooLarge);
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_a_value() {
        let mut buf: Vec<u8> = Vec::new();
        write_frame(&mut buf, &("members".to_string(), 7u64), 4096).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (cmd, seq): (String, u64) = read_frame(&mut cursor, 4096).await.unwrap();
        assert_eq!(cmd, "members");
        assert_eq!(seq, 7);
    }

    #[tokio::test]
    async fn rejects_oversized_frame_on_write() {
        let mut buf: Vec<u8> = Vec::new();
        let big = vec![0u8; 100];
        let err = write_frame(&mut buf, &big, 10).await.unwrap_err();
        assert!(matches!(err, FramingError::FrameTooLarge));
    }
}
