//! # Frame Codec
//!
//! Every record on a Tipwire stream is one frame:
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (BE)  | JSON document (len bytes) |
//! +----------------+---------------------------+
//! ```
//!
//! JSON keeps the records self-describing, so an aggregator can ingest
//! heartbeats from node versions that added fields it has never heard of.
//! A clean EOF before the length prefix means the peer closed the stream;
//! an EOF anywhere inside a frame is a decode error.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::MAX_FRAME_SIZE;

/// Length prefix size in bytes.
const LENGTH_PREFIX: usize = 4;

/// Errors produced while reading or writing frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The underlying stream failed.
    #[error("stream i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame payload is not a valid record.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The length prefix exceeds [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    /// The stream ended part-way through a frame.
    #[error("stream closed mid-frame")]
    Truncated,
}

/// Serializes `value` into a complete frame (prefix included).
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge {
            size: payload.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Writes one frame and flushes.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(CodecError::Truncated)
            };
        }
        filled += n;
    }

    let size = u32::from_be_bytes(prefix) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge {
            size,
            limit: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; size];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CodecError::Truncated)
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        head: String,
        height: u64,
    }

    fn sample(height: u64) -> Sample {
        Sample {
            head: format!("{{c{height}}}"),
            height,
        }
    }

    #[tokio::test]
    async fn consecutive_frames_then_clean_eof() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        for h in 1..=3 {
            write_frame(&mut tx, &sample(h)).await.unwrap();
        }
        drop(tx);

        for h in 1..=3 {
            let got: Sample = read_frame(&mut rx).await.unwrap().unwrap();
            assert_eq!(got, sample(h));
        }
        let end: Option<Sample> = read_frame(&mut rx).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn eof_inside_payload_is_truncated() {
        let frame = encode_frame(&sample(7)).unwrap();
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(&frame[..frame.len() - 3]).await.unwrap();
        drop(tx);

        let res: Result<Option<Sample>, _> = read_frame(&mut rx).await;
        assert!(matches!(res, Err(CodecError::Truncated)));
    }

    #[tokio::test]
    async fn eof_inside_prefix_is_truncated() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&[0, 0]).await.unwrap();
        drop(tx);

        let res: Result<Option<Sample>, _> = read_frame(&mut rx).await;
        assert!(matches!(res, Err(CodecError::Truncated)));
    }

    #[tokio::test]
    async fn garbage_payload_is_malformed() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&4u32.to_be_bytes()).await.unwrap();
        tx.write_all(b"nope").await.unwrap();

        let res: Result<Option<Sample>, _> = read_frame(&mut rx).await;
        assert!(matches!(res, Err(CodecError::Malformed(_))));
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected_before_allocating() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let res: Result<Option<Sample>, _> = read_frame(&mut rx).await;
        assert!(matches!(res, Err(CodecError::TooLarge { .. })));
    }
}
