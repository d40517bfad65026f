//! Length prefixed framing over any async byte stream.
//!
//! A frame is a big-endian `u32` payload length followed by the payload.
//! Payload encodings: bincode for bot traffic and the handshake, JSON for
//! operators, bincode wrapped in deflate for observers.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    Ok(bincode::serialize(msg)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn encode_json<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    Ok(serde_json::to_vec(msg)?)
}

pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn compress<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let raw = bincode::serialize(msg)?;
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::fast());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

pub fn decompress<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    let mut raw = Vec::new();
    DeflateDecoder::new(bytes)
        .take(MAX_FRAME_LEN as u64 * 8)
        .read_to_end(&mut raw)?;
    Ok(bincode::deserialize(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FoodView, ObserverDelta, ObserverMessage, Vec2};

    #[tokio::test]
    async fn test_frame_write_then_read() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_too_large_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();

        match read_frame(&mut b).await {
            Err(FrameError::TooLarge(n)) => assert_eq!(n, MAX_FRAME_LEN + 1),
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        assert!(matches!(read_frame(&mut b).await, Err(FrameError::Io(_))));
    }

    #[test]
    fn test_compressed_delta_shrinks_repetitive_payload() {
        let mut delta = ObserverDelta {
            tick: 7,
            ..Default::default()
        };
        for id in 0..500 {
            delta.created_or_updated_foods.insert(
                id,
                FoodView {
                    id,
                    position: Vec2::new(10.0, 10.0),
                    mass: 10.0,
                },
            );
        }
        let msg = ObserverMessage::Delta(delta);

        let packed = compress(&msg).unwrap();
        let raw = encode(&msg).unwrap();
        assert!(packed.len() < raw.len());

        let unpacked: ObserverMessage = decompress(&packed).unwrap();
        assert_eq!(unpacked, msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode::<crate::BotMessage>(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
        assert!(decode_json::<crate::OperatorCommand>(b"not json").is_err());
    }
}
