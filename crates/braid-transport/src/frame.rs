use crate::{PeerInfo, TransportError};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on a single wire frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Connection-level frames. `Payload` carries protocol bytes opaque to this
/// crate; the rest is handshake and liveness plumbing.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Frame {
    Handshake(Handshake),
    Ping,
    Pong,
    Payload(Vec<u8>),
}

/// First frame in both directions of a fresh channel.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Handshake {
    pub peer: PeerInfo,
}

impl Frame {
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        let data = rmp_serde::to_vec(self)?;
        Ok(Bytes::from(data))
    }

    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Write a length-prefixed frame: u32 big-endian length, then the payload.
pub(crate) async fn write_framed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> std::io::Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame, rejecting anything over `max_size`.
pub(crate) async fn read_framed<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| TransportError::ChannelClosed(e.to_string()))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::ChannelClosed(e.to_string()))?;

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeId, PeerKind};

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::Handshake(Handshake {
            peer: PeerInfo::new(NodeId::new("node-1"), PeerKind::Node),
        });
        let bytes = frame.encode().unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);

        let frame = Frame::Payload(vec![1, 2, 3]);
        let bytes = frame.encode().unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[tokio::test]
    async fn framed_io_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_framed(&mut a, b"hello").await.unwrap();
        write_framed(&mut a, b"").await.unwrap();
        let first = read_framed(&mut b, 64).await.unwrap();
        assert_eq!(first, b"hello");
        let second = read_framed(&mut b, 64).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_without_reading_it() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_framed(&mut a, &[0u8; 128]).await.unwrap();
        let err = read_framed(&mut b, 64).await.unwrap_err();
        match err {
            TransportError::MessageTooLarge { size, max } => {
                assert_eq!(size, 128);
                assert_eq!(max, 64);
            }
            other => panic!("expected MessageTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_maps_to_channel_closed() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        let err = read_framed(&mut b, 64).await.unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed(_)));
    }
}
