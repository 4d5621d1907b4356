//! Framed wire transport.
//!
//! Every exchange on a live connection is a frame:
//!
//! ```text
//! [ magic (8) | payload length (4, BE) | opaque payload ]
//! ```
//!
//! Pre-handshake the payload carries the two Noise handshake messages;
//! post-handshake it carries AEAD-sealed message batches. A magic
//! mismatch is an immediate hard failure with no partial-trust fallback.
//!
//! Each read and write is wrapped in a rolling per-operation deadline; a
//! receiver treats an expired read deadline on an idle connection as
//! "nothing yet", not as an error.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::core::{MAGIC_LINK_V1, MAX_FRAME_PAYLOAD, TransportError};

/// Frame overhead: magic plus length prefix.
pub const FRAME_HEAD_SIZE: usize = 8 + 4;

/// Write one frame, returning the bytes put on the wire.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    deadline: Duration,
) -> Result<u64, TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(FRAME_HEAD_SIZE + payload.len());
    frame.extend_from_slice(&MAGIC_LINK_V1.bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);

    timeout(deadline, async {
        writer.write_all(&frame).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| TransportError::Timeout)??;
    Ok(frame.len() as u64)
}

/// Read one frame, returning its payload and the bytes taken off the wire.
pub async fn read_frame<R>(
    reader: &mut R,
    deadline: Duration,
) -> Result<(Vec<u8>, u64), TransportError>
where
    R: AsyncRead + Unpin,
{
    timeout(deadline, async {
        let mut head = [0u8; FRAME_HEAD_SIZE];
        read_exact_or_disconnect(reader, &mut head).await?;
        if head[..8] != MAGIC_LINK_V1.bytes {
            return Err(TransportError::BadMagic);
        }
        let len = u32::from_be_bytes(head[8..12].try_into().unwrap());
        if len as usize > MAX_FRAME_PAYLOAD {
            return Err(TransportError::Oversized(len));
        }
        let mut payload = vec![0u8; len as usize];
        read_exact_or_disconnect(reader, &mut payload).await?;
        Ok((payload, (FRAME_HEAD_SIZE as u64) + len as u64))
    })
    .await
    .map_err(|_| TransportError::Timeout)?
}

async fn read_exact_or_disconnect<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            Err(TransportError::Disconnected)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const DL: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let sent = write_frame(&mut a, b"batch of messages", DL).await.unwrap();
        let (payload, got) = read_frame(&mut b, DL).await.unwrap();
        assert_eq!(payload, b"batch of messages");
        assert_eq!(sent, got);
    }

    #[tokio::test]
    async fn empty_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"", DL).await.unwrap();
        let (payload, size) = read_frame(&mut b, DL).await.unwrap();
        assert!(payload.is_empty());
        assert_eq!(size, FRAME_HEAD_SIZE as u64);
    }

    #[tokio::test]
    async fn bad_magic_is_fatal() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"XXXXXXXX\x00\x00\x00\x01z").await.unwrap();
        let err = read_frame(&mut b, DL).await.unwrap_err();
        assert!(matches!(err, TransportError::BadMagic));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut head = Vec::new();
        head.extend_from_slice(&MAGIC_LINK_V1.bytes);
        head.extend_from_slice(&(u32::MAX).to_be_bytes());
        a.write_all(&head).await.unwrap();
        let err = read_frame(&mut b, DL).await.unwrap_err();
        assert!(matches!(err, TransportError::Oversized(_)));
    }

    #[tokio::test]
    async fn closed_peer_is_disconnected() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame(&mut b, DL).await.unwrap_err();
        assert!(matches!(err, TransportError::Disconnected));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (_a, mut b) = tokio::io::duplex(64);
        let err = read_frame(&mut b, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }
}
