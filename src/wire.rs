//! Wire protocol: length-prefixed JSON frames over a byte stream.
//!
//! Each frame is a big-endian `u32` payload length followed by the JSON
//! encoding of one [`Frame`]. The handshake is a single `Hello`/`Welcome`
//! exchange; after that the pusher sends only `Operation` frames. There
//! are no acknowledgements: delivery is at-least-once and the apply side
//! is idempotent, so a resent operation converges to the same state.

use crate::error::{ReplicationError, Result};
use crate::operation::ReplicationOperation;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload. A frame claiming more than
/// this is treated as corrupt rather than allocated.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame")]
pub enum Frame {
    /// Opens a connection: the dialer identifies itself and presents
    /// credentials.
    Hello {
        node_id: String,
        username: String,
        password: String,
    },
    /// Accepts a `Hello`. Anything else (or a closed socket) means the
    /// handshake was rejected.
    Welcome { node_id: String },
    /// One replicated operation.
    Operation(ReplicationOperation),
}

/// Write one frame to the stream.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(frame)?;
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(ReplicationError::Wire(format!(
            "frame payload {} exceeds limit {}",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| ReplicationError::io("write frame length", e))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| ReplicationError::io("write frame payload", e))?;
    writer
        .flush()
        .await
        .map_err(|e| ReplicationError::io("flush frame", e))?;
    Ok(())
}

/// Read one frame from the stream.
///
/// A clean EOF before the length prefix maps to an `Io` error with the
/// `UnexpectedEof` kind; callers treat it as the peer closing.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| ReplicationError::io("read frame length", e))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ReplicationError::Wire(format!(
            "frame length {} exceeds limit {}",
            len, MAX_FRAME_LEN
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| ReplicationError::io("read frame payload", e))?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChangeEvent, NodeChange, PropertyMap, PropertyValue, StableId};
    use crate::operation::encode_event;

    fn sample_operation() -> ReplicationOperation {
        let mut properties = PropertyMap::new();
        properties.insert("uuid".to_string(), PropertyValue::from("123XYZ"));
        let event = ChangeEvent::NodeCreated(NodeChange {
            id: Some(StableId::from("123XYZ")),
            labels: vec!["Test".to_string()],
            properties,
        });
        encode_event("node-a", 1, &event).unwrap()
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let frames = vec![
            Frame::Hello {
                node_id: "node-a".to_string(),
                username: "replicator".to_string(),
                password: "secret".to_string(),
            },
            Frame::Welcome {
                node_id: "node-b".to_string(),
            },
            Frame::Operation(sample_operation()),
        ];

        for frame in &frames {
            write_frame(&mut client, frame).await.unwrap();
        }
        for frame in &frames {
            assert_eq!(read_frame(&mut server).await.unwrap(), *frame);
        }
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bogus = (MAX_FRAME_LEN + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &bogus)
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Wire(_)));
    }

    #[tokio::test]
    async fn test_read_rejects_malformed_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let garbage = b"not json";
        tokio::io::AsyncWriteExt::write_all(&mut client, &(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, garbage)
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Wire(_)));
    }

    #[tokio::test]
    async fn test_read_eof_maps_to_io() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        match err {
            ReplicationError::Io { operation, .. } => assert_eq!(operation, "read frame length"),
            other => panic!("expected Io, got {:?}", other),
        }
    }
}
