//! Binary framing for batched, non-RPC payloads.
//!
//! The `CommandStream`/`LogStream` RPCs already have their own protobuf
//! framing courtesy of `tonic`; this module exists for payloads that move
//! outside an RPC body, the way the teacher framed request/response bodies
//! over its Unix-domain-socket transport: a 4-byte big-endian length, a
//! 1-byte type tag, then the payload.
//!
//! ```text
//! +----------------+---------------+-------------------+
//! | Length (4 BE)  | Type (1 byte) | Payload (N bytes) |
//! +----------------+---------------+-------------------+
//! ```

use crate::errors::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum framed message size, shared with the gRPC frame limit default.
pub const MAX_FRAME_SIZE: usize = crate::DEFAULT_MAX_MESSAGE_SIZE;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    ProcessEventBatch = 0x01,
}

impl TryFrom<u8> for FrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::ProcessEventBatch),
            other => Err(WireError::InvalidMessage(format!(
                "unknown frame type: 0x{other:02x}"
            ))),
        }
    }
}

/// A length-delimited binary frame.
#[derive(Debug, Clone)]
pub struct BinaryFrame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl BinaryFrame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let total_len = 1 + self.payload.len();
        let mut buf = BytesMut::with_capacity(4 + total_len);
        buf.put_u32(total_len as u32);
        buf.put_u8(self.frame_type as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, WireError> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                WireError::ConnectionClosed
            } else {
                WireError::Io(e)
            }
        })?;
        let total_len = u32::from_be_bytes(len_buf) as usize;

        if total_len == 0 {
            return Err(WireError::InvalidMessage("empty frame".to_string()));
        }
        if total_len > MAX_FRAME_SIZE {
            return Err(WireError::MessageTooLarge {
                size: total_len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut type_buf = [0u8; 1];
        reader.read_exact(&mut type_buf).await?;
        let frame_type = FrameType::try_from(type_buf[0])?;

        let payload_len = total_len - 1;
        let mut payload = BytesMut::with_capacity(payload_len);
        payload.resize(payload_len, 0);
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            frame_type,
            payload: payload.freeze(),
        })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), WireError> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use std::io::Cursor;

    #[test]
    fn frame_header_layout() {
        let frame = BinaryFrame::new(FrameType::ProcessEventBatch, Bytes::from_static(b"hello"));
        let encoded = frame.encode();
        assert_eq!(encoded.len(), 4 + 1 + 5);
        assert_eq!(&encoded[0..4], &[0, 0, 0, 6]);
        assert_eq!(encoded[4], FrameType::ProcessEventBatch as u8);
    }

    #[tokio::test]
    async fn decode_roundtrips_through_a_reader() {
        let frame = BinaryFrame::new(FrameType::ProcessEventBatch, Bytes::from_static(b"payload"));
        let encoded = frame.encode();
        let mut cursor = Cursor::new(encoded.to_vec());
        let decoded = BinaryFrame::decode(&mut cursor).await.unwrap();
        assert_eq!(decoded.frame_type, FrameType::ProcessEventBatch);
        assert_eq!(decoded.payload, Bytes::from_static(b"payload"));
        assert!(!cursor.has_remaining());
    }

    #[tokio::test]
    async fn decode_rejects_oversized_frame() {
        let mut oversized = BytesMut::new();
        oversized.put_u32((MAX_FRAME_SIZE + 1) as u32);
        let mut cursor = Cursor::new(oversized.to_vec());
        let err = BinaryFrame::decode(&mut cursor).await.unwrap_err();
        assert!(matches!(err, WireError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn decode_surfaces_connection_closed_on_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = BinaryFrame::decode(&mut cursor).await.unwrap_err();
        assert!(matches!(err, WireError::ConnectionClosed));
    }
}
