//! Frame codec.
//!
//! Each frame is a 4-byte big-endian body length followed by the
//! bincode-encoded message body.

use super::messages::{ClientMessage, ServerMessage};
use crate::core::error::{CoherenceError, CoherenceResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame length prefix size.
pub const HEADER_LEN: usize = 4;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Result of decoding a frame from the wire.
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// A complete frame was decoded and consumed.
    Complete(T),
    /// More data is needed.
    Incomplete,
    /// The input is invalid; the connection must be dropped.
    Invalid(String),
}

/// Encodes outbound and decodes inbound frames for one side of a
/// connection.
pub trait ProtocolCodec: Send + Sync {
    /// Message type decoded from the wire.
    type Inbound;

    /// Message type encoded to the wire.
    type Outbound;

    /// Decode one frame, consuming its bytes on `Complete`.
    fn decode(&self, buffer: &mut BytesMut) -> DecodeResult<Self::Inbound>;

    /// Encode one frame.
    fn encode(&self, message: &Self::Outbound) -> CoherenceResult<Bytes>;
}

/// Length-prefixed bincode codec.
#[derive(Debug)]
pub struct FrameCodec<In, Out> {
    max_frame_len: usize,
    _marker: PhantomData<fn(Out) -> In>,
}

/// Codec used by the server: reads client messages, writes server messages.
pub type ServerCodec = FrameCodec<ClientMessage, ServerMessage>;

/// Codec used by clients.
pub type ClientCodec = FrameCodec<ServerMessage, ClientMessage>;

impl<In, Out> FrameCodec<In, Out> {
    /// Codec with the default frame limit.
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    /// Codec with a custom frame limit.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> ProtocolCodec for FrameCodec<In, Out>
where
    In: DeserializeOwned,
    Out: Serialize,
{
    type Inbound = In;
    type Outbound = Out;

    fn decode(&self, buffer: &mut BytesMut) -> DecodeResult<In> {
        if buffer.len() < HEADER_LEN {
            return DecodeResult::Incomplete;
        }
        let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if len > self.max_frame_len {
            return DecodeResult::Invalid(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_frame_len
            ));
        }
        if buffer.len() < HEADER_LEN + len {
            buffer.reserve(HEADER_LEN + len - buffer.len());
            return DecodeResult::Incomplete;
        }
        buffer.advance(HEADER_LEN);
        let body = buffer.split_to(len);
        match bincode::deserialize(&body) {
            Ok(message) => DecodeResult::Complete(message),
            Err(e) => DecodeResult::Invalid(format!("malformed frame body: {}", e)),
        }
    }

    fn encode(&self, message: &Out) -> CoherenceResult<Bytes> {
        let body = bincode::serialize(message)
            .map_err(|e| CoherenceError::codec(format!("failed to encode frame: {}", e)))?;
        if body.len() > self.max_frame_len {
            return Err(CoherenceError::codec(format!(
                "frame of {} bytes exceeds limit of {}",
                body.len(),
                self.max_frame_len
            )));
        }
        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }
}

/// Read until one frame decodes. Returns `None` on a clean end of stream.
pub async fn read_frame<C, R>(
    codec: &C,
    reader: &mut R,
    buffer: &mut BytesMut,
) -> CoherenceResult<Option<C::Inbound>>
where
    C: ProtocolCodec,
    R: AsyncReadExt + Unpin,
{
    loop {
        match codec.decode(buffer) {
            DecodeResult::Complete(message) => return Ok(Some(message)),
            DecodeResult::Invalid(reason) => return Err(CoherenceError::codec(reason)),
            DecodeResult::Incomplete => {}
        }
        let n = reader.read_buf(buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(CoherenceError::codec("connection closed mid-frame"));
        }
    }
}

/// Encode and write one frame.
pub async fn write_frame<C, W>(
    codec: &C,
    writer: &mut W,
    message: &C::Outbound,
) -> CoherenceResult<()>
where
    C: ProtocolCodec,
    W: AsyncWrite + Unpin,
{
    let frame = codec.encode(message)?;
    writer.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::lock::{LockId, LockLevel, ThreadId};
    use crate::model::node::NodeId;
    use crate::protocol::messages::{LockMode, LockRequest};

    fn lock_message() -> ClientMessage {
        ClientMessage::Lock(LockRequest {
            lock_id: LockId::from("L1"),
            node: NodeId::client(4),
            thread: ThreadId(2),
            level: LockLevel::Write,
            mode: LockMode::Acquire,
            timer: None,
        })
    }

    #[test]
    fn test_partial_frames_are_incomplete() {
        let client = ClientCodec::new();
        let server = ServerCodec::new();
        let frame = client.encode(&lock_message()).unwrap();

        let mut buffer = BytesMut::from(&frame[..3]);
        assert!(matches!(server.decode(&mut buffer), DecodeResult::Incomplete));
        buffer.extend_from_slice(&frame[3..frame.len() - 1]);
        assert!(matches!(server.decode(&mut buffer), DecodeResult::Incomplete));
        buffer.extend_from_slice(&frame[frame.len() - 1..]);
        match server.decode(&mut buffer) {
            DecodeResult::Complete(message) => assert_eq!(message, lock_message()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let client = ClientCodec::new();
        let server = ServerCodec::new();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&client.encode(&lock_message()).unwrap());
        buffer.extend_from_slice(&client.encode(&ClientMessage::Goodbye).unwrap());
        assert!(matches!(server.decode(&mut buffer), DecodeResult::Complete(_)));
        assert!(matches!(
            server.decode(&mut buffer),
            DecodeResult::Complete(ClientMessage::Goodbye)
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let server = ServerCodec::with_max_frame_len(8);
        let mut buffer = BytesMut::new();
        buffer.put_u32(1024);
        assert!(matches!(server.decode(&mut buffer), DecodeResult::Invalid(_)));
    }

    #[test]
    fn test_garbage_body_is_invalid() {
        let server = ServerCodec::new();
        let mut buffer = BytesMut::new();
        buffer.put_u32(2);
        buffer.put_u8(0xff);
        buffer.put_u8(0xff);
        assert!(matches!(server.decode(&mut buffer), DecodeResult::Invalid(_)));
    }

    #[tokio::test]
    async fn test_read_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let client = ClientCodec::new();
        let server = ServerCodec::new();
        write_frame(&client, &mut a, &lock_message()).await.unwrap();
        drop(a);
        let mut buffer = BytesMut::new();
        let first = read_frame(&server, &mut b, &mut buffer).await.unwrap();
        assert_eq!(first, Some(lock_message()));
        let end = read_frame(&server, &mut b, &mut buffer).await.unwrap();
        assert_eq!(end, None);
    }
}
