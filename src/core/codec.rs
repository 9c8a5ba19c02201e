//! Message frame codec for `tokio_util`.
//!
//! ```text
//! [Magic(4)] [Id(4)] [Timestamp(4)] [Type(1)] [Length(4)] [Payload(N)]
//! ```
//!
//! The codec only frames; packet bodies are decoded afterwards with the
//! connection's negotiated version (see [`crate::core::registry`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{MAX_FRAME_SIZE, PROTOCOL_MAGIC};
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};

/// Size of the fixed frame header.
pub const FRAME_HEADER_SIZE: usize = 4 + 4 + 4 + 1 + 4;

/// One framed message before its payload is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub id: i32,
    /// Low 32 bits of the sender's wall clock, in milliseconds.
    pub timestamp: i32,
    pub packet_type: u8,
    pub payload: Bytes,
}

impl RawFrame {
    /// Frame `packet` for `version`, stamping the low bits of `now_ms`.
    pub fn from_packet(id: i32, now_ms: i64, packet: &Packet, version: i32) -> Self {
        Self {
            id,
            timestamp: now_ms as i32,
            packet_type: packet.packet_type().as_byte(),
            payload: packet.encode_to_bytes(version),
        }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Frames messages on an internode stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>> {
        // Validate the magic as soon as it is available so garbage fails fast.
        if src.len() >= 4 {
            let magic = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            if magic != PROTOCOL_MAGIC {
                return Err(ProtocolError::InvalidMagic(magic));
            }
        }
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[4..FRAME_HEADER_SIZE];
        let id = header.get_i32();
        let timestamp = header.get_i32();
        let packet_type = header.get_u8();
        let length = header.get_i32();

        if length < 0 {
            return Err(ProtocolError::MalformedLength(length as i64));
        }
        let length = length as usize;
        if length > self.max_frame_size {
            return Err(ProtocolError::OversizedFrame(length));
        }

        let total = FRAME_HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        Ok(Some(RawFrame {
            id,
            timestamp,
            packet_type,
            payload,
        }))
    }
}

impl Encoder<RawFrame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: RawFrame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_frame_size {
            return Err(ProtocolError::OversizedFrame(frame.payload.len()));
        }
        dst.reserve(frame.encoded_len());
        dst.put_i32(PROTOCOL_MAGIC);
        dst.put_i32(frame.id);
        dst.put_i32(frame.timestamp);
        dst.put_u8(frame.packet_type);
        dst.put_i32(frame.payload.len() as i32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
