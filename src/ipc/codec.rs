//! Bridge socket framing: a big-endian `u32` length, then one
//! MessagePack-encoded [`Message`].
//!
//! The decoder yields [`Frame`]s. A payload naming a message type this
//! daemon does not know still decodes, as [`Frame::Unknown`], so newer
//! shims can send extra events without being disconnected. Payloads that
//! are not even a `{type, id}` map are a [`CodecError::Malformed`].

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{MAX_PAYLOAD_SIZE, Message, RawEnvelope};

const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit")]
    PayloadTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(#[source] rmp_serde::decode::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// One decoded frame.
#[derive(Debug, PartialEq)]
pub enum Frame {
    Message(Message),
    /// A well-formed message of a type this daemon does not handle.
    Unknown(RawEnvelope),
}

/// Decode one payload: first as a [`Message`], then as a bare envelope.
fn decode_frame(payload: &[u8]) -> Result<Frame, CodecError> {
    if let Ok(msg) = rmp_serde::from_slice::<Message>(payload) {
        return Ok(Frame::Message(msg));
    }
    rmp_serde::from_slice::<RawEnvelope>(payload)
        .map(Frame::Unknown)
        .map_err(CodecError::Malformed)
}

/// Codec for the bridge socket. Stateless: a frame is consumed only once
/// it is complete.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let Some(header) = src.get(..HEADER_LEN) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(len));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        decode_frame(&payload).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = rmp_serde::to_vec_named(&msg)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
