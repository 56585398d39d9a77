//! Binary frame protocol for tunnel stream multiplexing.
//!
//! Frame layout (9-byte header + variable payload):
//! ```text
//! | stream_id (4B) | msg_type (1B) | payload_len (4B) | payload (NB) |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_SIZE: usize = 9;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 16 * 1024;

/// Message types for the tunnel protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    OpenStream = 0x01,
    Data = 0x02,
    WindowUpdate = 0x03,
    StreamEnd = 0x04,
    StreamReset = 0x05,
    Ping = 0x10,
    Pong = 0x11,
    GoAway = 0x12,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::OpenStream),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::WindowUpdate),
            0x04 => Some(Self::StreamEnd),
            0x05 => Some(Self::StreamReset),
            0x10 => Some(Self::Ping),
            0x11 => Some(Self::Pong),
            0x12 => Some(Self::GoAway),
            _ => None,
        }
    }
}

/// A single multiplexed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: u32,
    pub msg_type: MsgType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: u32, msg_type: MsgType, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            msg_type,
            payload: payload.into(),
        }
    }

    /// Control frame (stream_id = 0).
    pub fn control(msg_type: MsgType, payload: impl Into<Bytes>) -> Self {
        Self::new(0, msg_type, payload)
    }

    pub fn open(stream_id: u32) -> Self {
        Self::new(stream_id, MsgType::OpenStream, Bytes::new())
    }

    pub fn data(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(stream_id, MsgType::Data, payload)
    }

    /// Window replenishment of `delta` bytes for one stream.
    pub fn window_update(stream_id: u32, delta: u32) -> Self {
        Self::new(
            stream_id,
            MsgType::WindowUpdate,
            Bytes::copy_from_slice(&delta.to_be_bytes()),
        )
    }

    pub fn end(stream_id: u32) -> Self {
        Self::new(stream_id, MsgType::StreamEnd, Bytes::new())
    }

    pub fn reset(stream_id: u32) -> Self {
        Self::new(stream_id, MsgType::StreamReset, Bytes::new())
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMsgType(u8),
    #[error("frame payload too large: {0} bytes")]
    OversizedFrame(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frame codec for `FramedRead`/`FramedWrite`.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(ProtocolError::OversizedFrame(payload_len));
        }
        if src.len() < HEADER_SIZE + payload_len {
            src.reserve(HEADER_SIZE + payload_len - src.len());
            return Ok(None);
        }

        let stream_id = src.get_u32();
        let msg_type_raw = src.get_u8();
        src.advance(4);
        let msg_type =
            MsgType::from_u8(msg_type_raw).ok_or(ProtocolError::UnknownMsgType(msg_type_raw))?;
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame {
            stream_id,
            msg_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::OversizedFrame(frame.payload.len()));
        }
        dst.reserve(HEADER_SIZE + frame.payload.len());
        dst.put_u32(frame.stream_id);
        dst.put_u8(frame.msg_type as u8);
        dst.put_u32(frame.payload.len() as u32);
        dst.put(frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        FrameCodec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_roundtrip_data() {
        let out = roundtrip(Frame::data(7, Bytes::from_static(b"hello")));
        assert_eq!(out.stream_id, 7);
        assert_eq!(out.msg_type, MsgType::Data);
        assert_eq!(&out.payload[..], b"hello");
    }

    #[test]
    fn test_roundtrip_window_update() {
        let out = roundtrip(Frame::window_update(3, 65536));
        assert_eq!(out.msg_type, MsgType::WindowUpdate);
        assert_eq!(&out.payload[..], &65536u32.to_be_bytes());
    }

    #[test]
    fn test_partial_header_needs_more() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 0x02][..]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_payload_needs_more() {
        let mut buf = BytesMut::new();
        FrameCodec
            .encode(Frame::data(1, Bytes::from_static(b"abcdef")), &mut buf)
            .unwrap();
        let mut truncated = buf.split_to(buf.len() - 2);
        assert!(FrameCodec.decode(&mut truncated).unwrap().is_none());
    }

    #[test]
    fn test_unknown_msg_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0x7f);
        buf.put_u32(0);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(ProtocolError::UnknownMsgType(0x7f))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0x02);
        buf.put_u32((MAX_PAYLOAD + 1) as u32);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(ProtocolError::OversizedFrame(_))
        ));
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        FrameCodec.encode(Frame::open(1), &mut buf).unwrap();
        FrameCodec
            .encode(Frame::data(1, Bytes::from_static(b"x")), &mut buf)
            .unwrap();
        let first = FrameCodec.decode(&mut buf).unwrap().unwrap();
        let second = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.msg_type, MsgType::OpenStream);
        assert_eq!(second.msg_type, MsgType::Data);
        assert!(buf.is_empty());
    }
}
