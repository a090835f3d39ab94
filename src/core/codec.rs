//! # Frame Codec
//!
//! Tokio codec that cuts frames out of a byte stream.
//!
//! The decoder reads the 3-byte header, validates the sentinel and the total
//! length against the configured capacity, and yields a [`Frame`] only once the
//! whole frame has arrived. A partial frame stays in the buffer untouched.
//!
//! The encoder writes frames verbatim. Encrypted frames must already be sealed.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::core::packet::{peek_frame_len, Direction, Frame, HEADER_LEN};
use crate::error::{ProtocolError, Result};

/// Default receive capacity: the largest legal frame plus headroom.
pub const DEFAULT_CAPACITY: usize = 65_600;

#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Producer of the frames this codec decodes.
    incoming: Direction,
    capacity: usize,
}

impl FrameCodec {
    /// Codec decoding frames produced by `incoming`.
    pub fn new(incoming: Direction) -> Self {
        Self::with_capacity(incoming, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(incoming: Direction, capacity: usize) -> Self {
        Self { incoming, capacity }
    }

    /// Codec for the server side of a connection.
    pub fn server() -> Self {
        Self::new(Direction::Client)
    }

    /// Codec for the client side of a connection.
    pub fn client() -> Self {
        Self::new(Direction::Server)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let total = match peek_frame_len(src)? {
            Some(total) => total,
            None => return Ok(None),
        };
        if total > self.capacity {
            return Err(ProtocolError::OversizedFrame(total));
        }
        if total == HEADER_LEN {
            return Err(ProtocolError::MalformedFrame("frame has no opcode"));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total);
        let frame = Frame::from_bytes(&raw, self.incoming)?;
        trace!(opcode = frame.opcode, len = total, "frame decoded");
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        item.write_to(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_frame_is_left_in_buffer() {
        let mut codec = FrameCodec::server();
        let mut buf = BytesMut::from(&[0xAA, 0x00, 0x03, 0x00][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);

        buf.extend_from_slice(&[0x01, 0x02]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, 0x00);
        assert_eq!(frame.payload, vec![0x01, 0x02]);
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = FrameCodec::server();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::client(0x10, vec![1]), &mut buf)
            .unwrap();
        codec
            .encode(Frame::client(0x00, vec![2, 3]), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((first.opcode, first.payload), (0x10, vec![1]));
        assert_eq!((second.opcode, second.payload), (0x00, vec![2, 3]));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn capacity_limits_declared_length() {
        let mut codec = FrameCodec::with_capacity(Direction::Client, 16);
        let mut buf = BytesMut::from(&[0xAA, 0x00, 0x20][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedFrame(35))
        ));
    }

    #[test]
    fn sentinel_mismatch_is_fatal() {
        let mut codec = FrameCodec::server();
        let mut buf = BytesMut::from(&[0x41, 0x41, 0x41][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidSentinel(0x41))
        ));
    }
}
