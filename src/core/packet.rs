//! # Frames
//!
//! The unit of communication between client and server.
//!
//! ```text
//! [0xAA] [Length u16 BE] [Opcode u8] [Ordinal u8, encrypted opcodes only] [Payload]
//! ```
//!
//! `Length` counts every byte after the length field, so a frame occupies
//! `Length + 3` bytes on the wire. Whether an opcode is encrypted (and therefore
//! carries an ordinal) depends on who sent it; see [`EncryptMethod::for_opcode`].

use std::time::Duration;

use bytes::{BufMut, BytesMut};

use crate::core::wire::FrameReader;
use crate::error::{constants, ProtocolError, Result};

/// First byte of every frame.
pub const SENTINEL: u8 = 0xAA;

/// Sentinel plus the 16-bit length.
pub const HEADER_LEN: usize = 3;

/// Largest body the 16-bit length field can describe.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Which side of the connection produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent by the game client, read by the server.
    Client,
    /// Sent by the server, read by the game client.
    Server,
}

impl Direction {
    /// The opposite side.
    pub fn peer(self) -> Direction {
        match self {
            Direction::Client => Direction::Server,
            Direction::Server => Direction::Client,
        }
    }
}

/// How a frame's payload is obfuscated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptMethod {
    None,
    /// Static session key.
    Normal,
    /// Per-frame key derived from the session key table.
    Md5Key,
}

impl EncryptMethod {
    /// Encryption method for `opcode` when sent by `direction`.
    pub fn for_opcode(direction: Direction, opcode: u8) -> EncryptMethod {
        match direction {
            Direction::Client => match opcode {
                0x00 | 0x10 | 0x48 => EncryptMethod::None,
                0x02 | 0x03 | 0x04 | 0x0B | 0x26 | 0x2D | 0x3A | 0x42 | 0x43 | 0x4B | 0x57
                | 0x62 | 0x68 | 0x71 | 0x73 | 0x7B => EncryptMethod::Normal,
                _ => EncryptMethod::Md5Key,
            },
            Direction::Server => match opcode {
                0x00 | 0x03 | 0x40 | 0x7E => EncryptMethod::None,
                0x01 | 0x02 | 0x0A | 0x56 | 0x60 | 0x62 | 0x66 | 0x6F => EncryptMethod::Normal,
                _ => EncryptMethod::Md5Key,
            },
        }
    }

    pub fn is_encrypted(self) -> bool {
        self != EncryptMethod::None
    }
}

/// A single protocol frame.
///
/// The same type carries plaintext frames (what handlers see) and sealed frames
/// (what travels on the wire); sealing and opening happen in
/// [`crate::utils::crypto::Cipher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub direction: Direction,
    pub opcode: u8,
    /// Per-direction sequence byte, present on the wire for encrypted opcodes only.
    pub ordinal: u8,
    pub payload: Vec<u8>,
    /// Pause the sender applies before writing this frame.
    pub transmit_delay: Option<Duration>,
}

impl Frame {
    pub fn new(direction: Direction, opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            direction,
            opcode,
            ordinal: 0,
            payload,
            transmit_delay: None,
        }
    }

    /// A frame produced by the server.
    pub fn server(opcode: u8, payload: Vec<u8>) -> Self {
        Self::new(Direction::Server, opcode, payload)
    }

    /// A frame produced by a client.
    pub fn client(opcode: u8, payload: Vec<u8>) -> Self {
        Self::new(Direction::Client, opcode, payload)
    }

    pub fn with_transmit_delay(mut self, delay: Duration) -> Self {
        self.transmit_delay = Some(delay);
        self
    }

    #[inline]
    pub fn encrypt_method(&self) -> EncryptMethod {
        EncryptMethod::for_opcode(self.direction, self.opcode)
    }

    #[inline]
    pub fn should_encrypt(&self) -> bool {
        self.encrypt_method().is_encrypted()
    }

    /// Body length as written into the length field.
    pub fn body_len(&self) -> usize {
        1 + usize::from(self.should_encrypt()) + self.payload.len()
    }

    /// Total size on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.body_len()
    }

    pub fn reader(&self) -> FrameReader<'_> {
        FrameReader::new(&self.payload)
    }

    /// Append the wire encoding to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) -> Result<()> {
        let body_len = self.body_len();
        if body_len > MAX_BODY_LEN {
            return Err(ProtocolError::OversizedFrame(body_len + HEADER_LEN));
        }

        dst.reserve(HEADER_LEN + body_len);
        dst.put_u8(SENTINEL);
        dst.put_u16(body_len as u16);
        dst.put_u8(self.opcode);
        if self.should_encrypt() {
            dst.put_u8(self.ordinal);
        }
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Serialize into a standalone buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.write_to(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Parse exactly one complete frame sent by `direction`.
    pub fn from_bytes(bytes: &[u8], direction: Direction) -> Result<Self> {
        let body_len = match peek_frame_len(bytes)? {
            Some(total) if total == bytes.len() => total - HEADER_LEN,
            Some(total) if total < bytes.len() => {
                return Err(ProtocolError::MalformedFrame("trailing bytes after frame"))
            }
            _ => return Err(ProtocolError::MalformedFrame(constants::ERR_MALFORMED_FRAME)),
        };
        if body_len == 0 {
            return Err(ProtocolError::MalformedFrame("frame has no opcode"));
        }

        let opcode = bytes[HEADER_LEN];
        let mut frame = Frame::new(direction, opcode, Vec::new());
        let mut offset = HEADER_LEN + 1;
        if frame.should_encrypt() {
            if body_len < 2 {
                return Err(ProtocolError::MalformedFrame("encrypted frame has no ordinal"));
            }
            frame.ordinal = bytes[offset];
            offset += 1;
        }
        frame.payload = bytes[offset..].to_vec();
        Ok(frame)
    }
}

/// Inspect the start of `buf` and return the total length of the frame it
/// begins with, or `None` if the header is not complete yet.
///
/// Fails if the first byte is not the sentinel.
pub fn peek_frame_len(buf: &[u8]) -> Result<Option<usize>> {
    match buf.first() {
        None => return Ok(None),
        Some(&SENTINEL) => {}
        Some(&other) => return Err(ProtocolError::InvalidSentinel(other)),
    }
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let body_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    Ok(Some(body_len + HEADER_LEN))
}
