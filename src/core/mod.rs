//! # Core Protocol Components
//!
//! Frame layout, stream codec and typed payload access.
//!
//! ## Components
//! - **Packet**: [`Frame`](packet::Frame), direction and per-opcode encryption method
//! - **Codec**: Tokio codec for cutting frames out of a byte stream
//! - **Wire**: big-endian readers and writers with `String8`/`String16` support
//!
//! ## Wire Format
//! ```text
//! [0xAA] [Length(2)] [Opcode(1)] [Ordinal(1), encrypted only] [Payload(N)]
//! ```
//!
//! ## Safety
//! - Sentinel checked before the length is trusted
//! - Declared length checked against the receive capacity before buffering

pub mod codec;
pub mod packet;
pub mod wire;
