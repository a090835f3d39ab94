//! # Error Types
//!
//! Error handling for the tiered session core.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`ProtocolError`]. Recoverable per-frame conditions (throttling, dispatch,
//! redirect claims) are modelled as closed result enums elsewhere; this type is
//! reserved for faults that stop the current operation.
//!
//! ## Error Categories
//! - **I/O Errors**: socket and file system failures
//! - **Framing Errors**: bad sentinel, oversized or malformed frames, buffer overflow
//! - **Cipher Errors**: missing keys, footer mismatch, invalid seeds
//! - **Lifecycle Errors**: closed connections, disconnected sessions, closed work queue
//!
//! ## Example Usage
//! ```rust
//! use tiered_netcore::error::{ProtocolError, Result};
//! use tracing::error;
//!
//! fn require_sentinel(byte: u8) -> Result<()> {
//!     if byte != 0xAA {
//!         return Err(ProtocolError::InvalidSentinel(byte));
//!     }
//!     Ok(())
//! }
//!
//! if let Err(e) = require_sentinel(0x00) {
//!     error!(error = %e, "framing fault");
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing
    pub const ERR_MALFORMED_FRAME: &str = "Frame body is shorter than its header requires";
    pub const ERR_FRAME_TOO_LARGE: &str = "Frame body exceeds the 16-bit length field";

    /// Cipher
    pub const ERR_KEY_MISSING: &str = "Session key has not been established";
    pub const ERR_KEY_TABLE_MISSING: &str = "Session key table has not been generated";
    pub const ERR_TRAILER_MISSING: &str = "Encrypted payload is shorter than its trailer";
    pub const ERR_DIALOG_HEADER: &str = "Dialog payload is shorter than its header";
    pub const ERR_DIALOG_LENGTH: &str = "Dialog length field exceeds the payload";

    /// Dispatch
    pub const ERR_HANDLER_PANICKED: &str = "Opcode handler panicked";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Lifecycle
    pub const ERR_WORK_QUEUE_CLOSED: &str = "Game work queue is closed";
}

// ProtocolError is the primary error type for all session core operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid frame sentinel: 0x{0:02X}")]
    InvalidSentinel(u8),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Receive buffer overflow: {buffered} bytes buffered, capacity {capacity}")]
    BufferOverflow { buffered: usize, capacity: usize },

    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("Payload underflow: needed {needed} bytes, {available} available")]
    PayloadUnderflow { needed: usize, available: usize },

    #[error("Encryption keys not established: {0}")]
    KeysNotEstablished(&'static str),

    #[error("Integrity check failed for opcode 0x{0:02X}")]
    IntegrityFailure(u8),

    #[error("Invalid encryption seed: {0}")]
    InvalidSeed(u8),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Session {0} is disconnected")]
    SessionDisconnected(u64),

    #[error("Work queue closed")]
    QueueClosed,

    #[error("Handler error: {0}")]
    HandlerError(String),

    #[error("Unknown redirect: {0}")]
    UnknownRedirect(u32),

    #[error("Redirect fields too long: {0} bytes")]
    RedirectTooLong(usize),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Faults that indicate a broken or hostile byte stream rather than a
    /// transient condition. The receive loop tears the connection down on these.
    pub fn is_framing_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidSentinel(_)
                | ProtocolError::OversizedFrame(_)
                | ProtocolError::BufferOverflow { .. }
                | ProtocolError::MalformedFrame(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
