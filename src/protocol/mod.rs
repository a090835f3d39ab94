//! # Protocol Layer
//!
//! Everything between a decoded frame and the code that acts on it.
//!
//! ## Components
//! - **Dispatcher**: 256-slot opcode tables with explicit unhandled slots
//! - **Throttle**: per-opcode rate limiting, squelch and abuse escalation
//! - **Handshake**: lobby greeting, key exchange, redirect and join frames
//! - **Redirect**: one-shot handoff tickets between tiers
//! - **Message**: the game work queue and its control messages
//! - **Consumer**: the game-loop side of the work queue

pub mod consumer;
pub mod dispatcher;
pub mod handshake;
pub mod message;
pub mod redirect;
pub mod throttle;
