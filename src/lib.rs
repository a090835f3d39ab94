//! # tiered-netcore
//!
//! Network session core for a tiered game server. Clients talk a
//! length-prefixed binary protocol with per-opcode XOR encryption and move
//! between three protocol tiers (lobby, login, world) through one-shot
//! redirect tickets.
//!
//! ## Layout
//! - [`core`]: frame layout, stream codec, payload readers and writers
//! - [`protocol`]: opcode tables, throttling, handshake frames, work queue
//! - [`service`]: sessions, tiers and heartbeat bookkeeping
//! - [`transport`]: connection buffers, registry, listeners and periodic jobs
//! - [`utils`]: cipher, logging, metrics, tick counter
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use tiered_netcore::{ConnectionRegistry, Listener, ProtocolTier, Tier};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> tiered_netcore::Result<()> {
//! let registry = ConnectionRegistry::new();
//! let stop = CancellationToken::new();
//! let login = Tier::builder(ProtocolTier::Login).build();
//! let listener = Listener::bind("127.0.0.1:2611", login, Arc::clone(&registry), stop.clone()).await?;
//! listener.spawn();
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::packet::{Direction, EncryptMethod, Frame};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::dispatcher::{DispatchOutcome, OpcodeTable};
pub use crate::protocol::throttle::{ThrottleEngine, ThrottleResult, ThrottleRule};
pub use crate::service::session::{DisconnectReason, Session};
pub use crate::service::tier::{ProtocolTier, Tier, TierBuilder};
pub use crate::transport::listener::Listener;
pub use crate::transport::registry::ConnectionRegistry;
