//! # Utility Modules
//!
//! Supporting utilities for the session cipher, logging, metrics and timing.
//!
//! ## Components
//! - **Crypto**: salt tables, MD5 key tables, the frame cipher and the dialog layer
//! - **Logging**: `tracing-subscriber` setup from [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: atomic counters owned by the connection registry
//! - **Time**: process tick counter for heartbeats

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod time;
