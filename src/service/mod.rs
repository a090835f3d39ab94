//! # Session Services
//!
//! Per-client sessions and the protocol tiers they belong to.

pub mod heartbeat;
pub mod session;
pub mod tier;
