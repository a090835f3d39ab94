//! # Transport Layer
//!
//! Sockets, buffers and the process-wide registry.
//!
//! ## Components
//! - **Connection**: receive buffer and inbound/outbound queues of one socket
//! - **Registry**: live sessions and pending redirects
//! - **Listener**: per-tier accept loop, receive tasks and flush scheduler
//! - **Jobs**: heartbeat, reaper and idle passes over game sessions

pub mod connection;
pub mod jobs;
pub mod listener;
pub mod registry;
