//! # Game Work Queue
//!
//! Everything the network core hands to the single-threaded game loop travels
//! through one queue: inbound frames from game-tier sessions and control
//! messages for lifecycle events.
//!
//! The queue is an unbounded tokio channel. Producers never block; a closed
//! queue is reported as [`ProtocolError::QueueClosed`] and the producer decides
//! whether that matters.

use std::fmt;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::core::packet::Frame;
use crate::error::{ProtocolError, Result};

/// Lifecycle and housekeeping events delivered to the game loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOpcode {
    /// A game-tier session completed its join handoff.
    NewConnection,
    /// A game-tier session left the registry; release its player.
    CleanupUser,
    /// A session was closed by the heartbeat reaper.
    HeartbeatReaped,
    SaveUser,
    LogoffUser,
    RegenUser,
    StatusTick,
    /// A client spammed a throttled refresh; resend its view.
    TriggerRefresh,
    ShutdownServer,
}

impl fmt::Display for ControlOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlArg {
    ConnectionId(u64),
    Name(String),
    Int(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub opcode: ControlOpcode,
    pub args: Vec<ControlArg>,
}

impl ControlMessage {
    pub fn new(opcode: ControlOpcode, args: Vec<ControlArg>) -> Self {
        Self { opcode, args }
    }

    pub fn new_connection(connection_id: u64, name: &str) -> Self {
        Self::new(
            ControlOpcode::NewConnection,
            vec![
                ControlArg::ConnectionId(connection_id),
                ControlArg::Name(name.to_string()),
            ],
        )
    }

    pub fn cleanup_user(connection_id: u64) -> Self {
        Self::new(
            ControlOpcode::CleanupUser,
            vec![ControlArg::ConnectionId(connection_id)],
        )
    }

    pub fn heartbeat_reaped(connection_id: u64) -> Self {
        Self::new(
            ControlOpcode::HeartbeatReaped,
            vec![ControlArg::ConnectionId(connection_id)],
        )
    }

    /// First connection id argument, if any.
    pub fn connection_id(&self) -> Option<u64> {
        self.args.iter().find_map(|arg| match arg {
            ControlArg::ConnectionId(id) => Some(*id),
            _ => None,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.args.iter().find_map(|arg| match arg {
            ControlArg::Name(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// A frame from a game-tier session, already decrypted and past throttling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundWork {
    pub connection_id: u64,
    pub frame: Frame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    Inbound(InboundWork),
    Control(ControlMessage),
}

/// Producer half of the game work queue.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: UnboundedSender<WorkItem>,
}

/// Consumer half of the game work queue.
#[derive(Debug)]
pub struct WorkReceiver {
    rx: UnboundedReceiver<WorkItem>,
}

/// Create a connected queue pair.
pub fn work_queue() -> (WorkQueue, WorkReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkQueue { tx }, WorkReceiver { rx })
}

impl WorkQueue {
    pub fn push(&self, item: WorkItem) -> Result<()> {
        self.tx.send(item).map_err(|_| ProtocolError::QueueClosed)
    }

    pub fn push_inbound(&self, connection_id: u64, frame: Frame) -> Result<()> {
        self.push(WorkItem::Inbound(InboundWork {
            connection_id,
            frame,
        }))
    }

    pub fn push_control(&self, message: ControlMessage) -> Result<()> {
        self.push(WorkItem::Control(message))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl WorkReceiver {
    pub async fn recv(&mut self) -> Option<WorkItem> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WorkItem> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting new items; queued items can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
