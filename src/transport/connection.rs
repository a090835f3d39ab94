//! # Connection State
//!
//! Per-socket buffers and queues.
//!
//! The receive side (raw byte buffer, frame codec and the queue of extracted but
//! not yet dispatched frames) sits behind one mutex. The send side is a lock-free
//! queue so handlers on any thread can enqueue replies while the sender task
//! drains it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::BytesMut;
use crossbeam::queue::SegQueue;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::core::codec::FrameCodec;
use crate::core::packet::{Direction, Frame};
use crate::error::{ProtocolError, Result};

#[derive(Debug)]
struct ReceiveSide {
    buffer: BytesMut,
    codec: FrameCodec,
    inbound: VecDeque<Frame>,
}

#[derive(Debug)]
pub struct ConnectionState {
    id: u64,
    capacity: usize,
    receive: Mutex<ReceiveSide>,
    outbound: SegQueue<Frame>,
    connected: AtomicBool,
}

impl ConnectionState {
    /// State for a server-side connection reading client frames.
    pub fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            receive: Mutex::new(ReceiveSide {
                buffer: BytesMut::with_capacity(4096),
                codec: FrameCodec::with_capacity(Direction::Client, capacity),
                inbound: VecDeque::new(),
            }),
            outbound: SegQueue::new(),
            connected: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn receive(&self) -> MutexGuard<'_, ReceiveSide> {
        trace!(connection_id = self.id, section = "receive", "acquiring lock");
        self.receive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy freshly read bytes into the receive buffer.
    ///
    /// The buffer never grows past capacity. When `bytes` does not fit, complete
    /// frames are moved to the inbound queue to make room; the return value is
    /// how many were moved that way. Fails if the buffer is full and holds no
    /// complete frame.
    pub fn append_received(&self, bytes: &[u8]) -> Result<usize> {
        let mut rx = self.receive();
        let ReceiveSide {
            buffer,
            codec,
            inbound,
        } = &mut *rx;

        let mut rest = bytes;
        let mut moved = 0;
        loop {
            let room = self.capacity.saturating_sub(buffer.len());
            if rest.len() <= room {
                buffer.extend_from_slice(rest);
                return Ok(moved);
            }
            buffer.extend_from_slice(&rest[..room]);
            rest = &rest[room..];

            let before = moved;
            while let Some(frame) = codec.decode(buffer)? {
                inbound.push_back(frame);
                moved += 1;
            }
            if moved == before {
                return Err(ProtocolError::BufferOverflow {
                    buffered: buffer.len() + rest.len(),
                    capacity: self.capacity,
                });
            }
        }
    }

    /// Free space left in the receive buffer.
    pub fn receive_room(&self) -> usize {
        self.capacity.saturating_sub(self.receive().buffer.len())
    }

    /// Cut the next complete frame out of the receive buffer.
    pub fn try_extract_frame(&self) -> Result<Option<Frame>> {
        let mut rx = self.receive();
        let ReceiveSide { buffer, codec, .. } = &mut *rx;
        codec.decode(buffer)
    }

    /// Move every complete frame from the receive buffer to the inbound queue,
    /// returning how many were moved.
    pub fn extract_frames(&self) -> Result<usize> {
        let mut rx = self.receive();
        let ReceiveSide {
            buffer,
            codec,
            inbound,
        } = &mut *rx;
        let mut count = 0;
        while let Some(frame) = codec.decode(buffer)? {
            inbound.push_back(frame);
            count += 1;
        }
        Ok(count)
    }

    pub fn buffered_len(&self) -> usize {
        self.receive().buffer.len()
    }

    pub fn push_inbound(&self, frame: Frame) {
        self.receive().inbound.push_back(frame);
    }

    pub fn pop_inbound(&self) -> Option<Frame> {
        self.receive().inbound.pop_front()
    }

    pub fn inbound_len(&self) -> usize {
        self.receive().inbound.len()
    }

    pub fn push_outbound(&self, frame: Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(ProtocolError::SessionDisconnected(self.id));
        }
        self.outbound.push(frame);
        Ok(())
    }

    pub fn pop_outbound(&self) -> Option<Frame> {
        self.outbound.pop()
    }

    pub fn has_pending_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Flip to disconnected. Returns `true` only for the call that made the transition.
    pub fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    /// Drop all queued frames and zero the receive buffer.
    pub fn reset(&self) {
        {
            let mut rx = self.receive();
            rx.buffer.fill(0);
            rx.buffer.clear();
            rx.inbound.clear();
        }
        while self.outbound.pop().is_some() {}
    }
}
