//! # Sessions
//!
//! A [`Session`] is the server-side view of one connected client. It owns the
//! connection buffers, the session cipher, heartbeat and idle bookkeeping, and
//! the per-opcode throttle state, and it bridges all of that to the tier's
//! handlers or the game work queue.
//!
//! ## Receive path
//! ```text
//! socket bytes ─▶ receive buffer ─▶ frames ─▶ open ─▶ heartbeat ─▶ throttle ─▶ join ─▶ dispatch
//! ```
//!
//! ## Send path
//! Enqueueing never touches the socket. It pushes onto the outbound queue and
//! signals the session's sender task, which seals and writes frames in order.
//!
//! ## Lifecycle
//! `connected ─▶ (closing) ─▶ disconnected`. Disconnection is terminal and
//! idempotent; a reconnecting client always gets a new session.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::core::packet::Frame;
use crate::core::wire::FrameWriter;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::DispatchOutcome;
use crate::protocol::handshake::{
    client_op, server_op, system_message, ClientJoin, JoinOutcome, RedirectTicket, ABUSE_MESSAGE,
    SYSTEM_WITH_OVERHEAD,
};
use crate::protocol::message::ControlMessage;
use crate::protocol::redirect::Redirect;
use crate::protocol::throttle::{ThrottleResult, ThrottleTracker};
use crate::service::heartbeat::HeartbeatState;
use crate::service::tier::{ProtocolTier, Tier};
use crate::transport::connection::ConnectionState;
use crate::transport::registry::ConnectionRegistry;
use crate::utils::crypto::{Cipher, KeyTable};
use crate::utils::time::tick_count;

/// Write half of the client socket.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Zero-byte read
    ClientClosed,
    TransportError,
    /// Bad sentinel or a frame larger than the receive buffer
    FramingFault,
    /// Throttle disconnect threshold exceeded
    Abuse,
    HeartbeatExpired,
    /// Receive arrived for a connection id the registry no longer knows
    Unregistered,
    Requested,
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct Session {
    conn: ConnectionState,
    tier: Arc<Tier>,
    registry: Arc<ConnectionRegistry>,
    peer: SocketAddr,
    connected_since: Instant,
    cipher: RwLock<Option<Cipher>>,
    name: RwLock<Option<String>>,
    server_ordinal: AtomicU8,
    heartbeat: HeartbeatState,
    throttle: ThrottleTracker,
    dispatch_lock: Mutex<()>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    flush_signal: Notify,
    shutdown: CancellationToken,
    close_reason: Mutex<Option<DisconnectReason>>,
    last_received: Mutex<Instant>,
    idle: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("tier", &self.tier.kind())
            .field("peer", &self.peer)
            .field("name", &self.name())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Session {
    /// Create a session for connection `id` on `tier`.
    ///
    /// Without a `writer` outbound frames stay queued until drained by the caller.
    pub fn new(
        id: u64,
        tier: Arc<Tier>,
        registry: Arc<ConnectionRegistry>,
        peer: SocketAddr,
        writer: Option<BoxedWriter>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            conn: ConnectionState::new(id, tier.receive_buffer_capacity()),
            cipher: RwLock::new(tier.default_cipher().cloned()),
            tier,
            registry,
            peer,
            connected_since: now,
            name: RwLock::new(None),
            server_ordinal: AtomicU8::new(0),
            heartbeat: HeartbeatState::new(),
            throttle: ThrottleTracker::new(),
            dispatch_lock: Mutex::new(()),
            writer: tokio::sync::Mutex::new(writer),
            flush_signal: Notify::new(),
            shutdown,
            close_reason: Mutex::new(None),
            last_received: Mutex::new(now),
            idle: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    pub fn tier(&self) -> &Arc<Tier> {
        &self.tier
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.conn
    }

    pub fn connected_since(&self) -> Instant {
        self.connected_since
    }

    pub fn heartbeat(&self) -> &HeartbeatState {
        &self.heartbeat
    }

    pub fn throttle(&self) -> &ThrottleTracker {
        &self.throttle
    }

    pub fn cipher(&self) -> Option<Cipher> {
        self.cipher
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_cipher(&self, cipher: Cipher) {
        *self
            .cipher
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(cipher);
    }

    pub fn name(&self) -> Option<String> {
        self.name
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_name(&self, name: &str) {
        *self
            .name
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(name.to_string());
    }

    /// A session is authenticated once it has claimed a redirect.
    pub fn is_authenticated(&self) -> bool {
        self.name().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// A close was requested and is waiting for the sender to drain.
    pub fn is_closing(&self) -> bool {
        lock(&self.close_reason).is_some()
    }

    pub fn close_reason(&self) -> Option<DisconnectReason> {
        *lock(&self.close_reason)
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Resolves once the session has been disconnected.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    // ---------------------------------------------------------------------
    // Receive path
    // ---------------------------------------------------------------------

    /// Feed freshly read socket bytes through framing and dispatch.
    ///
    /// Errors are framing faults; the caller disconnects.
    pub fn receive_bytes(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        self.registry.metrics().bytes_read(bytes.len() as u64);
        let extracted = self.conn.append_received(bytes)? + self.conn.extract_frames()?;
        for _ in 0..extracted {
            self.registry.metrics().frame_received();
        }
        if extracted > 0 {
            self.process_inbound();
        }
        Ok(())
    }

    /// Queue a decoded frame and process the inbound queue.
    pub fn enqueue_inbound(self: &Arc<Self>, frame: Frame) {
        self.conn.push_inbound(frame);
        self.process_inbound();
    }

    /// Drain the inbound queue in arrival order.
    pub fn process_inbound(self: &Arc<Self>) {
        trace!(connection_id = self.id(), section = "dispatch", "acquiring lock");
        let _guard = lock(&self.dispatch_lock);

        while self.is_connected() && !self.is_closing() {
            let Some(frame) = self.conn.pop_inbound() else {
                break;
            };
            if let Some(frame) = self.open_inbound(frame) {
                self.route(frame, Instant::now());
            }
        }
    }

    fn open_inbound(&self, frame: Frame) -> Option<Frame> {
        if !frame.should_encrypt() {
            return Some(frame);
        }

        let Some(cipher) = self.cipher() else {
            warn!(
                connection_id = self.id(),
                opcode = frame.opcode,
                "encrypted frame before keys were established, dropping"
            );
            self.registry.metrics().handler_fault();
            return None;
        };

        match cipher.open(&frame) {
            Ok(opened) => Some(opened),
            Err(e) => {
                warn!(
                    connection_id = self.id(),
                    opcode = frame.opcode,
                    error = %e,
                    "failed to decrypt frame, dropping"
                );
                self.registry.metrics().handler_fault();
                None
            }
        }
    }

    fn route(self: &Arc<Self>, frame: Frame, now: Instant) {
        let kind = self.tier.kind();

        if kind.is_game() {
            match frame.opcode {
                client_op::BYTE_HEARTBEAT_ECHO => return self.on_byte_echo(&frame, now),
                client_op::TICK_HEARTBEAT_ECHO => return self.on_tick_echo(&frame, now),
                _ => {}
            }
        }

        match self
            .tier
            .throttles()
            .process_packet(&self.throttle, &frame, now)
        {
            ThrottleResult::Disconnect => {
                warn!(
                    connection_id = self.id(),
                    opcode = frame.opcode,
                    peer = %self.peer,
                    "throttle threshold exceeded, disconnecting"
                );
                self.abuse_disconnect();
            }
            ThrottleResult::Throttled => {
                self.registry.metrics().frame_throttled();
                debug!(connection_id = self.id(), opcode = frame.opcode, "throttled");
            }
            ThrottleResult::Squelched => {
                self.registry.metrics().frame_squelched();
                debug!(connection_id = self.id(), opcode = frame.opcode, "squelched");
            }
            ThrottleResult::Ok | ThrottleResult::ThrottleEnd | ThrottleResult::SquelchEnd => {
                self.update_last_received(now, true);
                if frame.opcode == client_op::JOIN && kind != ProtocolTier::Lobby {
                    if let Err(e) = self.handle_join(&frame) {
                        warn!(connection_id = self.id(), error = %e, "malformed join");
                    }
                }
                self.dispatch(frame);
            }
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        if let Some(queue) = self.tier.work_queue() {
            if let Err(e) = queue.push_inbound(self.id(), frame) {
                warn!(connection_id = self.id(), error = %e, "work queue closed, dropping frame");
            }
            return;
        }

        let outcome = self.tier.handlers().dispatch(self, &frame);
        self.apply_outcome(frame.opcode, outcome);
    }

    /// Queue a handler's replies, or log why there were none.
    pub fn apply_outcome(&self, opcode: u8, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Handled(replies) => {
                for reply in replies {
                    self.enqueue(reply);
                }
            }
            DispatchOutcome::Unhandled => {
                warn!(
                    connection_id = self.id(),
                    tier = %self.tier.kind(),
                    opcode = format_args!("0x{opcode:02X}"),
                    "unhandled opcode"
                );
            }
            DispatchOutcome::Faulted(e) => {
                error!(
                    connection_id = self.id(),
                    tier = %self.tier.kind(),
                    opcode = format_args!("0x{opcode:02X}"),
                    error = %e,
                    "handler failed"
                );
                self.registry.metrics().handler_fault();
            }
        }
    }

    fn on_byte_echo(&self, frame: &Frame, now: Instant) {
        let mut r = frame.reader();
        let (Ok(b), Ok(a)) = (r.u8(), r.u8()) else {
            debug!(connection_id = self.id(), "short byte heartbeat echo");
            return;
        };
        if self.heartbeat.accept_byte_echo(a, b, now) {
            trace!(connection_id = self.id(), "byte heartbeat valid");
        } else {
            debug!(connection_id = self.id(), a, b, "byte heartbeat mismatch");
        }
    }

    fn on_tick_echo(&self, frame: &Frame, now: Instant) {
        let mut r = frame.reader();
        let (Ok(local), Ok(client)) = (r.i32(), r.i32()) else {
            debug!(connection_id = self.id(), "short tick heartbeat echo");
            return;
        };
        if self.heartbeat.accept_tick_echo(local, client, now) {
            trace!(connection_id = self.id(), "tick heartbeat valid");
        } else {
            debug!(connection_id = self.id(), local, client, "tick heartbeat mismatch");
        }
    }

    /// Present a join to the registry. On a match the session adopts the
    /// redirect's keys and the client's name.
    #[instrument(skip_all, fields(connection_id = self.id(), tier = %self.tier.kind()))]
    pub fn handle_join(self: &Arc<Self>, frame: &Frame) -> Result<JoinOutcome> {
        let join = ClientJoin::parse(frame)?;

        if self.is_authenticated() {
            warn!(
                redirect_id = join.redirect_id,
                name = %join.name,
                "join on an authenticated session ignored"
            );
            return Ok(JoinOutcome::AlreadyAuthenticated {
                redirect_id: join.redirect_id,
            });
        }

        let Some(redirect) =
            self.registry
                .claim_redirect(join.redirect_id, &join.name, &join.key, join.seed)
        else {
            warn!(
                redirect_id = join.redirect_id,
                name = %join.name,
                "join did not match a pending redirect"
            );
            return Ok(JoinOutcome::Rejected {
                redirect_id: join.redirect_id,
            });
        };

        let cipher = Cipher::new(join.seed, join.key.clone())?
            .with_key_table(KeyTable::generate(&join.name));
        self.set_cipher(cipher);
        self.set_name(&join.name);
        self.registry.metrics().redirect_consumed();

        if self.tier.kind().is_game() {
            self.registry
                .push_control(ControlMessage::new_connection(self.id(), &join.name));
        }

        info!(
            redirect_id = redirect.id,
            source = %redirect.source,
            name = %join.name,
            "redirect claimed"
        );
        Ok(JoinOutcome::Accepted {
            redirect_id: redirect.id,
            source: redirect.source,
        })
    }

    // ---------------------------------------------------------------------
    // Send path
    // ---------------------------------------------------------------------

    /// Queue a frame for the sender task.
    pub fn enqueue(&self, frame: Frame) {
        let opcode = frame.opcode;
        match self.conn.push_outbound(frame) {
            Ok(()) => self.flush_signal.notify_one(),
            Err(e) => trace!(connection_id = self.id(), opcode, error = %e, "dropping outbound frame"),
        }
    }

    /// Wake the sender task.
    pub fn request_flush(&self) {
        self.flush_signal.notify_one();
    }

    /// Write every queued frame to the socket, returning how many were sent.
    ///
    /// An error means the socket is unusable.
    pub async fn flush_send(&self) -> Result<usize> {
        trace!(connection_id = self.id(), section = "send", "acquiring lock");
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Ok(0);
        };

        let mut sent = 0;
        let mut buf = BytesMut::with_capacity(256);
        while let Some(frame) = self.conn.pop_outbound() {
            buf.clear();
            if let Err(e) = self.prepare_outbound(&frame, &mut buf) {
                warn!(
                    connection_id = self.id(),
                    opcode = frame.opcode,
                    error = %e,
                    "cannot encode outbound frame, dropping"
                );
                self.registry.metrics().handler_fault();
                continue;
            }

            if let Some(delay) = frame.transmit_delay {
                tokio::time::sleep(delay).await;
            }
            writer.write_all(&buf).await?;
            self.registry.metrics().frame_sent(buf.len() as u64);
            sent += 1;
        }

        if sent > 0 {
            writer.flush().await?;
        }
        Ok(sent)
    }

    fn prepare_outbound(&self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        if !frame.should_encrypt() {
            return frame.write_to(dst);
        }
        let cipher = self
            .cipher()
            .ok_or(ProtocolError::KeysNotEstablished(constants::ERR_KEY_MISSING))?;
        let ordinal = self.server_ordinal.fetch_add(1, Ordering::AcqRel);
        cipher.seal(frame, ordinal, &mut rand::rng())?.write_to(dst)
    }

    /// Sender task: flush whenever signalled until the session closes.
    #[instrument(skip_all, fields(connection_id = self.id()))]
    pub async fn run_sender(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.flush_signal.notified() => {}
            }

            if let Err(e) = self.flush_send().await {
                debug!(error = %e, "send failed");
                self.disconnect(DisconnectReason::TransportError);
                break;
            }

            if let Some(reason) = self.close_reason() {
                self.close_writer().await;
                self.disconnect(reason);
                break;
            }
        }
        self.close_writer().await;
    }

    async fn close_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Stop processing input and close once queued output has been sent.
    pub fn request_close(&self, reason: DisconnectReason) {
        {
            let mut slot = lock(&self.close_reason);
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.flush_signal.notify_one();
    }

    /// Tell the client why and close the session.
    pub fn abuse_disconnect(&self) {
        self.registry.metrics().abuse_disconnect();
        self.enqueue(system_message(SYSTEM_WITH_OVERHEAD, ABUSE_MESSAGE));
        self.request_close(DisconnectReason::Abuse);
    }

    /// Tear the session down. Only the first call has any effect.
    pub fn disconnect(&self, reason: DisconnectReason) -> bool {
        if !self.conn.mark_disconnected() {
            return false;
        }

        self.shutdown.cancel();
        self.flush_signal.notify_one();
        self.conn.reset();
        self.registry.deregister_session(self.id(), self.tier.kind());
        self.tier.remove_client(self.id());
        self.registry.metrics().connection_closed();

        info!(
            connection_id = self.id(),
            tier = %self.tier.kind(),
            peer = %self.peer,
            %reason,
            "session disconnected"
        );
        true
    }

    /// Hand the client off to `destination`, returning the redirect id.
    ///
    /// Loopback peers are sent to loopback; everyone else gets the
    /// destination's advertised address.
    #[instrument(skip_all, fields(connection_id = self.id(), destination = %destination.kind()))]
    pub fn redirect(self: &Arc<Self>, destination: &Tier, name: &str) -> Result<u32> {
        let cipher = self
            .cipher()
            .ok_or(ProtocolError::KeysNotEstablished(constants::ERR_KEY_MISSING))?;
        let port = destination
            .local_addr()
            .map(|addr| addr.port())
            .ok_or_else(|| {
                ProtocolError::ConfigError(format!("{} tier is not listening", destination.kind()))
            })?;
        let address = if self.peer.ip().is_loopback() {
            Ipv4Addr::LOCALHOST
        } else {
            destination.redirect_address()
        };

        let mut ticket = RedirectTicket {
            address,
            port,
            seed: cipher.seed(),
            key: cipher.key().to_vec(),
            name: name.to_string(),
            id: 0,
        };
        if !ticket.fits() {
            return Err(ProtocolError::RedirectTooLong(ticket.fields_len()));
        }

        let id = self.registry.next_redirect_id();
        ticket.id = id;
        self.registry.register_redirect(Redirect {
            id,
            origin: Arc::clone(self),
            source: self.tier.kind(),
            destination: destination.kind(),
            name: name.to_string(),
            seed: cipher.seed(),
            key: cipher.key().to_vec(),
            created_at: Instant::now(),
        });

        self.enqueue(
            ticket
                .to_frame()
                .with_transmit_delay(destination.redirect_delay()),
        );
        self.registry.metrics().redirect_issued();

        info!(redirect_id = id, %address, port, "redirect issued");
        Ok(id)
    }

    // ---------------------------------------------------------------------
    // Heartbeats & idle
    // ---------------------------------------------------------------------

    /// Send a byte heartbeat unless the session is younger than `warmup`.
    pub fn send_byte_heartbeat(&self, now: Instant, warmup: Duration) -> bool {
        if now.saturating_duration_since(self.connected_since) < warmup {
            return false;
        }
        let (a, b) = self.heartbeat.next_byte_pair(&mut rand::rng(), now);
        self.enqueue(Frame::server(server_op::BYTE_HEARTBEAT, vec![a, b]));
        true
    }

    /// Send a tick heartbeat unless the session is younger than `warmup`.
    pub fn send_tick_heartbeat(&self, now: Instant, warmup: Duration) -> bool {
        if now.saturating_duration_since(self.connected_since) < warmup {
            return false;
        }
        let tick = tick_count();
        self.heartbeat.record_tick(tick, now);
        let mut w = FrameWriter::with_capacity(4);
        w.i32(tick);
        self.enqueue(Frame::server(server_op::TICK_HEARTBEAT, w.finish()));
        true
    }

    pub fn is_heartbeat_expired(&self, now: Instant, threshold: Duration) -> bool {
        self.heartbeat.is_expired(now, threshold)
    }

    /// Record inbound activity. With `clear_idle` an idle session wakes up.
    pub fn update_last_received(&self, now: Instant, clear_idle: bool) {
        *lock(&self.last_received) = now;
        if clear_idle {
            self.idle.store(false, Ordering::Release);
        }
    }

    pub fn last_received(&self) -> Instant {
        *lock(&self.last_received)
    }

    /// Toggle the idle flag if nothing arrived for longer than `threshold`.
    /// Returns the new flag when it changed.
    pub fn check_idle(&self, now: Instant, threshold: Duration) -> Option<bool> {
        let quiet = now.saturating_duration_since(self.last_received());
        if quiet <= threshold {
            trace!(connection_id = self.id(), quiet_ms = quiet.as_millis() as u64, "not idle");
            return None;
        }
        let idle = !self.idle.fetch_xor(true, Ordering::AcqRel);
        debug!(connection_id = self.id(), idle, "idle toggled");
        Some(idle)
    }
}
