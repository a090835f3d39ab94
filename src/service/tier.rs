//! # Protocol Tiers
//!
//! A tier is one listening endpoint together with everything its sessions
//! share: the opcode table, throttle rules, optional game work queue, default
//! cipher and greeting, and the set of currently connected clients.
//!
//! Pre-game tiers (lobby, login) run opcode handlers directly on the receive
//! path. A tier built with a work queue (normally the world tier) forwards
//! frames to the game loop instead.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::config::NetworkConfig;
use crate::core::codec::DEFAULT_CAPACITY;
use crate::core::packet::Frame;
use crate::error::Result;
use crate::protocol::dispatcher::OpcodeTable;
use crate::protocol::message::WorkQueue;
use crate::protocol::throttle::{ThrottleEngine, ThrottleRule};
use crate::service::session::Session;
use crate::utils::crypto::Cipher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolTier {
    Lobby,
    Login,
    World,
}

impl ProtocolTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolTier::Lobby => "lobby",
            ProtocolTier::Login => "login",
            ProtocolTier::World => "world",
        }
    }

    /// Sessions of the game tier get heartbeats and cleanup notifications.
    pub fn is_game(self) -> bool {
        self == ProtocolTier::World
    }
}

impl fmt::Display for ProtocolTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Tier {
    kind: ProtocolTier,
    handlers: OpcodeTable,
    throttles: ThrottleEngine,
    work_queue: Option<WorkQueue>,
    default_cipher: Option<Cipher>,
    welcome: Option<Frame>,
    receive_buffer_capacity: usize,
    redirect_address: Ipv4Addr,
    redirect_delay: Duration,
    flush_interval: Duration,
    clients: DashMap<u64, Arc<Session>>,
    local_addr: OnceCell<SocketAddr>,
}

impl fmt::Debug for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tier")
            .field("kind", &self.kind)
            .field("local_addr", &self.local_addr.get())
            .field("clients", &self.clients.len())
            .field("queued", &self.work_queue.is_some())
            .finish_non_exhaustive()
    }
}

impl Tier {
    pub fn builder(kind: ProtocolTier) -> TierBuilder {
        TierBuilder::new(kind)
    }

    pub fn kind(&self) -> ProtocolTier {
        self.kind
    }

    pub fn handlers(&self) -> &OpcodeTable {
        &self.handlers
    }

    pub fn throttles(&self) -> &ThrottleEngine {
        &self.throttles
    }

    pub fn work_queue(&self) -> Option<&WorkQueue> {
        self.work_queue.as_ref()
    }

    /// Cipher new sessions start with. `None` means keys arrive with the join handoff.
    pub fn default_cipher(&self) -> Option<&Cipher> {
        self.default_cipher.as_ref()
    }

    /// Frame sent to every new session right after accept.
    pub fn welcome(&self) -> Option<&Frame> {
        self.welcome.as_ref()
    }

    pub fn receive_buffer_capacity(&self) -> usize {
        self.receive_buffer_capacity
    }

    pub fn redirect_address(&self) -> Ipv4Addr {
        self.redirect_address
    }

    pub fn redirect_delay(&self) -> Duration {
        self.redirect_delay
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Record the bound listen address; only the first call has an effect.
    pub fn set_local_addr(&self, addr: SocketAddr) {
        let _ = self.local_addr.set(addr);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn add_client(&self, session: Arc<Session>) {
        self.clients.insert(session.id(), session);
    }

    pub fn remove_client(&self, connection_id: u64) -> Option<Arc<Session>> {
        self.clients.remove(&connection_id).map(|(_, session)| session)
    }

    pub fn client(&self, connection_id: u64) -> Option<Arc<Session>> {
        self.clients.get(&connection_id).map(|entry| entry.value().clone())
    }

    pub fn clients(&self) -> Vec<Arc<Session>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Remove clients whose connection has closed, returning how many were removed.
    pub fn prune_disconnected(&self) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, session| session.is_connected());
        before.saturating_sub(self.clients.len())
    }
}

pub struct TierBuilder {
    kind: ProtocolTier,
    handlers: OpcodeTable,
    throttles: Vec<ThrottleRule>,
    work_queue: Option<WorkQueue>,
    default_cipher: Option<Cipher>,
    welcome: Option<Frame>,
    receive_buffer_capacity: usize,
    redirect_address: Ipv4Addr,
    redirect_delay: Duration,
    flush_interval: Duration,
}

impl TierBuilder {
    pub fn new(kind: ProtocolTier) -> Self {
        Self {
            kind,
            handlers: OpcodeTable::new(),
            throttles: Vec::new(),
            work_queue: None,
            default_cipher: (kind == ProtocolTier::Lobby).then(Cipher::lobby_default),
            welcome: None,
            receive_buffer_capacity: DEFAULT_CAPACITY,
            redirect_address: Ipv4Addr::LOCALHOST,
            redirect_delay: Duration::from_millis(250),
            flush_interval: Duration::from_millis(50),
        }
    }

    /// Builder seeded with the tier's section of `config`.
    pub fn from_config(kind: ProtocolTier, config: &NetworkConfig) -> Result<Self> {
        let tier = match kind {
            ProtocolTier::Lobby => &config.tiers.lobby,
            ProtocolTier::Login => &config.tiers.login,
            ProtocolTier::World => &config.tiers.world,
        };
        let transport = &config.transport;

        let mut builder = Self::new(kind)
            .throttles(tier.throttles.iter().cloned())
            .receive_buffer_capacity(transport.receive_buffer_capacity)
            .redirect_address(transport.redirect_address)
            .redirect_delay(transport.redirect_delay)
            .flush_interval(transport.flush_interval);

        if kind == ProtocolTier::Lobby {
            builder = builder.default_cipher(Cipher::new(
                transport.default_seed,
                transport.default_key.as_bytes(),
            )?);
        }
        Ok(builder)
    }

    pub fn handler<F>(mut self, opcode: u8, handler: F) -> Self
    where
        F: Fn(&Arc<Session>, &Frame) -> Result<Vec<Frame>> + Send + Sync + 'static,
    {
        self.handlers.register(opcode, handler);
        self
    }

    pub fn handlers(mut self, table: OpcodeTable) -> Self {
        self.handlers = table;
        self
    }

    pub fn throttle(mut self, rule: ThrottleRule) -> Self {
        self.throttles.push(rule);
        self
    }

    pub fn throttles<I>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = ThrottleRule>,
    {
        self.throttles.extend(rules);
        self
    }

    /// Forward frames to the game loop instead of running handlers inline.
    pub fn work_queue(mut self, queue: WorkQueue) -> Self {
        self.work_queue = Some(queue);
        self
    }

    pub fn default_cipher(mut self, cipher: Cipher) -> Self {
        self.default_cipher = Some(cipher);
        self
    }

    pub fn welcome(mut self, frame: Frame) -> Self {
        self.welcome = Some(frame);
        self
    }

    pub fn receive_buffer_capacity(mut self, capacity: usize) -> Self {
        self.receive_buffer_capacity = capacity;
        self
    }

    pub fn redirect_address(mut self, address: Ipv4Addr) -> Self {
        self.redirect_address = address;
        self
    }

    pub fn redirect_delay(mut self, delay: Duration) -> Self {
        self.redirect_delay = delay;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn build(self) -> Arc<Tier> {
        Arc::new(Tier {
            kind: self.kind,
            handlers: self.handlers,
            throttles: ThrottleEngine::new(self.throttles),
            work_queue: self.work_queue,
            default_cipher: self.default_cipher,
            welcome: self.welcome,
            receive_buffer_capacity: self.receive_buffer_capacity,
            redirect_address: self.redirect_address,
            redirect_delay: self.redirect_delay,
            flush_interval: self.flush_interval,
            clients: DashMap::new(),
            local_addr: OnceCell::new(),
        })
    }
}
