//! # Connection Registry
//!
//! Process-wide bookkeeping for live sessions and pending redirects. One
//! instance is constructed at startup and shared by every tier, listener and
//! job; nothing here is a global.
//!
//! ## Invariants
//! - Connection ids come from one counter and are never reused.
//! - A session is in the game map iff its tier is the game tier.
//! - A redirect is removed exactly once, by whoever claims it first.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::protocol::message::{ControlMessage, WorkQueue};
use crate::protocol::redirect::Redirect;
use crate::service::session::Session;
use crate::service::tier::ProtocolTier;
use crate::utils::metrics::Metrics;

#[derive(Debug)]
pub struct ConnectionRegistry {
    next_connection_id: AtomicU64,
    next_redirect_id: AtomicU32,
    sessions: DashMap<u64, Arc<Session>>,
    game_sessions: DashMap<u64, Arc<Session>>,
    redirects: DashMap<u32, Redirect>,
    control: OnceCell<WorkQueue>,
    metrics: Arc<Metrics>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            next_connection_id: AtomicU64::new(1),
            next_redirect_id: AtomicU32::new(1),
            sessions: DashMap::new(),
            game_sessions: DashMap::new(),
            redirects: DashMap::new(),
            control: OnceCell::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry that reports lifecycle events to the game loop through `queue`.
    pub fn with_work_queue(queue: WorkQueue) -> Arc<Self> {
        let registry = Self::default();
        let _ = registry.control.set(queue);
        Arc::new(registry)
    }

    /// Attach the game work queue. Returns `false` if one was already attached.
    pub fn set_work_queue(&self, queue: WorkQueue) -> bool {
        self.control.set(queue).is_ok()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_redirect_id(&self) -> u32 {
        self.next_redirect_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Deliver a control message to the game loop. A missing or closed queue
    /// is logged, never raised.
    pub fn push_control(&self, message: ControlMessage) -> bool {
        let Some(queue) = self.control.get() else {
            debug!(opcode = %message.opcode, "no work queue attached, control message dropped");
            return false;
        };
        match queue.push_control(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "work queue closed, control message dropped");
                false
            }
        }
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    pub fn register_session(&self, session: Arc<Session>) {
        let id = session.id();
        let kind = session.tier().kind();
        if kind.is_game() {
            self.game_sessions.insert(id, Arc::clone(&session));
        }
        self.sessions.insert(id, session);
        debug!(connection_id = id, tier = %kind, "session registered");
    }

    /// Remove a session. Game-tier removals notify the game loop so it can
    /// release the player. Returns whether the session was registered.
    pub fn deregister_session(&self, connection_id: u64, tier: ProtocolTier) -> bool {
        let removed = self.sessions.remove(&connection_id).is_some();

        if tier.is_game() {
            if self.game_sessions.remove(&connection_id).is_none() && removed {
                error!(connection_id, "game session missing from game map");
            }
            self.push_control(ControlMessage::cleanup_user(connection_id));
        }

        if removed {
            debug!(connection_id, %tier, "session deregistered");
        }
        removed
    }

    pub fn contains(&self, connection_id: u64) -> bool {
        self.sessions.contains_key(&connection_id)
    }

    pub fn session(&self, connection_id: u64) -> Option<Arc<Session>> {
        self.sessions
            .get(&connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn game_session(&self, connection_id: u64) -> Option<Arc<Session>> {
        self.game_sessions
            .get(&connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of the game sessions. Callers iterate the copy, never the map.
    pub fn game_sessions(&self) -> Vec<Arc<Session>> {
        self.game_sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// `(all sessions, game sessions, pending redirects)`
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.sessions.len(),
            self.game_sessions.len(),
            self.redirects.len(),
        )
    }

    // ---------------------------------------------------------------------
    // Redirects
    // ---------------------------------------------------------------------

    pub fn register_redirect(&self, redirect: Redirect) {
        debug!(
            redirect_id = redirect.id,
            origin = redirect.origin_connection(),
            destination = %redirect.destination,
            "redirect registered"
        );
        self.redirects.insert(redirect.id, redirect);
    }

    /// Remove and return redirect `id`, if it is still pending.
    pub fn try_consume_redirect(&self, id: u32) -> Option<Redirect> {
        self.redirects.remove(&id).map(|(_, redirect)| redirect)
    }

    /// Remove redirect `id` only if the presented credentials match it.
    pub fn claim_redirect(&self, id: u32, name: &str, key: &[u8], seed: u8) -> Option<Redirect> {
        self.redirects
            .remove_if(&id, |_, redirect| redirect.matches(name, key, seed))
            .map(|(_, redirect)| redirect)
    }

    /// Whether a pending redirect was issued by connection `connection_id`.
    pub fn has_redirect_from(&self, connection_id: u64) -> bool {
        self.redirects
            .iter()
            .any(|entry| entry.value().origin_connection() == connection_id)
    }

    pub fn pending_redirects(&self) -> usize {
        self.redirects.len()
    }

    /// Drop redirects created more than `older_than` before `now`,
    /// returning how many were dropped.
    pub fn sweep_redirects(&self, older_than: Duration, now: Instant) -> usize {
        let before = self.redirects.len();
        self.redirects
            .retain(|_, redirect| now.saturating_duration_since(redirect.created_at) <= older_than);
        let swept = before.saturating_sub(self.redirects.len());
        if swept > 0 {
            info!(swept, "abandoned redirects swept");
        }
        swept
    }

    /// Forget every session and redirect without notifying anyone.
    pub fn clear(&self) {
        self.sessions.clear();
        self.game_sessions.clear();
        self.redirects.clear();
    }
}
