//! Heartbeat bookkeeping for one session.
//!
//! Two independent probes run against game-tier sessions:
//!
//! - **byte**: the server sends two random bytes `(a, b)` with 0x3B and the
//!   client echoes them reversed with 0x45.
//! - **tick**: the server sends its tick counter with 0x68 and the client
//!   answers with 0x75 carrying that tick and its own.
//!
//! A session whose last accepted echo (of either kind) is older than the reap
//! threshold is considered dead.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Default)]
struct Probes {
    byte_pair: Option<(u8, u8)>,
    byte_accepted: Option<Instant>,
    tick: Option<i32>,
    tick_accepted: Option<Instant>,
    client_tick: Option<i32>,
    /// Send time of the first heartbeat; later sends leave it alone.
    first_sent: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct HeartbeatState {
    probes: Mutex<Probes>,
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self::default()
    }

    fn probes(&self) -> MutexGuard<'_, Probes> {
        self.probes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generate and remember a fresh byte pair. The new pair always differs
    /// from the previous one, so an old echo can never validate.
    pub fn next_byte_pair<R: Rng + ?Sized>(&self, rng: &mut R, now: Instant) -> (u8, u8) {
        let mut probes = self.probes();
        let pair = loop {
            let candidate = (rng.random_range(0..254), rng.random_range(0..254));
            if probes.byte_pair != Some(candidate) {
                break candidate;
            }
        };
        probes.byte_pair = Some(pair);
        probes.first_sent.get_or_insert(now);
        pair
    }

    pub fn is_byte_valid(&self, a: u8, b: u8) -> bool {
        self.probes().byte_pair == Some((a, b))
    }

    /// Check an echoed byte pair and record it as the latest heartbeat if valid.
    pub fn accept_byte_echo(&self, a: u8, b: u8, now: Instant) -> bool {
        let mut probes = self.probes();
        if probes.byte_pair != Some((a, b)) {
            return false;
        }
        probes.byte_accepted = Some(now);
        true
    }

    pub fn record_tick(&self, tick: i32, now: Instant) {
        let mut probes = self.probes();
        probes.tick = Some(tick);
        probes.first_sent.get_or_insert(now);
    }

    pub fn is_tick_valid(&self, local_tick: i32) -> bool {
        self.probes().tick == Some(local_tick)
    }

    /// Check an echoed tick and record it as the latest heartbeat if valid.
    pub fn accept_tick_echo(&self, local_tick: i32, client_tick: i32, now: Instant) -> bool {
        let mut probes = self.probes();
        if probes.tick != Some(local_tick) {
            return false;
        }
        probes.client_tick = Some(client_tick);
        probes.tick_accepted = Some(now);
        true
    }

    pub fn client_tick(&self) -> Option<i32> {
        self.probes().client_tick
    }

    /// Most recent accepted echo of either kind.
    pub fn last_accepted(&self) -> Option<Instant> {
        let probes = self.probes();
        probes.byte_accepted.max(probes.tick_accepted)
    }

    /// Whether the session has gone `threshold` without an accepted echo.
    ///
    /// Before any echo arrives the first heartbeat ever sent is the reference;
    /// a session that was never probed is never expired.
    pub fn is_expired(&self, now: Instant, threshold: Duration) -> bool {
        let probes = self.probes();
        let reference = match probes.byte_accepted.max(probes.tick_accepted) {
            Some(at) => at,
            None => match probes.first_sent {
                Some(at) => at,
                None => return false,
            },
        };
        now.saturating_duration_since(reference) > threshold
    }
}
