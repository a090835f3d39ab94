//! # Throttling
//!
//! Per-opcode rate limiting for inbound frames.
//!
//! A [`ThrottleRule`] limits how often one opcode is accepted from a single
//! session. The rule's state lives on the session ([`ThrottleTracker`]), while the
//! rules themselves are shared by every session of a tier ([`ThrottleEngine`]).
//!
//! ```text
//!            frame within interval of last accepted
//!  accepting ─────────────────────────────────────▶ throttled ──▶ Disconnect
//!      ▲                                               │        (count > threshold)
//!      └───────────── ThrottleEnd ◀────────────────────┘
//!          (elapsed > duration and elapsed >= interval)
//! ```
//!
//! Rules may additionally squelch a repeated payload: once the same payload has
//! been accepted `count` times within `interval`, further copies are dropped for
//! `duration`.
//!
//! Evaluation takes an explicit `now` so tests can drive time directly.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::duration_serde;
use crate::core::packet::Frame;

/// Repeated-content suppression attached to a throttle rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquelchRule {
    /// Identical payloads accepted within `interval` before squelching starts
    pub count: u32,
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    /// How long a squelch lasts
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRule {
    pub opcode: u8,

    /// Minimum spacing between accepted frames
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Minimum time a throttle lasts once entered
    #[serde(with = "duration_serde", default)]
    pub duration: Duration,

    /// Consecutive throttled frames tolerated before disconnecting; 0 never disconnects
    #[serde(default)]
    pub disconnect_threshold: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squelch: Option<SquelchRule>,
}

impl ThrottleRule {
    pub fn new(opcode: u8, interval: Duration, duration: Duration, disconnect_threshold: u32) -> Self {
        Self {
            opcode,
            interval,
            duration,
            disconnect_threshold,
            squelch: None,
        }
    }

    pub fn with_squelch(mut self, squelch: SquelchRule) -> Self {
        self.squelch = Some(squelch);
        self
    }
}

/// Outcome of evaluating one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleResult {
    Ok,
    Throttled,
    ThrottleEnd,
    Squelched,
    SquelchEnd,
    /// The disconnect threshold was exceeded; the session must be closed.
    Disconnect,
}

impl ThrottleResult {
    /// Whether the frame continues on to dispatch.
    pub fn is_forwarded(self) -> bool {
        matches!(
            self,
            ThrottleResult::Ok | ThrottleResult::ThrottleEnd | ThrottleResult::SquelchEnd
        )
    }
}

#[derive(Debug, Default, Clone)]
struct SquelchState {
    subject: Option<u64>,
    hits: u32,
    window_start: Option<Instant>,
    squelched_until: Option<Instant>,
    total_squelched: u64,
}

impl SquelchState {
    fn evaluate(&mut self, rule: &SquelchRule, subject: u64, now: Instant) -> ThrottleResult {
        if let Some(until) = self.squelched_until {
            if now < until {
                if self.subject == Some(subject) {
                    self.total_squelched += 1;
                    return ThrottleResult::Squelched;
                }
                return ThrottleResult::Ok;
            }
            self.squelched_until = None;
            self.restart(subject, now);
            return ThrottleResult::SquelchEnd;
        }

        match (self.subject, self.window_start) {
            (Some(current), Some(start))
                if current == subject && now.saturating_duration_since(start) <= rule.interval =>
            {
                self.hits += 1;
                if self.hits >= rule.count {
                    self.squelched_until = Some(now + rule.duration);
                    self.total_squelched += 1;
                    return ThrottleResult::Squelched;
                }
            }
            _ => self.restart(subject, now),
        }
        ThrottleResult::Ok
    }

    fn restart(&mut self, subject: u64, now: Instant) {
        self.subject = Some(subject);
        self.hits = 1;
        self.window_start = Some(now);
    }
}

/// Throttle bookkeeping for one (session, opcode) pair.
#[derive(Debug, Default, Clone)]
pub struct ThrottleState {
    pub received: u64,
    pub accepted: u64,
    pub last_received: Option<Instant>,
    pub last_accepted: Option<Instant>,
    pub throttled: bool,
    /// Throttled frames since the throttle was entered
    pub throttled_count: u32,
    pub total_throttled: u64,
    squelch: SquelchState,
}

impl ThrottleState {
    pub fn total_squelched(&self) -> u64 {
        self.squelch.total_squelched
    }

    fn accept(&mut self, now: Instant) {
        self.accepted += 1;
        self.last_accepted = Some(now);
    }

    fn throttle_hit(&mut self, rule: &ThrottleRule) -> ThrottleResult {
        self.throttled_count += 1;
        self.total_throttled += 1;
        if rule.disconnect_threshold > 0 && self.throttled_count > rule.disconnect_threshold {
            ThrottleResult::Disconnect
        } else {
            ThrottleResult::Throttled
        }
    }

    pub fn evaluate(&mut self, rule: &ThrottleRule, payload: &[u8], now: Instant) -> ThrottleResult {
        self.received += 1;
        self.last_received = Some(now);

        let since_accepted = self
            .last_accepted
            .map(|at| now.saturating_duration_since(at));

        if self.throttled {
            let elapsed = since_accepted.unwrap_or(Duration::MAX);
            if elapsed > rule.duration && elapsed >= rule.interval {
                self.throttled = false;
                self.throttled_count = 0;
                self.accept(now);
                return ThrottleResult::ThrottleEnd;
            }
            return self.throttle_hit(rule);
        }

        if matches!(since_accepted, Some(elapsed) if elapsed <= rule.interval) {
            self.throttled = true;
            return self.throttle_hit(rule);
        }

        self.accept(now);
        match rule.squelch {
            Some(ref squelch) => self.squelch.evaluate(squelch, subject_hash(payload), now),
            None => ThrottleResult::Ok,
        }
    }
}

fn subject_hash(payload: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish()
}

/// Per-session throttle state, keyed by opcode.
#[derive(Debug, Default)]
pub struct ThrottleTracker {
    states: Mutex<HashMap<u8, ThrottleState>>,
}

impl ThrottleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the state for `opcode`, if any frame with it has been evaluated.
    pub fn state(&self, opcode: u8) -> Option<ThrottleState> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&opcode)
            .cloned()
    }
}

/// The throttle rules of one tier.
#[derive(Debug, Default, Clone)]
pub struct ThrottleEngine {
    rules: HashMap<u8, ThrottleRule>,
}

impl ThrottleEngine {
    pub fn new<I>(rules: I) -> Self
    where
        I: IntoIterator<Item = ThrottleRule>,
    {
        Self {
            rules: rules.into_iter().map(|rule| (rule.opcode, rule)).collect(),
        }
    }

    pub fn rule(&self, opcode: u8) -> Option<&ThrottleRule> {
        self.rules.get(&opcode)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate `frame` against its opcode's rule. Opcodes without a rule are
    /// always [`ThrottleResult::Ok`].
    pub fn process_packet(
        &self,
        tracker: &ThrottleTracker,
        frame: &Frame,
        now: Instant,
    ) -> ThrottleResult {
        let Some(rule) = self.rules.get(&frame.opcode) else {
            return ThrottleResult::Ok;
        };

        let mut states = tracker
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = states.entry(frame.opcode).or_default();
        let result = state.evaluate(rule, &frame.payload, now);
        if result != ThrottleResult::Ok {
            debug!(
                opcode = frame.opcode,
                ?result,
                throttled_count = state.throttled_count,
                "throttle transition"
            );
        }
        result
    }
}
