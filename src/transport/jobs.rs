//! Periodic jobs over game-tier sessions: byte and tick heartbeats, the
//! heartbeat reaper and the idle check.
//!
//! Each pass works on a snapshot of the registry's game sessions so no map
//! lock is held while sessions are touched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::HeartbeatConfig;
use crate::protocol::message::ControlMessage;
use crate::service::session::DisconnectReason;
use crate::transport::registry::ConnectionRegistry;

/// Send a byte heartbeat to every authenticated game session past `warmup`.
pub fn byte_heartbeat_pass(registry: &ConnectionRegistry, now: Instant, warmup: Duration) -> usize {
    registry
        .game_sessions()
        .into_iter()
        .filter(|session| session.is_connected() && session.is_authenticated())
        .filter(|session| session.send_byte_heartbeat(now, warmup))
        .count()
}

/// Send a tick heartbeat to every authenticated game session past `warmup`.
pub fn tick_heartbeat_pass(registry: &ConnectionRegistry, now: Instant, warmup: Duration) -> usize {
    registry
        .game_sessions()
        .into_iter()
        .filter(|session| session.is_connected() && session.is_authenticated())
        .filter(|session| session.send_tick_heartbeat(now, warmup))
        .count()
}

/// Disconnect game sessions with no accepted heartbeat for `threshold`.
pub fn reap_pass(registry: &ConnectionRegistry, now: Instant, threshold: Duration) -> usize {
    let mut reaped = 0;
    for session in registry.game_sessions() {
        if !session.is_heartbeat_expired(now, threshold) {
            continue;
        }
        info!(
            connection_id = session.id(),
            name = ?session.name(),
            "heartbeat expired, reaping"
        );
        registry.metrics().heartbeat_reap();
        registry.push_control(ControlMessage::heartbeat_reaped(session.id()));
        if session.disconnect(DisconnectReason::HeartbeatExpired) {
            reaped += 1;
        }
    }
    reaped
}

/// Toggle the idle flag of game sessions quiet for longer than `threshold`.
pub fn idle_pass(registry: &ConnectionRegistry, now: Instant, threshold: Duration) -> usize {
    registry
        .game_sessions()
        .into_iter()
        .filter_map(|session| session.check_idle(now, threshold))
        .count()
}

fn every<F>(period: Duration, shutdown: CancellationToken, mut job: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => job(),
            }
        }
    })
}

/// Spawn the four heartbeat jobs. They stop when `shutdown` fires.
pub fn spawn_heartbeat_jobs(
    registry: Arc<ConnectionRegistry>,
    config: &HeartbeatConfig,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let warmup = config.warmup;
    let reap_threshold = config.reap_threshold;
    let idle_threshold = config.idle_threshold;

    let byte_registry = Arc::clone(&registry);
    let tick_registry = Arc::clone(&registry);
    let reap_registry = Arc::clone(&registry);
    let idle_registry = registry;

    vec![
        every(config.byte_interval, shutdown.clone(), move || {
            let sent = byte_heartbeat_pass(&byte_registry, Instant::now(), warmup);
            debug!(sent, "byte heartbeat pass");
        }),
        every(config.tick_interval, shutdown.clone(), move || {
            let sent = tick_heartbeat_pass(&tick_registry, Instant::now(), warmup);
            debug!(sent, "tick heartbeat pass");
        }),
        every(config.reap_check_interval, shutdown.clone(), move || {
            reap_pass(&reap_registry, Instant::now(), reap_threshold);
        }),
        every(config.idle_check_interval, shutdown, move || {
            let toggled = idle_pass(&idle_registry, Instant::now(), idle_threshold);
            if toggled > 0 {
                debug!(toggled, "idle pass");
            }
        }),
    ]
}
