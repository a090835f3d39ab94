//! # Tier Listener
//!
//! One TCP listener per protocol tier. The accept loop keeps exactly one
//! accept outstanding, turns each accepted socket into a [`Session`] with its
//! own sender and receiver tasks, and exits when the stop token fires.
//!
//! A flush scheduler runs beside the accept loop: at the tier's flush interval
//! it prunes disconnected clients and wakes the sender of every client with
//! queued output.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::Result;
use crate::service::session::{DisconnectReason, Session};
use crate::service::tier::Tier;
use crate::transport::registry::ConnectionRegistry;

/// Bytes requested from the socket per read.
pub const READ_CHUNK: usize = 4096;

pub struct Listener {
    listener: TcpListener,
    tier: Arc<Tier>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

impl Listener {
    /// Bind `addr` for `tier` and record the bound address on the tier.
    #[instrument(skip(tier, registry, shutdown), fields(tier = %tier.kind()))]
    pub async fn bind(
        addr: &str,
        tier: Arc<Tier>,
        registry: Arc<ConnectionRegistry>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tier.set_local_addr(local);
        info!(address = %local, "listening");

        Ok(Self {
            listener,
            tier,
            registry,
            shutdown,
            shutdown_timeout: Duration::from_secs(5),
        })
    }

    /// Time allowed for clients to drain their output once the stop token fires.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn tier(&self) -> &Arc<Tier> {
        &self.tier
    }

    /// Run [`serve`](Self::serve) on its own task.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.serve())
    }

    /// Accept connections until the stop token fires, then close the tier's
    /// clients.
    #[instrument(skip(self), fields(tier = %self.tier.kind()))]
    pub async fn serve(self) -> Result<()> {
        let flusher = spawn_flush_scheduler(Arc::clone(&self.tier), self.shutdown.clone());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("stop requested, closing listener");
                    break;
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(error = %e, %peer, "failed to set TCP_NODELAY");
                            }
                            attach(stream, peer, &self.tier, &self.registry);
                        }
                        Err(e) => {
                            error!(error = %e, "error accepting connection");
                        }
                    }
                }
            }
        }

        drop(self.listener);
        drain_clients(&self.tier, self.shutdown_timeout).await;
        if let Err(e) = flusher.await {
            warn!(error = %e, "flush scheduler task failed");
        }
        Ok(())
    }
}

/// Turn an accepted stream into a registered session with running sender and
/// receiver tasks.
pub fn attach<S>(
    stream: S,
    peer: SocketAddr,
    tier: &Arc<Tier>,
    registry: &Arc<ConnectionRegistry>,
) -> Arc<Session>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let id = registry.next_connection_id();
    let session = Session::new(
        id,
        Arc::clone(tier),
        Arc::clone(registry),
        peer,
        Some(Box::new(writer)),
        CancellationToken::new(),
    );

    registry.register_session(Arc::clone(&session));
    tier.add_client(Arc::clone(&session));
    registry.metrics().connection_established();
    info!(connection_id = id, tier = %tier.kind(), %peer, "connection accepted");

    if let Some(welcome) = tier.welcome() {
        session.enqueue(welcome.clone());
    }

    tokio::spawn(Arc::clone(&session).run_sender());
    tokio::spawn(run_receiver(Arc::clone(&session), reader));
    session
}

#[instrument(skip_all, fields(connection_id = session.id()))]
async fn run_receiver<R>(session: Arc<Session>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        // Never read more than the receive buffer can still hold.
        let room = session.connection().receive_room().min(READ_CHUNK);
        if room == 0 {
            warn!(peer = %session.peer(), "receive buffer full, disconnecting");
            session.registry().metrics().framing_fault();
            session.disconnect(DisconnectReason::FramingFault);
            break;
        }

        let read = tokio::select! {
            _ = session.closed() => break,
            read = reader.read(&mut buf[..room]) => read,
        };

        let n = match read {
            Ok(0) => {
                session.disconnect(DisconnectReason::ClientClosed);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "read failed");
                session.disconnect(DisconnectReason::TransportError);
                break;
            }
        };
        trace!(bytes = n, "read");

        if !ensure_registered(&session) {
            session.disconnect(DisconnectReason::Unregistered);
            break;
        }

        if let Err(e) = session.receive_bytes(&buf[..n]) {
            warn!(error = %e, peer = %session.peer(), "framing fault, disconnecting");
            session.registry().metrics().framing_fault();
            session.disconnect(DisconnectReason::FramingFault);
            break;
        }
    }
}

/// A session missing from the registry is only kept if it is mid-handoff.
fn ensure_registered(session: &Arc<Session>) -> bool {
    let registry = session.registry();
    if registry.contains(session.id()) {
        return true;
    }
    if registry.has_redirect_from(session.id()) {
        debug!(connection_id = session.id(), "re-registering session with pending redirect");
        registry.register_session(Arc::clone(session));
        return true;
    }
    false
}

/// Periodically prune disconnected clients and wake senders with queued output.
pub fn spawn_flush_scheduler(tier: Arc<Tier>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(tier.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let pruned = tier.prune_disconnected();
            if pruned > 0 {
                debug!(tier = %tier.kind(), pruned, "pruned disconnected clients");
            }
            for session in tier.clients() {
                if session.connection().has_pending_outbound() {
                    session.request_flush();
                }
            }
        }
    })
}

async fn drain_clients(tier: &Tier, timeout: Duration) {
    let clients = tier.clients();
    if clients.is_empty() {
        return;
    }
    info!(clients = clients.len(), "waiting for clients to drain");
    for session in &clients {
        session.request_close(DisconnectReason::Shutdown);
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!("shutdown timeout reached, forcing disconnect");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                if clients.iter().all(|session| !session.is_connected()) {
                    info!("all clients closed");
                    return;
                }
            }
        }
    }

    for session in clients {
        session.disconnect(DisconnectReason::Shutdown);
    }
}
