//! Game-loop side of the work queue.
//!
//! A [`WorkConsumer`] drains [`WorkItem`]s on one task. Inbound frames go to
//! the world opcode table with the owning session looked up in the registry;
//! control messages go to a map of control handlers. A failing handler only
//! affects its own item.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::OpcodeTable;
use crate::protocol::message::{ControlMessage, ControlOpcode, InboundWork, WorkItem, WorkReceiver};
use crate::transport::registry::ConnectionRegistry;

pub type ControlHandler = dyn Fn(&ControlMessage) -> Result<()> + Send + Sync + 'static;

pub struct WorkConsumer {
    registry: Arc<ConnectionRegistry>,
    handlers: OpcodeTable,
    control: HashMap<ControlOpcode, Box<ControlHandler>>,
}

impl fmt::Debug for WorkConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkConsumer")
            .field("handlers", &self.handlers)
            .field("control", &self.control.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkConsumer {
    pub fn new(registry: Arc<ConnectionRegistry>, handlers: OpcodeTable) -> Self {
        Self {
            registry,
            handlers,
            control: HashMap::new(),
        }
    }

    /// Register the handler for one control opcode, replacing any previous one.
    pub fn on_control<F>(mut self, opcode: ControlOpcode, handler: F) -> Self
    where
        F: Fn(&ControlMessage) -> Result<()> + Send + Sync + 'static,
    {
        self.control.insert(opcode, Box::new(handler));
        self
    }

    /// Process one work item.
    pub fn handle(&self, item: WorkItem) {
        match item {
            WorkItem::Inbound(work) => self.handle_inbound(work),
            WorkItem::Control(message) => self.handle_control(&message),
        }
    }

    fn handle_inbound(&self, work: InboundWork) {
        let Some(session) = self.registry.session(work.connection_id) else {
            debug!(
                connection_id = work.connection_id,
                opcode = work.frame.opcode,
                "session gone, dropping work item"
            );
            return;
        };
        if !session.is_connected() {
            return;
        }

        let outcome = self.handlers.dispatch(&session, &work.frame);
        session.apply_outcome(work.frame.opcode, outcome);
    }

    fn handle_control(&self, message: &ControlMessage) {
        let Some(handler) = self.control.get(&message.opcode) else {
            warn!(opcode = %message.opcode, "unhandled control message");
            return;
        };

        let result = catch_unwind(AssertUnwindSafe(|| handler(message))).unwrap_or_else(|_| {
            Err(ProtocolError::HandlerError(
                constants::ERR_HANDLER_PANICKED.to_string(),
            ))
        });
        if let Err(e) = result {
            error!(opcode = %message.opcode, error = %e, "control handler failed");
            self.registry.metrics().handler_fault();
        }
    }

    /// Drain `rx` until the queue closes or `shutdown` fires. Items already
    /// queued at shutdown are still processed.
    #[instrument(skip_all)]
    pub async fn run(self, mut rx: WorkReceiver, shutdown: CancellationToken) {
        info!("work consumer started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    rx.close();
                    while let Some(item) = rx.try_recv() {
                        self.handle(item);
                    }
                    break;
                }
                item = rx.recv() => match item {
                    Some(item) => self.handle(item),
                    None => break,
                },
            }
        }
        info!("work consumer stopped");
    }
}
