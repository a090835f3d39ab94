use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::core::packet::Frame;
use crate::error::{constants, ProtocolError, Result};
use crate::service::session::Session;

/// Opcode handler. Returned frames are queued on the session in order.
pub type HandlerFn = dyn Fn(&Arc<Session>, &Frame) -> Result<Vec<Frame>> + Send + Sync + 'static;

/// One slot of an [`OpcodeTable`].
#[derive(Clone, Default)]
pub enum OpcodeHandler {
    #[default]
    Unhandled,
    Handler(Arc<HandlerFn>),
}

impl fmt::Debug for OpcodeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpcodeHandler::Unhandled => f.write_str("Unhandled"),
            OpcodeHandler::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// What happened when a frame was offered to its handler.
#[derive(Debug)]
pub enum DispatchOutcome {
    Handled(Vec<Frame>),
    Unhandled,
    /// The handler returned an error or panicked.
    Faulted(ProtocolError),
}

/// Fixed 256-entry opcode table, filled in when a tier is built.
#[derive(Clone)]
pub struct OpcodeTable {
    slots: Vec<OpcodeHandler>,
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OpcodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handled: Vec<String> = (0..=u8::MAX)
            .filter(|op| self.is_handled(*op))
            .map(|op| format!("0x{op:02X}"))
            .collect();
        f.debug_struct("OpcodeTable")
            .field("handled", &handled)
            .finish()
    }
}

impl OpcodeTable {
    pub fn new() -> Self {
        Self {
            slots: vec![OpcodeHandler::Unhandled; 256],
        }
    }

    pub fn register<F>(&mut self, opcode: u8, handler: F) -> &mut Self
    where
        F: Fn(&Arc<Session>, &Frame) -> Result<Vec<Frame>> + Send + Sync + 'static,
    {
        self.slots[opcode as usize] = OpcodeHandler::Handler(Arc::new(handler));
        self
    }

    pub fn handler(&self, opcode: u8) -> &OpcodeHandler {
        &self.slots[opcode as usize]
    }

    pub fn is_handled(&self, opcode: u8) -> bool {
        matches!(self.slots[opcode as usize], OpcodeHandler::Handler(_))
    }

    /// Run the handler for `frame`. A panicking handler is contained and
    /// reported as [`DispatchOutcome::Faulted`].
    pub fn dispatch(&self, session: &Arc<Session>, frame: &Frame) -> DispatchOutcome {
        let handler = match self.handler(frame.opcode) {
            OpcodeHandler::Handler(handler) => handler,
            OpcodeHandler::Unhandled => return DispatchOutcome::Unhandled,
        };

        match catch_unwind(AssertUnwindSafe(|| handler(session, frame))) {
            Ok(Ok(replies)) => DispatchOutcome::Handled(replies),
            Ok(Err(e)) => DispatchOutcome::Faulted(e),
            Err(_) => DispatchOutcome::Faulted(ProtocolError::HandlerError(
                constants::ERR_HANDLER_PANICKED.to_string(),
            )),
        }
    }
}
