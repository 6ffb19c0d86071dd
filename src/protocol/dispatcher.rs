use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::session::Session;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

type HandlerFn = dyn Fn(&Arc<Session>, &mut Message) -> Result<()> + Send + Sync + 'static;

/// Routes business opcodes that passed state gating to game-layer handlers.
///
/// The core never interprets business payloads; a handler receives the
/// message with its cursor at the start of the payload. Handlers get the
/// shared session so they can hand it to
/// [`MigrationCoordinator::request_migration`](crate::migration::MigrationCoordinator::request_migration).
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<u16, Box<HandlerFn>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("Dispatcher").field("handlers", &count).finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register<F>(&self, opcode: u16, handler: F) -> Result<()>
    where
        F: Fn(&Arc<Session>, &mut Message) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        handlers.insert(opcode, Box::new(handler));
        Ok(())
    }

    /// Run the handler for `msg`. Returns `false` when no handler is registered;
    /// unhandled opcodes are dropped, not treated as violations.
    pub fn dispatch(&self, session: &Arc<Session>, msg: &mut Message) -> Result<bool> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string()))?;

        match handlers.get(&msg.opcode()) {
            Some(handler) => handler(session, msg).map(|()| true),
            None => {
                debug!(session = session.sn(), opcode = msg.opcode(), "Unhandled business opcode");
                Ok(false)
            }
        }
    }
}
