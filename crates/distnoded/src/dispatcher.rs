//! Message dispatcher.
//!
//! Maps a decoded [`Envelope`]'s `kind` to a registered handler. Built once
//! at startup and shared (via `Arc`) across every inbound connection task.

use distnode_core::protocol::{Envelope, MessageKind};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// A handler invoked for every decoded envelope of its registered kind.
pub trait Handler: Send + Sync {
    fn handle(&self, envelope: Envelope) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        self(envelope)
    }
}

/// An error surfaced by a handler. The inbound server logs this and keeps
/// the connection open — a handler error is never fatal to the transport.
#[derive(Debug, Error)]
pub struct HandlerError(pub String);

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur while building a dispatcher. Fatal at startup.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("handler already registered for {0:?}")]
    DuplicateHandler(MessageKind),
}

/// Routes decoded envelopes to their registered handler by `kind`.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<MessageKind, Box<dyn Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `kind`. Fails if a handler is already
    /// registered for that kind — this is a startup-time configuration
    /// error, not a runtime condition.
    pub fn register(&mut self, kind: MessageKind, handler: impl Handler + 'static) -> Result<(), DispatcherError> {
        if self.handlers.contains_key(&kind) {
            return Err(DispatcherError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, Box::new(handler));
        Ok(())
    }

    /// Dispatches `envelope` to its registered handler. An envelope whose
    /// kind has no registered handler is logged and dropped — this is not
    /// an error, since the wire protocol intentionally reserves kinds that
    /// today have no handler (`GOSSIP_STATE`, `FULL_SYNC_REQUEST`, ...).
    pub fn dispatch(&self, envelope: Envelope) -> Result<(), HandlerError> {
        match self.handlers.get(&envelope.kind) {
            Some(handler) => handler.handle(envelope),
            None => {
                warn!(kind = ?envelope.kind, "no handler registered, dropping message");
                Ok(())
            }
        }
    }
}

/// A no-op handler for `PING`/`PONG`: logged at debug, never an error.
/// These kinds are declared in the wire protocol but have no established
/// request/response semantics in this node.
pub fn noop_handler() -> impl Handler {
    |envelope: Envelope| {
        debug!(kind = ?envelope.kind, sender = %envelope.sender_id, "no-op message received");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: MessageKind) -> Envelope {
        Envelope::new(kind, "node-1", json!({}))
    }

    #[test]
    fn register_rejects_duplicate_kind() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(MessageKind::Ping, noop_handler()).unwrap();
        let result = dispatcher.register(MessageKind::Ping, noop_handler());
        assert!(result.is_err());
    }

    #[test]
    fn dispatch_unknown_kind_is_ok() {
        let dispatcher = Dispatcher::new();
        let result = dispatcher.dispatch(envelope(MessageKind::GossipState));
        assert!(result.is_ok());
    }

    #[test]
    fn dispatch_routes_to_registered_handler() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(MessageKind::Ping, move |_env: Envelope| {
                called_clone.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        dispatcher.dispatch(envelope(MessageKind::Ping)).unwrap();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn dispatch_propagates_handler_errors() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(MessageKind::Ping, |_env: Envelope| {
                Err(HandlerError("boom".to_string()))
            })
            .unwrap();

        let result = dispatcher.dispatch(envelope(MessageKind::Ping));
        assert!(result.is_err());
    }
}
