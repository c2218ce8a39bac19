//! # In-process event bus.
//!
//! [`EventBus`] decouples the inbound control stream and internal role
//! transitions from the role implementations.  It is an explicit value handed
//! to every component constructor, never a global.
//!
//! ## Rules
//! - **Idempotent subscribe**: registering the same handler (by `Arc`
//!   identity) twice for one event is a no-op.
//! - **Synchronous dispatch**: `emit()` calls every current handler in
//!   registration order before returning.
//! - **Isolation**: a handler error is logged and does not reach other
//!   handlers or the emitter.
//! - Handlers run outside the registry lock, so a handler may subscribe,
//!   unsubscribe or emit.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use tracing::{trace, warn};

/// Events exchanged between the role components of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Re-run the election; the generator lost (or gave up) its authority.
    StartAsListener,
    /// This worker was chosen as the new generator.
    StartAsGenerator,
    /// The listener finished handling one message.
    GotMessage,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartAsListener => "start-as-listener",
            Self::StartAsGenerator => "start-as-generator",
            Self::GotMessage => "got-message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Handler = Arc<dyn Fn(EventKind) -> Result<()> + Send + Sync>;

/// Wrap a closure as a [`Handler`].  Keep the returned value to unsubscribe
/// it later.
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(EventKind) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Mutex<HashMap<EventKind, Vec<Handler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Handler>>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `handler` for `event`.  Returns `false` when it was already
    /// registered.
    pub fn subscribe(&self, event: EventKind, handler: &Handler) -> bool {
        let mut registry = self.registry();
        let handlers = registry.entry(event).or_default();
        if handlers.iter().any(|h| Arc::ptr_eq(h, handler)) {
            return false;
        }
        handlers.push(Arc::clone(handler));
        true
    }

    /// Remove exactly this registration.  Returns `false` when it was not
    /// registered.
    pub fn unsubscribe(&self, event: EventKind, handler: &Handler) -> bool {
        let mut registry = self.registry();
        let Some(handlers) = registry.get_mut(&event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        before != handlers.len()
    }

    #[cfg(test)]
    pub fn handler_count(&self, event: EventKind) -> usize {
        self.registry().get(&event).map_or(0, Vec::len)
    }

    pub fn emit(&self, event: EventKind) {
        let handlers: Vec<Handler> = self.registry().get(&event).cloned().unwrap_or_default();
        trace!(%event, handlers = handlers.len(), "emit");
        for handler in handlers {
            if let Err(e) = handler(event) {
                warn!(%event, error = %e, "event handler failed");
            }
        }
    }
}
