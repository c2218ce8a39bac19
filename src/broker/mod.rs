//! Shared broker abstraction.
//!
//! Every piece of coordination state (generator lease, listener set, queues,
//! crashed-generator dedup set, control channel) lives in a Redis-compatible
//! broker reachable by all workers.  The [`Broker`] trait exposes exactly the
//! single-operation atomic primitives the protocol relies on, so that role
//! components can be exercised against the in-memory implementation in tests.

#[cfg(test)]
pub mod memory;
pub mod redis;

use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

/// A transport-level failure on a connection that backs authoritative
/// (lease / queue) operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerFault {
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// `GET key`.
    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    /// Atomically create `key` with a time-to-live, only when it does not
    /// exist.  Returns `true` when this call created it.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Overwrite `key` with a time-to-live.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Reset the time-to-live of an existing key.  Returns `false` when the
    /// key no longer exists.
    async fn refresh_expiry(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn push_tail(&self, list: &str, value: &str) -> Result<()>;

    /// Non-blocking pop of the list head.
    async fn pop_head(&self, list: &str) -> Result<Option<String>>;

    /// Pop the list head, waiting up to `timeout` for an element.  `None`
    /// waits indefinitely.  Returns `None` on timeout.
    async fn blocking_pop_head(&self, list: &str, timeout: Option<Duration>)
        -> Result<Option<String>>;

    async fn length(&self, list: &str) -> Result<u64>;

    /// Returns `true` when `member` was not already present.
    async fn set_add(&self, set: &str, member: &str) -> Result<bool>;

    /// Returns `true` when `member` was present.  Removing an absent member is
    /// not an error.
    async fn set_remove(&self, set: &str, member: &str) -> Result<bool>;

    async fn set_members(&self, set: &str) -> Result<Vec<String>>;

    async fn set_cardinality(&self, set: &str) -> Result<u64>;

    async fn set_pop_random(&self, set: &str) -> Result<Option<String>>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to `channel`; every payload published afterwards is
    /// delivered on the returned receiver.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;

    async fn ping(&self) -> Result<()>;

    /// Stream of connection faults on the authoritative connections.
    fn faults(&self) -> broadcast::Receiver<BrokerFault>;
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

/// Names of every key and channel used by one deployment namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    pub messages: String,
    pub errors: String,
    pub listeners: String,
    pub events: String,
    pub crashed_generators: String,
    pub generator: String,
}

impl Keys {
    pub fn new(namespace: &str) -> Self {
        Self {
            messages: format!("{namespace}:messages"),
            errors: format!("{namespace}:errors"),
            listeners: format!("{namespace}:listeners"),
            events: format!("{namespace}:events"),
            crashed_generators: format!("{namespace}:crashed:generator"),
            generator: format!("{namespace}:generator"),
        }
    }
}
