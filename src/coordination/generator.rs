//! Generator role: owns the lease and the message-production loop.
//!
//! While running, the generator renews the lease key every `re_expire_ms`
//! and pushes one random `{"message": …}` payload to the message queue every
//! `send_message_interval_ms`.  A renewal that fails means authority is gone:
//! the generator steps down by emitting `start-as-listener` rather than keep
//! producing without a valid lease.

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use super::node::WorkerId;
use super::timers::Timers;
use crate::broker::{Broker, Keys};
use crate::config::GeneratorConfig;
use crate::events::{EventBus, EventKind};
use crate::metrics::Metrics;
use crate::protocol::QueueMessage;

pub struct Generator {
    broker: Arc<dyn Broker>,
    bus: EventBus,
    keys: Keys,
    worker_id: WorkerId,
    config: GeneratorConfig,
    alphabet: Vec<char>,
    metrics: Arc<Metrics>,
    timers: Timers,
}

impl Generator {
    pub fn new(
        broker: Arc<dyn Broker>,
        bus: EventBus,
        keys: Keys,
        worker_id: WorkerId,
        config: GeneratorConfig,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let alphabet = config.alphabet.chars().collect();
        Arc::new(Self {
            broker,
            bus,
            keys,
            worker_id,
            config,
            alphabet,
            metrics,
            timers: Timers::new(),
        })
    }

    /// Take the generator role.  The caller already owns the lease claim.
    ///
    /// Fails only when the initial lease write fails; renewal and production
    /// failures are handled inside their own loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(worker_id = %self.worker_id, "starting as generator");
        self.timers.clear();

        self.broker
            .set_with_expiry(
                &self.keys.generator,
                self.worker_id.as_str(),
                self.config.lifetime(),
            )
            .await
            .context("write generator lease")?;
        self.renew_lease().await;

        let this = Arc::downgrade(self);
        self.timers.every(self.config.re_expire(), move || {
            let this = Weak::clone(&this);
            async move {
                if let Some(generator) = this.upgrade() {
                    generator.renew_lease().await;
                }
            }
        });

        self.send_message().await;

        let this = Arc::downgrade(self);
        self.timers.every(self.config.send_message_interval(), move || {
            let this = Weak::clone(&this);
            async move {
                if let Some(generator) = this.upgrade() {
                    generator.send_message().await;
                }
            }
        });
        Ok(())
    }

    /// Extend the lease TTL.  Returns `false` (after emitting
    /// `start-as-listener`) when the lease could not be renewed.
    pub async fn renew_lease(&self) -> bool {
        let lifetime = self.config.lifetime();
        match self.broker.refresh_expiry(&self.keys.generator, lifetime).await {
            Ok(true) => {
                debug!(worker_id = %self.worker_id, "generator lease renewed");
                return true;
            }
            Ok(false) => {
                warn!(worker_id = %self.worker_id, "generator lease vanished; stepping down");
            }
            Err(e) => {
                error!(
                    worker_id = %self.worker_id,
                    error = %e,
                    "generator lease renewal failed; stepping down"
                );
            }
        }
        self.metrics.lease_renewal_failures.inc();
        self.bus.emit(EventKind::StartAsListener);
        false
    }

    /// Produce one message and push it to the message queue.  Failures are
    /// logged; the production loop keeps going.
    pub async fn send_message(&self) {
        let payload = QueueMessage {
            message: self.generate_message(),
        };
        let encoded = match serde_json::to_string(&payload) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(error = %e, "failed to encode message");
                return;
            }
        };
        match self.broker.push_tail(&self.keys.messages, &encoded).await {
            Ok(()) => {
                self.metrics.messages_produced.inc();
                debug!(message = %payload.message, "message sent");
            }
            Err(e) => error!(error = %e, "failed to push message"),
        }
    }

    /// `message_length` characters drawn independently and uniformly from
    /// the alphabet.
    pub fn generate_message(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.config.message_length)
            .filter_map(|_| self.alphabet.choose(&mut rng))
            .collect()
    }

    /// Stop renewal and production.  Idempotent; safe before `start()`.
    pub fn clear_timers(&self) {
        self.timers.clear();
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.timers.active() > 0
    }
}
