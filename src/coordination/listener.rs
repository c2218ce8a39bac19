//! Listener role: consumes the message queue one item at a time.
//!
//! Each consume step blocks on the head of the queue, handles the message,
//! then emits `got-message`; the listener's own `got-message` handler starts
//! the next step.  Only one consume chain is ever alive: `start()` while
//! already active only re-registers membership, and a step that finishes
//! after `kill_yourself()` does not re-arm.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{debug, error, info, warn};

use super::node::WorkerId;
use crate::broker::{Broker, Keys};
use crate::events::{handler, EventBus, EventKind, Handler};
use crate::metrics::Metrics;
use crate::protocol::{HealthReply, QueueMessage};

/// Share of consumed messages treated as processing failures.
pub const ERROR_PROBABILITY: f64 = 0.05;

/// Decides whether the message being handled failed processing.
pub type ErrorClassifier = Arc<dyn Fn() -> bool + Send + Sync>;

pub fn random_error_classifier() -> ErrorClassifier {
    Arc::new(|| rand::thread_rng().gen_bool(ERROR_PROBABILITY))
}

pub struct Listener {
    broker: Arc<dyn Broker>,
    bus: EventBus,
    keys: Keys,
    worker_id: WorkerId,
    metrics: Arc<Metrics>,
    classifier: ErrorClassifier,
    retry_delay: Duration,
    got_message: Handler,
    active: AtomicBool,
    /// Bumped on every start and kill; a consume step only re-arms when
    /// the epoch it was started under is still current.
    epoch: AtomicU64,
}

impl Listener {
    pub fn new(
        broker: Arc<dyn Broker>,
        bus: EventBus,
        keys: Keys,
        worker_id: WorkerId,
        metrics: Arc<Metrics>,
        classifier: ErrorClassifier,
        retry_delay: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let this = Weak::clone(this);
            let got_message = handler(move |_| {
                if let Some(listener) = this.upgrade() {
                    let epoch = listener.epoch.load(Ordering::SeqCst);
                    listener.spawn_consume(epoch);
                }
                Ok(())
            });
            Self {
                broker,
                bus,
                keys,
                worker_id,
                metrics,
                classifier,
                retry_delay,
                got_message,
                active: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }
        })
    }

    /// Join the listener set and start consuming.  Safe to call while
    /// already listening.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(worker_id = %self.worker_id, "starting as listener");
        self.broker
            .set_add(&self.keys.listeners, self.worker_id.as_str())
            .await
            .context("join listener set")?;
        self.bus.subscribe(EventKind::GotMessage, &self.got_message);

        if !self.active.swap(true, Ordering::SeqCst) {
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            self.spawn_consume(epoch);
        }
        Ok(())
    }

    /// Stop consuming and leave the listener set.  Idempotent.
    ///
    /// A pop already waiting on the broker cannot be withdrawn; if it
    /// delivers a message that message is still handled, but nothing
    /// further is consumed.
    pub async fn kill_yourself(&self) -> Result<()> {
        if self.active.swap(false, Ordering::SeqCst) {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            info!(worker_id = %self.worker_id, "listener stopped");
        }
        self.bus.unsubscribe(EventKind::GotMessage, &self.got_message);
        self.broker
            .set_remove(&self.keys.listeners, self.worker_id.as_str())
            .await
            .context("leave listener set")?;
        Ok(())
    }

    /// Answer a liveness probe by pushing `{"status":"ok"}` to
    /// `reply_channel`.
    pub async fn health_status_sender(&self, reply_channel: &str) -> Result<()> {
        let reply = serde_json::to_string(&HealthReply::ok()).context("encode health reply")?;
        self.broker
            .push_tail(reply_channel, &reply)
            .await
            .with_context(|| format!("push health reply to {reply_channel}"))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn spawn_consume(self: &Arc<Self>, epoch: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.consume_once(epoch).await });
    }

    async fn consume_once(&self, epoch: u64) {
        match self.broker.blocking_pop_head(&self.keys.messages, None).await {
            Ok(Some(raw)) => self.handle_message(&raw).await,
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, retry_in = ?self.retry_delay, "failed to pop message queue");
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.bus.emit(EventKind::GotMessage);
        } else {
            debug!(epoch, "consume step outlived its listener; not re-arming");
        }
    }

    async fn handle_message(&self, raw: &str) {
        self.metrics.messages_consumed.inc();

        if (self.classifier)() {
            self.metrics.messages_errored.inc();
            warn!(%raw, "message failed processing; moving to error queue");
            if let Err(e) = self.broker.push_tail(&self.keys.errors, raw).await {
                error!(error = %e, %raw, "failed to push to error queue");
            }
            return;
        }

        match serde_json::from_str::<QueueMessage>(raw) {
            Ok(item) => debug!(message = %item.message, "message processed"),
            Err(e) => warn!(error = %e, %raw, "unexpected payload on message queue"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::metrics::MetricsRegistry;

    const WORKER: &str = "123";
    const MESSAGE: &str = r#"{"message":"abc"}"#;

    fn listener_with(broker: &Arc<MemoryBroker>, bus: &EventBus, fails: bool) -> Arc<Listener> {
        Listener::new(
            Arc::clone(broker) as Arc<dyn Broker>,
            bus.clone(),
            Keys::new("worker"),
            WorkerId::from(WORKER),
            MetricsRegistry::new().metrics,
            Arc::new(move || fails),
            Duration::from_secs(10),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_message_goes_to_error_queue() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = EventBus::new();
        broker.seed_list("worker:messages", &[MESSAGE]);
        let listener = listener_with(&broker, &bus, true);

        listener.start().await.unwrap();
        settle().await;

        assert_eq!(broker.members("worker:listeners"), vec![WORKER.to_string()]);
        assert_eq!(broker.count_on("set_add", "worker:listeners"), 1);
        assert_eq!(bus.handler_count(EventKind::GotMessage), 1);
        assert_eq!(broker.list("worker:errors"), vec![MESSAGE.to_string()]);
        assert!(broker.list("worker:messages").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_messages_stay_out_of_error_queue() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = EventBus::new();
        broker.seed_list("worker:messages", &[MESSAGE, MESSAGE, "not json"]);
        let listener = listener_with(&broker, &bus, false);

        listener.start().await.unwrap();
        settle().await;

        assert_eq!(broker.count("push_tail"), 0);
        assert!(broker.list("worker:messages").is_empty());
        // Three handled, one pop parked on the empty queue.
        assert_eq!(broker.count("blocking_pop_head"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_keeps_a_single_consume_chain() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = EventBus::new();
        let listener = listener_with(&broker, &bus, false);

        listener.start().await.unwrap();
        listener.start().await.unwrap();
        settle().await;
        assert_eq!(bus.handler_count(EventKind::GotMessage), 1);
        assert_eq!(broker.count("blocking_pop_head"), 1);

        broker.seed_list("worker:messages", &[MESSAGE, MESSAGE]);
        settle().await;
        assert_eq!(broker.count("blocking_pop_head"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_is_idempotent() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = EventBus::new();
        let listener = listener_with(&broker, &bus, false);

        listener.start().await.unwrap();
        listener.kill_yourself().await.unwrap();
        listener.kill_yourself().await.unwrap();

        assert!(!listener.is_active());
        assert_eq!(bus.handler_count(EventKind::GotMessage), 0);
        assert!(broker.members("worker:listeners").is_empty());
        assert_eq!(broker.count_on("set_remove", "worker:listeners"), 2);
    }

    #[tokio::test]
    async fn kill_before_start_is_safe() {
        let broker = Arc::new(MemoryBroker::new());
        let listener = listener_with(&broker, &EventBus::new(), false);
        listener.kill_yourself().await.unwrap();
        assert!(!listener.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_pop_does_not_rearm_after_kill() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = EventBus::new();
        let listener = listener_with(&broker, &bus, false);

        listener.start().await.unwrap();
        settle().await;
        listener.kill_yourself().await.unwrap();

        broker.seed_list("worker:messages", &[MESSAGE, MESSAGE]);
        settle().await;
        assert_eq!(broker.count("blocking_pop_head"), 1);
        assert_eq!(broker.list("worker:messages"), vec![MESSAGE.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_kill_resumes_consuming() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = EventBus::new();
        let listener = listener_with(&broker, &bus, false);

        listener.start().await.unwrap();
        settle().await;
        listener.kill_yourself().await.unwrap();
        listener.start().await.unwrap();
        settle().await;

        broker.seed_list("worker:messages", &[MESSAGE, MESSAGE, MESSAGE]);
        settle().await;
        assert!(broker.list("worker:messages").is_empty());
        assert_eq!(bus.handler_count(EventKind::GotMessage), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pop_failure_backs_off_and_retries() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = EventBus::new();
        broker.fail("blocking_pop_head");
        let listener = listener_with(&broker, &bus, false);

        listener.start().await.unwrap();
        settle().await;
        assert_eq!(broker.count("blocking_pop_head"), 1);

        broker.heal("blocking_pop_head");
        broker.seed_list("worker:messages", &[MESSAGE]);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(broker.list("worker:messages").is_empty());
        assert_eq!(broker.count("blocking_pop_head"), 3);
    }

    #[tokio::test]
    async fn health_reply_lands_on_reply_channel() {
        let broker = Arc::new(MemoryBroker::new());
        let listener = listener_with(&broker, &EventBus::new(), false);

        listener.health_status_sender("123").await.unwrap();
        assert_eq!(broker.list("123"), vec![r#"{"status":"ok"}"#.to_string()]);
    }

    #[tokio::test]
    async fn failed_health_reply_is_an_error() {
        let broker = Arc::new(MemoryBroker::new());
        broker.fail("push_tail");
        let listener = listener_with(&broker, &EventBus::new(), false);
        assert!(listener.health_status_sender("123").await.is_err());
    }
}
