//! Role coordinator: decides, and re-decides, which role this worker plays.
//!
//! ```text
//! Unstarted ──election──▶ Generator | Listener
//!     ▲                        │
//!     └── Restarting ◀── broker fault / election error
//! ```
//!
//! Election reads the lease; a held lease means Listener, a free one is
//! claimed with set-if-absent and the winner becomes Generator.  The claim
//! already carries the lease TTL, so a claim whose generator never starts
//! expires and the watchers fail over as for a crash.  Every
//! trigger (bus events, inbound control messages, broker faults) is funnelled
//! into one control channel and handled in order by [`Coordinator::run`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::generator::Generator;
use super::listener::{random_error_classifier, Listener};
use super::node::WorkerId;
use super::watcher::Watcher;
use crate::broker::{Broker, BrokerFault, Keys};
use crate::config::Config;
use crate::events::{handler, EventBus, EventKind, Handler};
use crate::metrics::{Metrics, RoleLabel, RoleLabels};
use crate::protocol::{ControlEventType, ControlMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unstarted,
    Generator,
    Listener,
    Restarting,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Generator => "generator",
            Self::Listener => "listener",
            Self::Restarting => "restarting",
        }
    }

    fn label(&self) -> Option<RoleLabel> {
        match self {
            Self::Unstarted => None,
            Self::Generator => Some(RoleLabel::Generator),
            Self::Listener => Some(RoleLabel::Listener),
            Self::Restarting => Some(RoleLabel::Restarting),
        }
    }
}

enum Control {
    StartAsListener,
    StartAsGenerator,
    Fault { detail: String, at: Instant },
}

pub struct Coordinator {
    broker: Arc<dyn Broker>,
    bus: EventBus,
    keys: Keys,
    worker_id: WorkerId,
    generator: Arc<Generator>,
    listener: Arc<Listener>,
    watcher: Arc<Watcher>,
    lease_lifetime: Duration,
    restart_timeout: Duration,
    metrics: Arc<Metrics>,
    role: watch::Sender<Role>,
}

impl Coordinator {
    pub fn new(
        broker: Arc<dyn Broker>,
        bus: EventBus,
        config: &Config,
        worker_id: WorkerId,
        metrics: Arc<Metrics>,
    ) -> Self {
        let keys = Keys::new(&config.broker.namespace);
        let restart_timeout = config.worker.restart_timeout();
        let generator = Generator::new(
            Arc::clone(&broker),
            bus.clone(),
            keys.clone(),
            worker_id.clone(),
            config.generator.clone(),
            Arc::clone(&metrics),
        );
        let listener = Listener::new(
            Arc::clone(&broker),
            bus.clone(),
            keys.clone(),
            worker_id.clone(),
            Arc::clone(&metrics),
            random_error_classifier(),
            restart_timeout,
        );
        let watcher = Watcher::new(
            Arc::clone(&broker),
            bus.clone(),
            keys.clone(),
            config.watcher.clone(),
            Arc::clone(&metrics),
        );
        let (role, _) = watch::channel(Role::Unstarted);

        Self {
            broker,
            bus,
            keys,
            worker_id,
            generator,
            listener,
            watcher,
            lease_lifetime: config.generator.lifetime(),
            restart_timeout,
            metrics,
            role,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Observe role changes.
    pub fn role(&self) -> watch::Receiver<Role> {
        self.role.subscribe()
    }

    fn current_role(&self) -> Role {
        *self.role.borrow()
    }

    /// Drive the worker until `shutdown` fires, then stop every timer and
    /// leave the listener set.  The lease is left to expire on its own.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(worker_id = %self.worker_id, "worker starting");
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let bridge = self.bridge_bus(&control_tx);

        let Some(inbound) = self.subscribe_events(&shutdown).await else {
            self.unbridge(&bridge);
            return Ok(());
        };
        let dispatcher = InboundDispatcher {
            worker_id: self.worker_id.clone(),
            listener: Arc::clone(&self.listener),
            bus: self.bus.clone(),
        };
        let dispatch_task = tokio::spawn(dispatcher.run(inbound));
        let fault_task = tokio::spawn(forward_faults(self.broker.faults(), control_tx.clone()));

        self.watcher.watch();
        self.elect_until_started(&shutdown).await;
        let mut settled_at = Instant::now();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(control) = control_rx.recv() => match control {
                    Control::StartAsListener => {
                        info!(worker_id = %self.worker_id, "re-entering election");
                        self.generator.clear_timers();
                        self.elect_until_started(&shutdown).await;
                    }
                    Control::StartAsGenerator => self.promote(&shutdown).await,
                    Control::Fault { detail, at } => {
                        if at < settled_at {
                            debug!(%detail, "broker fault predates last restart; ignored");
                            continue;
                        }
                        error!(
                            %detail,
                            retry_in = ?self.restart_timeout,
                            "broker connection failed; restarting"
                        );
                        self.restart(&shutdown).await;
                        settled_at = Instant::now();
                    }
                },
            }
        }

        dispatch_task.abort();
        fault_task.abort();
        self.unbridge(&bridge);
        self.stop().await;
        Ok(())
    }

    /// Route role events from the bus into the control channel.
    fn bridge_bus(&self, control: &mpsc::UnboundedSender<Control>) -> Handler {
        let control = control.clone();
        let bridge = handler(move |event| {
            let command = match event {
                EventKind::StartAsGenerator => Control::StartAsGenerator,
                _ => Control::StartAsListener,
            };
            control
                .send(command)
                .map_err(|_| anyhow!("coordinator is not running"))
        });
        self.bus.subscribe(EventKind::StartAsListener, &bridge);
        self.bus.subscribe(EventKind::StartAsGenerator, &bridge);
        bridge
    }

    fn unbridge(&self, bridge: &Handler) {
        self.bus.unsubscribe(EventKind::StartAsListener, bridge);
        self.bus.unsubscribe(EventKind::StartAsGenerator, bridge);
    }

    async fn subscribe_events(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<mpsc::Receiver<String>> {
        loop {
            match self.broker.subscribe(&self.keys.events).await {
                Ok(inbound) => return Some(inbound),
                Err(e) => {
                    error!(
                        error = %e,
                        retry_in = ?self.restart_timeout,
                        "failed to subscribe to events channel"
                    );
                    if !self.pause(shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn elect(&self) -> Result<Role> {
        let lease = self
            .broker
            .get_value(&self.keys.generator)
            .await
            .context("read generator lease")?;
        let claimed = match lease {
            Some(holder) => {
                debug!(%holder, "generator lease held");
                false
            }
            None => self
                .broker
                .set_if_absent(
                    &self.keys.generator,
                    self.worker_id.as_str(),
                    self.lease_lifetime,
                )
                .await
                .context("claim generator lease")?,
        };

        if claimed {
            if self.listener.is_active() {
                self.listener.kill_yourself().await?;
            }
            self.generator.start().await?;
            Ok(Role::Generator)
        } else {
            self.listener.start().await?;
            Ok(Role::Listener)
        }
    }

    async fn elect_until_started(&self, shutdown: &CancellationToken) {
        loop {
            match self.elect().await {
                Ok(role) => {
                    self.set_role(role);
                    return;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        retry_in = ?self.restart_timeout,
                        "election failed; restarting"
                    );
                    if !self.back_off(shutdown).await {
                        return;
                    }
                }
            }
        }
    }

    async fn promote(&self, shutdown: &CancellationToken) {
        if self.current_role() == Role::Generator {
            debug!("already generator; start-as-generator ignored");
            return;
        }
        info!(worker_id = %self.worker_id, "promoted to generator");
        if let Err(e) = self.listener.kill_yourself().await {
            warn!(error = %e, "failed to leave listener set before promotion");
        }
        match self.generator.start().await {
            Ok(()) => self.set_role(Role::Generator),
            Err(e) => {
                error!(
                    error = %e,
                    retry_in = ?self.restart_timeout,
                    "failed to start as generator; restarting"
                );
                self.restart(shutdown).await;
            }
        }
    }

    async fn restart(&self, shutdown: &CancellationToken) {
        if self.back_off(shutdown).await {
            self.elect_until_started(shutdown).await;
        }
    }

    /// Drop every duty, wait out the restart delay and bring the watcher
    /// back.  Returns `false` when shutdown fired during the wait.
    async fn back_off(&self, shutdown: &CancellationToken) -> bool {
        self.generator.clear_timers();
        self.watcher.clear_timers();
        self.abdicate().await;
        self.set_role(Role::Restarting);

        let resumed = self.pause(shutdown).await;
        if resumed {
            self.watcher.watch();
        }
        resumed
    }

    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            () = shutdown.cancelled() => false,
            () = tokio::time::sleep(self.restart_timeout) => true,
        }
    }

    async fn abdicate(&self) {
        if let Err(e) = self.listener.kill_yourself().await {
            warn!(error = %e, "failed to leave listener set");
        }
    }

    async fn stop(&self) {
        self.generator.clear_timers();
        self.watcher.clear_timers();
        self.abdicate().await;
        info!(worker_id = %self.worker_id, "worker stopped");
    }

    fn set_role(&self, role: Role) {
        let previous = self.role.send_replace(role);
        if previous == role {
            return;
        }
        info!(
            worker_id = %self.worker_id,
            from = previous.as_str(),
            to = role.as_str(),
            "role transition"
        );
        if let Some(role) = role.label() {
            self.metrics
                .role_transitions
                .get_or_create(&RoleLabels { role })
                .inc();
        }
    }
}

/// Handles control messages arriving on the shared events channel.
struct InboundDispatcher {
    worker_id: WorkerId,
    listener: Arc<Listener>,
    bus: EventBus,
}

impl InboundDispatcher {
    async fn run(self, mut inbound: mpsc::Receiver<String>) {
        while let Some(raw) = inbound.recv().await {
            self.dispatch(&raw);
        }
        warn!("events subscription closed");
    }

    fn dispatch(&self, raw: &str) {
        let message = match ControlMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, %raw, "dropping malformed control message");
                return;
            }
        };
        if message.worker_id != self.worker_id.as_str() {
            return;
        }

        match message.event_type {
            ControlEventType::HealthCheck => {
                let reply_channel = message.reply_channel.unwrap_or_default();
                let listener = Arc::clone(&self.listener);
                let bus = self.bus.clone();
                tokio::spawn(async move {
                    if let Err(e) = listener.health_status_sender(&reply_channel).await {
                        error!(error = %e, "failed to answer health-check");
                        bus.emit(EventKind::StartAsListener);
                    }
                });
            }
            ControlEventType::StartAsGenerator => self.bus.emit(EventKind::StartAsGenerator),
        }
    }
}

async fn forward_faults(
    mut faults: broadcast::Receiver<BrokerFault>,
    control: mpsc::UnboundedSender<Control>,
) {
    loop {
        match faults.recv().await {
            Ok(fault) => {
                let command = Control::Fault {
                    detail: fault.detail,
                    at: Instant::now(),
                };
                if control.send(command).is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "broker fault stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
