//! Watcher: runs on every worker regardless of role.
//!
//! Two periodic duties:
//!
//! 1. **Dead-listener sweep** (`dead_workers_interval_ms`): probe every
//!    member of the listener set concurrently and remove the ones that do
//!    not answer within the probe timeout.
//! 2. **Generator failover** (`watch_interval_ms`): when the lease key is
//!    missing, claim the crash in the shared dedup set so only one watcher
//!    cluster-wide handles it, then pop random listeners until one answers a
//!    probe and tell it to become the generator.  With no promotable
//!    listener left, this worker re-enters the election itself.
//!
//! Neither duty lets an error escape; failures are logged and the next tick
//! tries again.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::probe;
use super::timers::Timers;
use crate::broker::{Broker, Keys};
use crate::config::WatcherConfig;
use crate::events::{EventBus, EventKind};
use crate::metrics::{FailoverLabels, FailoverResult, Metrics, ProbeLabels, ProbeResult};
use crate::protocol::ControlMessage;

/// Result of one dead-listener sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub removed: Vec<String>,
}

/// Result of one failover tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// The lease is held; nothing to do.
    GeneratorAlive,
    /// Another watcher already handles this crash.
    AlreadyClaimed,
    /// `start-as-generator` was published to this listener.
    Promoted(String),
    /// Every candidate was unresponsive; this worker re-runs the election.
    NoCandidate,
    /// A broker call failed mid-way; the next tick retries.
    Failed,
}

enum Probed {
    Alive,
    Removed,
    Unresponsive,
    Failed,
}

pub struct Watcher {
    broker: Arc<dyn Broker>,
    bus: EventBus,
    keys: Keys,
    config: WatcherConfig,
    metrics: Arc<Metrics>,
    timers: Timers,
    /// Holder of the lease the last time it was seen; `""` until then.
    last_known_generator: Mutex<String>,
}

impl Watcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        bus: EventBus,
        keys: Keys,
        config: WatcherConfig,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            bus,
            keys,
            config,
            metrics,
            timers: Timers::new(),
            last_known_generator: Mutex::new(String::new()),
        })
    }

    fn last_known(&self) -> MutexGuard<'_, String> {
        self.last_known_generator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn last_known_generator(&self) -> String {
        self.last_known().clone()
    }

    /// Start both periodic duties, replacing any already running.
    pub fn watch(self: &Arc<Self>) {
        self.timers.clear();
        info!(
            watch_interval = ?self.config.watch_interval(),
            dead_workers_interval = ?self.config.dead_workers_interval(),
            "watcher started"
        );

        let this = Arc::downgrade(self);
        self.timers.every(self.config.watch_interval(), move || {
            let this = Weak::clone(&this);
            async move {
                if let Some(watcher) = this.upgrade() {
                    watcher.manage_generator().await;
                }
            }
        });

        let this = Arc::downgrade(self);
        self.timers.every(self.config.dead_workers_interval(), move || {
            let this = Weak::clone(&this);
            async move {
                if let Some(watcher) = this.upgrade() {
                    if let Err(e) = watcher.remove_dead_listeners().await {
                        error!(error = %e, "dead-listener sweep failed");
                    }
                }
            }
        });
    }

    pub fn clear_timers(&self) {
        self.timers.clear();
    }

    #[cfg(test)]
    pub fn is_watching(&self) -> bool {
        self.timers.active() > 0
    }

    /// Probe every registered listener concurrently and drop the silent
    /// ones.  Each probe is independent; one failing does not affect the
    /// others.
    pub async fn remove_dead_listeners(&self) -> Result<SweepReport> {
        let members = self
            .broker
            .set_members(&self.keys.listeners)
            .await
            .context("read listener set")?;

        let mut report = SweepReport {
            probed: members.len(),
            removed: Vec::new(),
        };
        let mut probes = JoinSet::new();
        for member in members {
            let broker = Arc::clone(&self.broker);
            let keys = self.keys.clone();
            let timeout = self.config.health_response_timeout();
            probes.spawn(async move {
                let outcome = probe_listener(broker.as_ref(), &keys, &member, timeout).await;
                (member, outcome)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let (member, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "probe task panicked");
                    continue;
                }
            };
            let result = match outcome {
                Probed::Alive => ProbeResult::Alive,
                Probed::Removed => {
                    self.metrics.listeners_pruned.inc();
                    report.removed.push(member);
                    ProbeResult::Unresponsive
                }
                Probed::Unresponsive => ProbeResult::Unresponsive,
                Probed::Failed => ProbeResult::Error,
            };
            self.metrics.probes.get_or_create(&ProbeLabels { result }).inc();
        }

        if !report.removed.is_empty() {
            info!(probed = report.probed, removed = ?report.removed, "dead listeners removed");
        }
        Ok(report)
    }

    /// One failover tick.
    pub async fn manage_generator(&self) -> FailoverOutcome {
        let outcome = self.try_failover().await;
        let result = match &outcome {
            FailoverOutcome::GeneratorAlive => return outcome,
            FailoverOutcome::AlreadyClaimed => FailoverResult::AlreadyClaimed,
            FailoverOutcome::Promoted(_) => FailoverResult::Promoted,
            FailoverOutcome::NoCandidate => FailoverResult::NoCandidate,
            FailoverOutcome::Failed => FailoverResult::Failed,
        };
        self.metrics.failovers.get_or_create(&FailoverLabels { result }).inc();
        outcome
    }

    async fn try_failover(&self) -> FailoverOutcome {
        let lease = match self.broker.get_value(&self.keys.generator).await {
            Ok(lease) => lease,
            Err(e) => {
                error!(error = %e, "failed to read generator lease");
                return FailoverOutcome::Failed;
            }
        };
        if let Some(holder) = lease {
            *self.last_known() = holder;
            return FailoverOutcome::GeneratorAlive;
        }

        let crashed = self.last_known_generator();
        let claimed = match self
            .broker
            .set_add(&self.keys.crashed_generators, &crashed)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(
                    error = %e,
                    crashed_generator = %crashed,
                    "failed to claim crashed generator"
                );
                self.schedule_dedup_cleanup(crashed);
                return FailoverOutcome::Failed;
            }
        };
        if !claimed {
            debug!(crashed_generator = %crashed, "failover already handled elsewhere");
            return FailoverOutcome::AlreadyClaimed;
        }

        warn!(crashed_generator = %crashed, "generator lease missing; looking for a replacement");
        let outcome = match self.promote_candidate().await {
            Ok(Some(candidate)) => {
                info!(%candidate, crashed_generator = %crashed, "promoted listener to generator");
                FailoverOutcome::Promoted(candidate)
            }
            Ok(None) => {
                error!(
                    crashed_generator = %crashed,
                    "no responsive listener; re-entering election"
                );
                self.bus.emit(EventKind::StartAsListener);
                FailoverOutcome::NoCandidate
            }
            Err(e) => {
                error!(error = %e, crashed_generator = %crashed, "failover aborted");
                FailoverOutcome::Failed
            }
        };
        self.schedule_dedup_cleanup(crashed);
        outcome
    }

    /// Pop listeners at random, at most the set's size at the start, until
    /// one answers a probe.
    async fn promote_candidate(&self) -> Result<Option<String>> {
        let count = self
            .broker
            .set_cardinality(&self.keys.listeners)
            .await
            .context("count listeners")?;

        for _ in 0..count {
            let Some(candidate) = self
                .broker
                .set_pop_random(&self.keys.listeners)
                .await
                .context("pop candidate listener")?
            else {
                break;
            };

            match probe::check_health(
                self.broker.as_ref(),
                &self.keys,
                &candidate,
                self.config.health_response_timeout(),
            )
            .await
            {
                Ok(true) => {
                    let command = ControlMessage::start_as_generator(&candidate).encode()?;
                    self.broker
                        .publish(&self.keys.events, &command)
                        .await
                        .context("publish start-as-generator")?;
                    return Ok(Some(candidate));
                }
                Ok(false) => debug!(%candidate, "candidate unresponsive; discarded"),
                Err(e) => warn!(%candidate, error = %e, "candidate probe failed; discarded"),
            }
        }
        Ok(None)
    }

    /// Release the dedup claim after `clean_crashed_generator_timeout_ms`
    /// so a later crash of the same holder can be handled again.
    fn schedule_dedup_cleanup(&self, crashed: String) {
        let broker = Arc::clone(&self.broker);
        let set = self.keys.crashed_generators.clone();
        let delay = self.config.clean_crashed_generator_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = broker.set_remove(&set, &crashed).await {
                warn!(error = %e, crashed_generator = %crashed, "failed to release failover claim");
            }
        });
    }
}

async fn probe_listener(
    broker: &dyn Broker,
    keys: &Keys,
    member: &str,
    timeout: std::time::Duration,
) -> Probed {
    match probe::check_health(broker, keys, member, timeout).await {
        Ok(true) => Probed::Alive,
        Ok(false) => match broker.set_remove(&keys.listeners, member).await {
            Ok(_) => {
                debug!(%member, "removed unresponsive listener");
                Probed::Removed
            }
            Err(e) => {
                warn!(%member, error = %e, "failed to remove unresponsive listener");
                Probed::Unresponsive
            }
        },
        Err(e) => {
            warn!(%member, error = %e, "listener probe failed; keeping member");
            Probed::Failed
        }
    }
}
