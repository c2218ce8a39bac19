//! Cancellable periodic tasks owned by a role component.
//!
//! Cancellation is cooperative: [`Timers::clear`] stops future firings but
//! never aborts a run that is already in flight.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct Timers {
    tokens: Mutex<Vec<CancellationToken>>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    fn tokens(&self) -> MutexGuard<'_, Vec<CancellationToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `task` every `period`, first one `period` from now.  Runs of the
    /// same timer never overlap; an overrunning run delays the next tick.
    pub fn every<F, Fut>(&self, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        self.tokens().push(token.clone());

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => task().await,
                }
            }
        });
    }

    /// Number of timers started and not yet cleared.
    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.tokens().len()
    }

    /// Stop every timer.  Idempotent.
    pub fn clear(&self) {
        for token in self.tokens().drain(..) {
            token.cancel();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.clear();
    }
}
