//! In-process [`Broker`] used by the unit tests.
//!
//! Every operation is atomic under a single mutex, which is enough to model
//! the single-command atomicity of Redis.  Time-to-live uses
//! `tokio::time::Instant` so tests running on a paused clock observe
//! expiry deterministically.  All calls are recorded for assertions, and any
//! operation can be made to fail.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;

use super::{Broker, BrokerFault};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub key: String,
    pub value: Option<String>,
}

#[derive(Default)]
struct State {
    values: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
    calls: Vec<Call>,
    failing: HashSet<&'static str>,
}

impl State {
    fn live_value(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(
            self.values.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.values.remove(key);
        }
        self.values.get(key).map(|(value, _)| value)
    }
}

pub struct MemoryBroker {
    state: Mutex<State>,
    pushed: Notify,
    faults: broadcast::Sender<BrokerFault>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (faults, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(State::default()),
            pushed: Notify::new(),
            faults,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and fail it when `op` was marked failing.
    fn record(
        &self,
        op: &'static str,
        key: &str,
        value: Option<&str>,
    ) -> Result<MutexGuard<'_, State>> {
        let mut state = self.state();
        state.calls.push(Call {
            op,
            key: key.to_string(),
            value: value.map(str::to_string),
        });
        if state.failing.contains(op) {
            bail!("injected {op} failure");
        }
        Ok(state)
    }

    // -- test controls --

    pub fn fail(&self, op: &'static str) {
        self.state().failing.insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        self.state().failing.remove(op);
    }

    pub fn inject_fault(&self, detail: &str) {
        let _ = self.faults.send(BrokerFault {
            detail: detail.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn count_on(&self, op: &str, key: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == op && c.key == key)
            .count()
    }

    pub fn list(&self, list: &str) -> Vec<String> {
        self.state()
            .lists
            .get(list)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn members(&self, set: &str) -> Vec<String> {
        self.state()
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.state().live_value(key).cloned()
    }

    pub fn seed_list(&self, list: &str, values: &[&str]) {
        let mut state = self.state();
        let items = state.lists.entry(list.to_string()).or_default();
        items.extend(values.iter().map(|v| v.to_string()));
        drop(state);
        self.pushed.notify_waiters();
    }

    pub fn seed_set(&self, set: &str, members: &[&str]) {
        let mut state = self.state();
        let entry = state.sets.entry(set.to_string()).or_default();
        entry.extend(members.iter().map(|m| m.to_string()));
    }

    pub fn seed_value(&self, key: &str, value: &str) {
        self.state()
            .values
            .insert(key.to_string(), (value.to_string(), None));
    }

    fn try_pop(&self, list: &str) -> Option<String> {
        self.state()
            .lists
            .get_mut(list)
            .and_then(|items| items.pop_front())
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.record("get_value", key, None)?;
        Ok(state.live_value(key).cloned())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.record("set_if_absent", key, Some(value))?;
        if state.live_value(key).is_some() {
            return Ok(false);
        }
        state
            .values
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(true)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut state = self.record("set_with_expiry", key, Some(value))?;
        state
            .values
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn refresh_expiry(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.record("refresh_expiry", key, None)?;
        if state.live_value(key).is_none() {
            return Ok(false);
        }
        if let Some(entry) = state.values.get_mut(key) {
            entry.1 = Some(Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn push_tail(&self, list: &str, value: &str) -> Result<()> {
        let mut state = self.record("push_tail", list, Some(value))?;
        state
            .lists
            .entry(list.to_string())
            .or_default()
            .push_back(value.to_string());
        drop(state);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop_head(&self, list: &str) -> Result<Option<String>> {
        drop(self.record("pop_head", list, None)?);
        Ok(self.try_pop(list))
    }

    async fn blocking_pop_head(
        &self,
        list: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<String>> {
        drop(self.record("blocking_pop_head", list, None)?);
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(list) {
                return Ok(Some(value));
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn length(&self, list: &str) -> Result<u64> {
        let state = self.record("length", list, None)?;
        Ok(state.lists.get(list).map_or(0, |items| items.len() as u64))
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<bool> {
        let mut state = self.record("set_add", set, Some(member))?;
        Ok(state
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool> {
        let mut state = self.record("set_remove", set, Some(member))?;
        Ok(state
            .sets
            .get_mut(set)
            .is_some_and(|members| members.remove(member)))
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>> {
        let state = self.record("set_members", set, None)?;
        Ok(state
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_cardinality(&self, set: &str) -> Result<u64> {
        let state = self.record("set_cardinality", set, None)?;
        Ok(state.sets.get(set).map_or(0, |members| members.len() as u64))
    }

    /// Pops the smallest member so tests stay deterministic.
    async fn set_pop_random(&self, set: &str) -> Result<Option<String>> {
        let mut state = self.record("set_pop_random", set, None)?;
        Ok(state.sets.get_mut(set).and_then(|members| members.pop_first()))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let subscribers = {
            let state = self.record("publish", channel, Some(payload))?;
            state.subscribers.get(channel).cloned().unwrap_or_default()
        };
        for subscriber in subscribers {
            let _ = subscriber.send(payload.to_string()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut state = self.record("subscribe", channel, None)?;
        let (tx, rx) = mpsc::channel(64);
        state
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        drop(self.record("ping", "", None)?);
        Ok(())
    }

    fn faults(&self) -> broadcast::Receiver<BrokerFault> {
        self.faults.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_claims_have_exactly_one_winner() {
        let broker = Arc::new(MemoryBroker::new());
        let mut claims = tokio::task::JoinSet::new();
        for i in 0..16 {
            let broker = Arc::clone(&broker);
            claims.spawn(async move {
                broker
                    .set_if_absent("worker:generator", &format!("w{i}"), Duration::from_secs(10))
                    .await
                    .unwrap()
            });
        }

        let mut winners = 0;
        while let Some(won) = claims.join_next().await {
            if won.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(broker.count("set_if_absent"), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_values_disappear() {
        let broker = MemoryBroker::new();
        broker
            .set_with_expiry("lease", "a", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(broker.get_value("lease").await.unwrap().as_deref(), Some("a"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(broker.get_value("lease").await.unwrap(), None);
        assert!(!broker.refresh_expiry("lease", Duration::from_secs(1)).await.unwrap());
        assert!(broker
            .set_if_absent("lease", "b", Duration::from_millis(100))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn claims_expire_when_never_renewed() {
        let broker = MemoryBroker::new();
        let ttl = Duration::from_millis(100);
        assert!(broker.set_if_absent("lease", "a", ttl).await.unwrap());
        assert!(!broker.set_if_absent("lease", "b", ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(broker.get_value("lease").await.unwrap(), None);
        assert!(broker.set_if_absent("lease", "b", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_pop_waits_for_push_or_times_out() {
        let broker = Arc::new(MemoryBroker::new());
        let timed_out = broker
            .blocking_pop_head("reply", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(timed_out, None);

        let popper = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.blocking_pop_head("queue", None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.push_tail("queue", "x").await.unwrap();
        assert_eq!(popper.await.unwrap().unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn injected_failures_are_recorded_and_returned() {
        let broker = MemoryBroker::new();
        broker.fail("push_tail");
        assert!(broker.push_tail("queue", "x").await.is_err());
        assert_eq!(broker.count("push_tail"), 1);
        broker.heal("push_tail");
        broker.push_tail("queue", "x").await.unwrap();
        assert_eq!(broker.list("queue"), vec!["x".to_string()]);
    }
}
