//! Redis implementation of [`Broker`].
//!
//! Builds its connections from [`crate::config::BrokerConfig`], optionally
//! enabling TLS via `rustls` and reading the password from an environment
//! variable.  Four kinds of connections are kept apart so that blocking
//! commands never stall the lease traffic:
//!
//! - `commands`: pool for every non-blocking command (lease, sets, pushes).
//! - `queue`: dedicated client for the indefinitely blocking message pop.
//! - `probes`: pool for the bounded liveness-probe pops.
//! - `subscriber`: pub/sub client with managed resubscription.

use std::time::Duration;

use anyhow::{Context, Result};
use fred::clients::{Client, Pool, SubscriberClient};
use fred::interfaces::{
    ClientLike, EventInterface, KeysInterface, ListInterface, PubsubInterface, SetsInterface,
};
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, Expiration, SetOptions};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::{Broker, BrokerFault};
use crate::config::BrokerConfig;

pub struct RedisBroker {
    commands: Pool,
    queue: Client,
    probes: Pool,
    subscriber: SubscriberClient,
    faults: broadcast::Sender<BrokerFault>,
}

impl RedisBroker {
    /// Connect every client and verify connectivity with a PING.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let builder = builder_from_config(config)?;

        let commands = builder
            .build_pool(config.pool_size)
            .context("failed to build command pool")?;
        let queue = builder.build().context("failed to build queue client")?;
        let probes = builder
            .build_pool(config.probe_pool_size)
            .context("failed to build probe pool")?;
        let subscriber = builder
            .build_subscriber_client()
            .context("failed to build subscriber client")?;

        commands.init().await.context("failed to connect command pool")?;
        queue.init().await.context("failed to connect queue client")?;
        probes.init().await.context("failed to connect probe pool")?;
        subscriber
            .init()
            .await
            .context("failed to connect subscriber client")?;
        // Re-issue SUBSCRIBE for every tracked channel after a reconnect.
        let _resubscribe = subscriber.manage_subscriptions();

        let _: String = commands
            .ping(None)
            .await
            .context("broker PING failed after connect")?;

        let (faults, _) = broadcast::channel(16);
        let broker = Self {
            commands,
            queue,
            probes,
            subscriber,
            faults,
        };
        broker.forward_faults();

        info!(
            endpoint = %config.endpoint,
            tls = config.tls,
            pool_size = config.pool_size,
            probe_pool_size = config.probe_pool_size,
            "broker connections created and verified"
        );
        Ok(broker)
    }

    /// Forward connection errors of the authoritative clients onto the fault
    /// channel.
    fn forward_faults(&self) {
        let clients = self
            .commands
            .clients()
            .iter()
            .cloned()
            .chain(std::iter::once(self.queue.clone()));
        for client in clients {
            let mut errors = client.error_rx();
            let faults = self.faults.clone();
            tokio::spawn(async move {
                loop {
                    match errors.recv().await {
                        Ok(event) => {
                            let detail = format!("{event:?}");
                            error!(%detail, "broker connection error");
                            let _ = faults.send(BrokerFault { detail });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "broker error stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
    }
}

fn builder_from_config(config: &BrokerConfig) -> Result<Builder> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    // The endpoint may optionally include a `rediss://` or `redis://` scheme
    // prefix which we strip.
    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = FredConfig {
        server: ServerConfig::new_centralized(host, port),
        ..FredConfig::default()
    };

    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    if let Some(ref token) = auth_token {
        fred_config.password = Some(token.clone());
    }

    let mut builder = Builder::from_config(fred_config);
    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));
    Ok(builder)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    // Strip any trailing path segments (e.g. a database index).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

fn millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait::async_trait]
impl Broker for RedisBroker {
    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.commands.get(key).await.context("GET")?;
        Ok(value)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let result: Option<String> = self
            .commands
            .set(
                key,
                value,
                Some(Expiration::PX(millis(ttl))),
                Some(SetOptions::NX),
                false,
            )
            .await
            .context("SET NX PX")?;
        // SET … NX returns "OK" when the key was set, nil otherwise.
        let created = result.is_some();
        debug!(%key, created, "set_if_absent");
        Ok(created)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let _: () = self
            .commands
            .set(key, value, Some(Expiration::PX(millis(ttl))), None, false)
            .await
            .context("SET PX")?;
        Ok(())
    }

    async fn refresh_expiry(&self, key: &str, ttl: Duration) -> Result<bool> {
        let refreshed: bool = self
            .commands
            .pexpire(key, millis(ttl), None)
            .await
            .context("PEXPIRE")?;
        Ok(refreshed)
    }

    async fn push_tail(&self, list: &str, value: &str) -> Result<()> {
        let _: i64 = self.commands.rpush(list, value).await.context("RPUSH")?;
        Ok(())
    }

    async fn pop_head(&self, list: &str) -> Result<Option<String>> {
        let value: Option<String> = self.commands.lpop(list, None).await.context("LPOP")?;
        Ok(value)
    }

    async fn blocking_pop_head(
        &self,
        list: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<String>> {
        // BLPOP replies with [list, value] or nil on timeout.
        let reply: Option<Vec<String>> = match timeout {
            None => self.queue.blpop(list, 0.0).await.context("BLPOP")?,
            Some(timeout) => self
                .probes
                .next()
                .blpop(list, timeout.as_secs_f64())
                .await
                .context("BLPOP with timeout")?,
        };
        Ok(reply.and_then(|mut pair| pair.pop()))
    }

    async fn length(&self, list: &str) -> Result<u64> {
        let len: u64 = self.commands.llen(list).await.context("LLEN")?;
        Ok(len)
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<bool> {
        let added: i64 = self.commands.sadd(set, member).await.context("SADD")?;
        Ok(added > 0)
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool> {
        let removed: i64 = self.commands.srem(set, member).await.context("SREM")?;
        Ok(removed > 0)
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>> {
        let members: Vec<String> = self.commands.smembers(set).await.context("SMEMBERS")?;
        Ok(members)
    }

    async fn set_cardinality(&self, set: &str) -> Result<u64> {
        let count: u64 = self.commands.scard(set).await.context("SCARD")?;
        Ok(count)
    }

    async fn set_pop_random(&self, set: &str) -> Result<Option<String>> {
        let member: Option<String> = self.commands.spop(set, None).await.context("SPOP")?;
        Ok(member)
    }

    /// Uses `commands.next()` to get a `Client` since `Pool` does not
    /// implement `PubsubInterface` in fred v10.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let _: i64 = self
            .commands
            .next()
            .publish(channel, payload)
            .await
            .context("PUBLISH")?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        // Take the receiver before subscribing so no message is missed.
        let mut message_stream = self.subscriber.message_rx();
        self.subscriber
            .subscribe(channel)
            .await
            .with_context(|| format!("SUBSCRIBE {channel}"))?;

        let (tx, rx) = mpsc::channel::<String>(64);
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                match message_stream.recv().await {
                    Ok(msg) => {
                        if *msg.channel != *channel {
                            continue;
                        }
                        let Some(payload) = msg.value.as_str() else {
                            warn!(%channel, "dropping non-string pub/sub payload");
                            continue;
                        };
                        if tx.send(payload.into_owned()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%channel, skipped, "pub/sub stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(%channel, "pub/sub forwarder stopped");
        });
        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.commands.ping(None).await.context("PING")?;
        Ok(())
    }

    fn faults(&self) -> broadcast::Receiver<BrokerFault> {
        self.faults.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_with_port() {
        let (host, port) = parse_host_port("redis.local:6380").unwrap();
        assert_eq!(host, "redis.local");
        assert_eq!(port, 6380);
    }

    #[test]
    fn parse_host_port_default() {
        let (host, port) = parse_host_port("redis.local").unwrap();
        assert_eq!(host, "redis.local");
        assert_eq!(port, 6379);
    }

    #[test]
    fn parse_host_port_strips_database_index() {
        let (host, port) = parse_host_port("redis.local:6381/2").unwrap();
        assert_eq!(host, "redis.local");
        assert_eq!(port, 6381);
    }

    #[test]
    fn parse_host_port_rejects_bad_port() {
        assert!(parse_host_port("redis.local:notaport").is_err());
    }

    #[test]
    fn ttl_conversion_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), i64::MAX);
    }
}
