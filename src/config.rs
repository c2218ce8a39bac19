use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default, alias = "redis")]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

// ---------------------------------------------------------------------------
// Broker (Redis)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Connection string (e.g. `redis://localhost:6379`).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Enable TLS for the broker connections.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the broker password.
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
    /// Prefix shared by every key and channel of one deployment.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Number of pooled connections used for non-blocking commands.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Number of pooled connections reserved for liveness-probe pops.
    #[serde(default = "default_probe_pool_size")]
    pub probe_pool_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            tls: false,
            auth_token_env: default_auth_token_env(),
            namespace: default_namespace(),
            pool_size: default_pool_size(),
            probe_pool_size: default_probe_pool_size(),
        }
    }
}

fn default_endpoint() -> String {
    "redis://localhost:6379".to_string()
}

fn default_auth_token_env() -> String {
    "REDIS_AUTH_TOKEN".to_string()
}

fn default_namespace() -> String {
    "worker".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_probe_pool_size() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Generator role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    /// Characters sampled when building a message.
    #[serde(default = "default_alphabet")]
    pub alphabet: String,
    /// Number of characters in every produced message.
    #[serde(default = "default_message_length")]
    pub message_length: usize,
    /// Milliseconds between two produced messages.
    #[serde(default = "default_send_message_interval", alias = "send_message_interval")]
    pub send_message_interval_ms: u64,
    /// TTL of the generator lease in milliseconds.
    #[serde(default = "default_lifetime", alias = "generator_life_time")]
    pub lifetime_ms: u64,
    /// Milliseconds between two lease renewals.
    #[serde(default = "default_re_expire", alias = "generator_re_expire_ms")]
    pub re_expire_ms: u64,
}

impl GeneratorConfig {
    pub fn send_message_interval(&self) -> Duration {
        Duration::from_millis(self.send_message_interval_ms)
    }

    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime_ms)
    }

    pub fn re_expire(&self) -> Duration {
        Duration::from_millis(self.re_expire_ms)
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            alphabet: default_alphabet(),
            message_length: default_message_length(),
            send_message_interval_ms: default_send_message_interval(),
            lifetime_ms: default_lifetime(),
            re_expire_ms: default_re_expire(),
        }
    }
}

fn default_alphabet() -> String {
    "abcdefghijklmnopqrstuvwxyz".to_string()
}

fn default_message_length() -> usize {
    20
}

fn default_send_message_interval() -> u64 {
    500
}

fn default_lifetime() -> u64 {
    10_000
}

fn default_re_expire() -> u64 {
    1_000
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Milliseconds between two generator-failover sweeps.
    #[serde(default = "default_watch_interval")]
    pub watch_interval_ms: u64,
    /// Milliseconds between two dead-listener sweeps.
    #[serde(default = "default_dead_workers_interval")]
    pub dead_workers_interval_ms: u64,
    /// How long (seconds) a single liveness probe waits for its reply.
    #[serde(
        default = "default_health_response_timeout",
        alias = "wait_for_health_response_timeout_sec"
    )]
    pub health_response_timeout_secs: u64,
    /// Delay (milliseconds) before a crashed-generator dedup entry is removed.
    #[serde(default = "default_clean_crashed_generator_timeout")]
    pub clean_crashed_generator_timeout_ms: u64,
}

impl WatcherConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn dead_workers_interval(&self) -> Duration {
        Duration::from_millis(self.dead_workers_interval_ms)
    }

    pub fn health_response_timeout(&self) -> Duration {
        Duration::from_secs(self.health_response_timeout_secs)
    }

    pub fn clean_crashed_generator_timeout(&self) -> Duration {
        Duration::from_millis(self.clean_crashed_generator_timeout_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            watch_interval_ms: default_watch_interval(),
            dead_workers_interval_ms: default_dead_workers_interval(),
            health_response_timeout_secs: default_health_response_timeout(),
            clean_crashed_generator_timeout_ms: default_clean_crashed_generator_timeout(),
        }
    }
}

fn default_watch_interval() -> u64 {
    5_000
}

fn default_dead_workers_interval() -> u64 {
    30_000
}

fn default_health_response_timeout() -> u64 {
    1
}

fn default_clean_crashed_generator_timeout() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// Worker process
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Delay (milliseconds) before the role cycle restarts after a fatal
    /// broker error.
    #[serde(default = "default_restart_timeout", alias = "worker_restart_timeout")]
    pub restart_timeout_ms: u64,
}

impl WorkerConfig {
    pub fn restart_timeout(&self) -> Duration {
        Duration::from_millis(self.restart_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            restart_timeout_ms: default_restart_timeout(),
        }
    }
}

fn default_restart_timeout() -> u64 {
    10_000
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Socket address for `/healthz` and `/metrics` (e.g. `0.0.0.0:9090`).
    /// The HTTP server is not started when unset.
    #[serde(default)]
    pub http_listen: Option<String>,
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

/// Settings supplied through the environment (or matching CLI flags).  Each
/// one that is set wins over the value from the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub redis_host: Option<String>,
    pub redis_port: Option<u16>,
    pub send_message_interval_ms: Option<u64>,
}

impl Config {
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if overrides.redis_host.is_some() || overrides.redis_port.is_some() {
            self.broker.endpoint = with_host_port(
                &self.broker.endpoint,
                overrides.redis_host.as_deref(),
                overrides.redis_port,
            );
        }
        if let Some(interval) = overrides.send_message_interval_ms {
            self.generator.send_message_interval_ms = interval;
        }
    }
}

/// Rewrite the host and/or port of `endpoint`, keeping its scheme and any
/// trailing database index.
fn with_host_port(endpoint: &str, host: Option<&str>, port: Option<u16>) -> String {
    let (scheme, rest) = endpoint.split_once("://").unwrap_or(("redis", endpoint));
    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, Some(path)),
        None => (rest, None),
    };
    let (current_host, current_port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    };

    let mut rewritten = format!("{scheme}://{}", host.unwrap_or(current_host));
    match (port, current_port) {
        (Some(port), _) => rewritten.push_str(&format!(":{port}")),
        (None, Some(port)) => rewritten.push_str(&format!(":{port}")),
        (None, None) => {}
    }
    if let Some(path) = path {
        rewritten.push('/');
        rewritten.push_str(path);
    }
    rewritten
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    let generator = &config.generator;
    anyhow::ensure!(!generator.alphabet.is_empty(), "alphabet must not be empty");
    anyhow::ensure!(generator.message_length > 0, "message_length must be positive");
    anyhow::ensure!(
        generator.send_message_interval_ms > 0,
        "send_message_interval_ms must be positive"
    );
    anyhow::ensure!(generator.re_expire_ms > 0, "re_expire_ms must be positive");
    anyhow::ensure!(
        generator.re_expire_ms < generator.lifetime_ms,
        "re_expire_ms must be shorter than lifetime_ms"
    );

    let watcher = &config.watcher;
    anyhow::ensure!(watcher.watch_interval_ms > 0, "watch_interval_ms must be positive");
    anyhow::ensure!(
        watcher.dead_workers_interval_ms > 0,
        "dead_workers_interval_ms must be positive"
    );
    anyhow::ensure!(
        watcher.health_response_timeout_secs > 0,
        "health_response_timeout_secs must be positive"
    );

    anyhow::ensure!(
        !config.broker.namespace.is_empty(),
        "broker namespace must not be empty"
    );
    anyhow::ensure!(
        config.broker.pool_size > 0 && config.broker.probe_pool_size > 0,
        "broker pool sizes must be positive"
    );
    Ok(())
}
