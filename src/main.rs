mod broker;
mod config;
mod coordination;
mod events;
mod health;
mod http;
mod inspect;
mod metrics;
mod protocol;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::broker::redis::RedisBroker;
use crate::broker::{Broker, Keys};
use crate::config::{Config, Overrides};
use crate::coordination::coordinator::{Coordinator, Role};
use crate::coordination::node::WorkerId;
use crate::events::EventBus;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "workerpool", about = "Redis-coordinated generator/listener worker")]
struct Cli {
    /// Path to the YAML configuration file.  Built-in defaults apply when
    /// omitted.
    #[arg(short, long, env = "WORKERPOOL_CONFIG")]
    config: Option<String>,

    /// Drain and print the error queue, then exit.
    #[arg(long, env = "GET_ERRORS")]
    get_errors: bool,

    /// Broker host, overriding the host in `broker.endpoint`.
    #[arg(long, env = "REDIS_HOST")]
    redis_host: Option<String>,

    /// Broker port, overriding the port in `broker.endpoint`.
    #[arg(long, env = "REDIS_PORT")]
    redis_port: Option<u16>,

    /// Milliseconds between two generated messages.
    #[arg(long, env = "GENERATOR_INTERVAL")]
    generator_interval: Option<u64>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            redis_host: self.redis_host.clone(),
            redis_port: self.redis_port,
            send_message_interval_ms: self.generator_interval,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared with the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn Broker>,
    pub metrics: MetricsRegistry,
    pub worker_id: WorkerId,
    pub role: watch::Receiver<Role>,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(
    state: AppState,
    listen: String,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state));

    let listen_addr: std::net::SocketAddr = listen.parse().context("invalid http_listen address")?;
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    config.apply_overrides(&cli.overrides());
    config::validate_config(&config)?;
    let config = Arc::new(config);
    tracing::info!(
        config_path = ?cli.config,
        namespace = %config.broker.namespace,
        "starting workerpool"
    );

    // ---- Broker ----
    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&config.broker).await?);

    if cli.get_errors {
        let keys = Keys::new(&config.broker.namespace);
        let drained = inspect::drain_errors(broker.as_ref(), &keys).await?;
        tracing::info!(drained, "error inspection finished");
        return Ok(());
    }

    // ---- Worker ----
    let metrics = MetricsRegistry::new();
    let worker_id = WorkerId::generate();
    tracing::info!(%worker_id, "worker identity established");

    let coordinator = Coordinator::new(
        Arc::clone(&broker),
        EventBus::new(),
        &config,
        worker_id.clone(),
        Arc::clone(&metrics.metrics),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    // ---- Spawn services ----
    let http_handle = config.server.http_listen.clone().map(|listen| {
        let state = AppState {
            broker: Arc::clone(&broker),
            metrics: metrics.clone(),
            worker_id: worker_id.clone(),
            role: coordinator.role(),
        };
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_http_server(state, listen, shutdown).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        })
    });

    // ---- Run until shutdown ----
    coordinator.run(shutdown.clone()).await?;

    if let Some(handle) = http_handle {
        let _ = handle.await;
    }

    tracing::info!(worker_id = %coordinator.worker_id(), "workerpool shut down cleanly");
    Ok(())
}
