//! Mole CLI - reverse tunnel broker and agent
//!
//! Run `mole broker` on a reachable host and `mole agent` behind NAT. The
//! broker can then open connections to any joined agent on demand.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mole_agent::{run_with_reconnect, AgentConfig, Backoff, TcpForwarder, TunnelClient};
use mole_control::{AgentHttpClient, Broker, BrokerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Mole - reach hosts behind NAT through agent-initiated connections
#[derive(Parser, Debug)]
#[command(name = "mole")]
#[command(about = "Mole - reach hosts behind NAT through agent-initiated connections")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agents and broker connections to them
    #[command(long_about = r#"
Listen for agent control connections and worker connections on a single
address. Joined agents can be probed over HTTP through worker connections.

EXAMPLES:
  # Listen on the default address
  mole broker --listen 0.0.0.0:7070

  # Probe every joined agent's /health endpoint every 30 seconds
  mole broker --probe-interval 30 --probe-path /health

ENVIRONMENT VARIABLES:
  MOLE_LISTEN         Listen address
  MOLE_DIAL_TIMEOUT   Seconds to wait for a worker connection
  MOLE_IDLE_TIMEOUT   Seconds before a silent agent is evicted (0 = never)
    "#)]
    Broker {
        /// Address accepting control and worker connections
        #[arg(long, env = "MOLE_LISTEN", default_value = "0.0.0.0:7070")]
        listen: SocketAddr,

        /// Seconds to wait for an agent to open a requested worker connection
        #[arg(long, env = "MOLE_DIAL_TIMEOUT", default_value = "10")]
        dial_timeout: u64,

        /// Seconds without a heartbeat before an agent is evicted (0 = never)
        #[arg(long, env = "MOLE_IDLE_TIMEOUT", default_value = "90")]
        idle_timeout: u64,

        /// Probe joined agents over HTTP every N seconds
        #[arg(long)]
        probe_interval: Option<u64>,

        /// Path requested by the HTTP probe
        #[arg(long, default_value = "/")]
        probe_path: String,
    },

    /// Join a broker and forward worker connections to a local service
    #[command(long_about = r#"
Keep a control connection to the broker and forward every worker connection
it requests to a local target address. Rejoins automatically with
exponential backoff if the connection drops.

EXAMPLES:
  # Expose a local web server
  mole agent --broker broker.example.com:7070 \
    --agent-id "office-printer" \
    --target 127.0.0.1:80

ENVIRONMENT VARIABLES:
  MOLE_BROKER               Broker address
  MOLE_AGENT_ID             Agent identifier
  MOLE_TARGET               Local address to forward to
  MOLE_HEARTBEAT            Heartbeat interval in seconds (0 = off)
  MOLE_RECONNECT_DELAY      Initial rejoin delay in seconds
  MOLE_MAX_RECONNECT_DELAY  Maximum rejoin delay in seconds
    "#)]
    Agent {
        /// Broker address (e.g., broker.example.com:7070)
        #[arg(long, env = "MOLE_BROKER")]
        broker: String,

        /// Agent ID (auto-generated if not specified)
        #[arg(long, env = "MOLE_AGENT_ID")]
        agent_id: Option<String>,

        /// Local address worker connections are forwarded to
        #[arg(long, env = "MOLE_TARGET")]
        target: String,

        /// Heartbeat interval in seconds (0 = off)
        #[arg(long, env = "MOLE_HEARTBEAT", default_value = "30")]
        heartbeat: u64,

        /// Maximum consecutive rejoin attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Initial rejoin delay in seconds
        #[arg(long, env = "MOLE_RECONNECT_DELAY", default_value = "1")]
        reconnect_delay: u64,

        /// Maximum rejoin delay in seconds
        #[arg(long, env = "MOLE_MAX_RECONNECT_DELAY", default_value = "60")]
        max_reconnect_delay: u64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

async fn run_broker(config: BrokerConfig, probe: Option<(Duration, String)>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    let broker = Broker::new(config);

    if let Some((interval, path)) = probe {
        tokio::spawn(probe_agents(broker.clone(), interval, path));
    }

    tokio::select! {
        result = broker.serve(listener) => {
            result.context("Broker stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!(agents = broker.registry().count(), "Shutting down broker");
        }
    }

    Ok(())
}

/// Periodically GET `path` on every joined agent and log the outcome
async fn probe_agents(broker: Broker, interval: Duration, path: String) {
    let client = AgentHttpClient::new(broker.clone());
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;
        for agent in broker.list_agents() {
            match client.get(&agent.agent_id, &path).await {
                Ok(response) => info!(
                    agent_id = %agent.agent_id,
                    status = %response.status(),
                    bytes = response.body().len(),
                    "Probe succeeded"
                ),
                Err(e) => warn!(agent_id = %agent.agent_id, error = %e, "Probe failed"),
            }
        }
    }
}

async fn run_agent(
    config: AgentConfig,
    target: String,
    backoff: Backoff,
    max_attempts: Option<usize>,
) -> Result<()> {
    info!(
        agent_id = %config.agent_id,
        broker = %config.broker_addr,
        target = %target,
        "Starting agent"
    );

    let mut client = TunnelClient::new(config, Arc::new(TcpForwarder::new(target)));

    let shutdown = client.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Shutting down agent");
        shutdown.cancel();
    });

    run_with_reconnect(&mut client, backoff, max_attempts)
        .await
        .context("Agent stopped")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("MOLE_GIT_HASH"),
        built = env!("MOLE_BUILD_TIME"),
        "mole starting"
    );

    match cli.command {
        Commands::Broker {
            listen,
            dial_timeout,
            idle_timeout,
            probe_interval,
            probe_path,
        } => {
            let config = BrokerConfig {
                listen_addr: listen,
                dial_timeout: Duration::from_secs(dial_timeout),
                idle_timeout: non_zero_secs(idle_timeout),
                ..Default::default()
            };
            let probe = probe_interval
                .and_then(non_zero_secs)
                .map(|interval| (interval, probe_path));
            run_broker(config, probe).await
        }
        Commands::Agent {
            broker,
            agent_id,
            target,
            heartbeat,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            let mut config = AgentConfig {
                broker_addr: broker,
                heartbeat_interval: non_zero_secs(heartbeat),
                ..Default::default()
            };
            if let Some(agent_id) = agent_id {
                config.agent_id = agent_id;
            }

            let backoff = Backoff::new(
                Duration::from_secs(reconnect_delay),
                Duration::from_secs(max_reconnect_delay),
            );
            let max_attempts = (max_reconnect_attempts > 0).then_some(max_reconnect_attempts);

            run_agent(config, target, backoff, max_attempts).await
        }
    }
}
