use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use crate::handshake::HandshakeConfig;
use crate::orchestrator::{ExecutionMode, OrchestratorConfig, RetryPolicy};

#[derive(Debug, Parser)]
#[command(
    name = "jam-broker",
    author,
    version,
    about = "Provisions jam session containers and routes control frames to them"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address the container handshake listener binds to.
    #[arg(
        long,
        global = true,
        env = "JAM_BROKER_HANDSHAKE_ADDR",
        default_value = "0.0.0.0:25051"
    )]
    pub handshake_addr: String,

    /// Port session containers accept control connections on.
    #[arg(long, global = true, env = "JAM_BROKER_CONTROL_PORT", default_value_t = 25052)]
    pub control_port: u16,

    /// Skip the container runtime and treat a hand-started container on
    /// loopback as the only session.
    #[arg(long, global = true, env = "JAM_BROKER_NO_DOCKER", default_value_t = false)]
    pub no_docker: bool,

    #[arg(long, global = true, env = "JAM_BROKER_RUNTIME", default_value = "docker")]
    pub runtime: String,

    #[arg(long, global = true, env = "JAM_BROKER_IMAGE", default_value = "jdam/session")]
    pub image: String,

    #[arg(long, global = true, env = "JAM_BROKER_NETWORK", default_value = "jdam-net")]
    pub network: String,

    /// Address lookups before giving up on a new container.
    #[arg(long, global = true, env = "JAM_BROKER_ADDRESS_ATTEMPTS", default_value_t = 10)]
    pub address_attempts: u32,

    #[arg(
        long,
        global = true,
        env = "JAM_BROKER_ADDRESS_BACKOFF_MS",
        default_value_t = 250
    )]
    pub address_backoff_ms: u64,

    #[arg(
        long,
        global = true,
        env = "JAM_BROKER_ADDRESS_BACKOFF_MAX_MS",
        default_value_t = 2000
    )]
    pub address_backoff_max_ms: u64,

    /// Time a container has to send its session id after connecting.
    #[arg(
        long,
        global = true,
        env = "JAM_BROKER_HANDSHAKE_TIMEOUT_SECS",
        default_value_t = 5
    )]
    pub handshake_timeout_secs: u64,

    #[arg(long, global = true, env = "JAM_BROKER_DIAL_TIMEOUT_SECS", default_value_t = 5)]
    pub dial_timeout_secs: u64,

    /// Pending handshakes older than this are dropped. `0` keeps them forever.
    #[arg(long, global = true, env = "JAM_BROKER_PENDING_TTL_SECS", default_value_t = 600)]
    pub pending_ttl_secs: u64,

    /// Frames queued per control connection before writes are dropped.
    #[arg(long, global = true, env = "JAM_BROKER_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Redis URI for session records. Records are kept in memory when unset.
    #[arg(long, global = true, env = "JAM_BROKER_REDIS_URL")]
    pub redis_url: Option<String>,

    /// `tracing` filter directive; falls back to `RUST_LOG`, then `info`.
    #[arg(long, global = true, env = "JAM_BROKER_LOG")]
    pub log_filter: Option<String>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, global = true, env = "JAM_BROKER_METRICS_ADDR")]
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Run the broker until interrupted.
    Serve,
    /// Tear down every session container, reset session records and exit.
    Purge,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub command: Commands,
    pub handshake_addr: SocketAddr,
    pub orchestrator: OrchestratorConfig,
    pub handshake: HandshakeConfig,
    /// `None` disables the pending-handshake sweep.
    pub pending_ttl: Option<Duration>,
    pub outbound_buffer: usize,
    pub redis_url: Option<String>,
    pub log_filter: Option<String>,
    pub metrics_addr: Option<SocketAddr>,
}

impl BrokerConfig {
    /// How often the sweeper looks for expired pending handshakes.
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.pending_ttl
            .map(|ttl| (ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(60)))
    }
}

impl TryFrom<Cli> for BrokerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let handshake_addr: SocketAddr = cli
            .handshake_addr
            .parse()
            .with_context(|| format!("invalid handshake address: {}", cli.handshake_addr))?;
        let metrics_addr = cli
            .metrics_addr
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid metrics address: {addr}"))
            })
            .transpose()?;

        if cli.address_attempts == 0 {
            bail!("address attempts must be at least 1");
        }
        if cli.outbound_buffer == 0 {
            bail!("outbound buffer must hold at least one frame");
        }

        let mode = if cli.no_docker {
            ExecutionMode::Local
        } else {
            ExecutionMode::Container
        };
        let orchestrator = OrchestratorConfig {
            mode,
            runtime_binary: cli.runtime,
            image: cli.image,
            network: cli.network,
            control_port: cli.control_port,
            address_retry: RetryPolicy {
                max_attempts: cli.address_attempts,
                initial_delay: Duration::from_millis(cli.address_backoff_ms),
                max_delay: Duration::from_millis(
                    cli.address_backoff_max_ms.max(cli.address_backoff_ms),
                ),
            },
            ..OrchestratorConfig::default()
        };

        Ok(BrokerConfig {
            command: cli.command.unwrap_or(Commands::Serve),
            handshake_addr,
            orchestrator,
            handshake: HandshakeConfig {
                read_timeout: Duration::from_secs(cli.handshake_timeout_secs),
                dial_timeout: Duration::from_secs(cli.dial_timeout_secs),
            },
            pending_ttl: (cli.pending_ttl_secs > 0)
                .then(|| Duration::from_secs(cli.pending_ttl_secs)),
            outbound_buffer: cli.outbound_buffer,
            redis_url: cli.redis_url.filter(|url| !url.is_empty()),
            log_filter: cli.log_filter,
            metrics_addr,
        })
    }
}
