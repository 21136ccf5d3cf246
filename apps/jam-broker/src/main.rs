use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use jam_broker::config::{BrokerConfig, Cli, Commands};
use jam_broker::handshake::HandshakeListener;
use jam_broker::lifecycle::SessionBroker;
use jam_broker::orchestrator::{ContainerOrchestrator, ExecutionMode, TokioProcessRunner};
use jam_broker::router::LoggingResponseHandler;
use jam_broker::store;
use jam_broker::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BrokerConfig::try_from(cli)?;
    let _telemetry = Telemetry::init(config.log_filter.as_deref(), config.metrics_addr)?;

    info!(
        handshake_addr = %config.handshake_addr,
        control_port = config.orchestrator.control_port,
        local_mode = config.orchestrator.mode == ExecutionMode::Local,
        durable_store = if config.redis_url.is_some() { "redis" } else { "memory" },
        "starting jam-broker"
    );

    let broker = build_broker(&config).await?;
    match config.command {
        Commands::Serve => serve(config, broker).await,
        Commands::Purge => purge(broker).await,
    }
}

async fn build_broker(config: &BrokerConfig) -> Result<SessionBroker> {
    let store = store::connect(config.redis_url.as_deref())
        .await
        .context("failed to connect to record store")?;
    let orchestrator = ContainerOrchestrator::new(
        config.orchestrator.clone(),
        Arc::new(TokioProcessRunner),
    );
    Ok(
        SessionBroker::new(orchestrator, store, Arc::new(LoggingResponseHandler))
            .with_outbound_buffer(config.outbound_buffer),
    )
}

async fn serve(config: BrokerConfig, broker: SessionBroker) -> Result<()> {
    let listener = HandshakeListener::bind(
        config.handshake_addr,
        broker.handshake_service(config.handshake.clone()),
    )
    .await
    .with_context(|| format!("failed to bind handshake listener on {}", config.handshake_addr))?;
    let listener_handle = listener.spawn();

    let sweeper_handle = match (config.pending_ttl, config.sweep_interval()) {
        (Some(ttl), Some(interval)) => Some(broker.pending().spawn_sweeper(ttl, interval)),
        _ => None,
    };

    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");

    listener_handle.abort();
    if let Some(handle) = sweeper_handle {
        handle.abort();
    }
    let closed = broker.registry().clear();
    info!(closed, "jam-broker stopped");
    Ok(())
}

async fn purge(broker: SessionBroker) -> Result<()> {
    let report = broker
        .purge_sessions()
        .await
        .context("failed to purge sessions")?;
    info!(
        containers_removed = report.containers_removed,
        records_dropped = report.records_dropped,
        "purge complete"
    );
    Ok(())
}
