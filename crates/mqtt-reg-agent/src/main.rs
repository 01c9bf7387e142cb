//! mqtt-reg agent binary.
//!
//! Serves and shadows the registers declared in the environment; see
//! [`AgentConfig::from_env`] for the variables.

use anyhow::{Context, Result};
use mqtt_reg_agent::{persistence, AgentConfig, Hooks, MqttTransport, Registry};
use mqtt_reg_proto::TopicScheme;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting mqtt-reg agent");

    // Load configuration
    let config = AgentConfig::from_env()?;
    let (server, client) = config.build_registers()?;

    tracing::info!(
        client_id = %config.broker.client_id,
        broker = %config.broker.url,
        server = server.len(),
        client = client.len(),
        "Agent initialized"
    );

    let transport = MqttTransport::new(&config.transport()).context("Invalid transport config")?;

    let hooks = Hooks::default()
        .on_online(|online| tracing::info!(online, "Online state changed"))
        .on_restart(|| {
            tracing::error!("Restarting");
            if let Err(err) = persistence::shutdown_default_store() {
                tracing::error!(error = %err, "Failed to flush register store");
            }
            std::process::exit(1);
        });

    let registry = Registry::with_topics(
        Arc::new(transport),
        TopicScheme::new(&config.topic_prefix),
        server,
        client,
        hooks,
    )?;

    // Run until the link ends or we are interrupted
    let result = tokio::select! {
        result = registry.run() => result.map_err(anyhow::Error::from),
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            signal.context("Failed to listen for shutdown signal")
        }
    };

    persistence::shutdown_default_store().context("Failed to flush register store")?;
    result
}
