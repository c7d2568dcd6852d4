//! Bot Broker - connects to RabbitMQ (or the in-process client when
//! `BROKER_TRANSPORT=memory`), builds the broker handles and holds them until
//! shutdown.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bot_broker::{Broker, BrokerClient, Config, MemoryClient, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("broker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        transport = ?config.transport,
        amqp_url_set = std::env::var("AMQP_URL").is_ok(),
        reply_timeout_ms = config.reply_timeout.as_millis() as u64,
        request_routing_key = %config.request_routing_key,
        "config_loaded"
    );

    match config.transport {
        Transport::Amqp => run(Broker::start(&config).await?).await,
        Transport::Memory => {
            let client = Arc::new(MemoryClient::new());
            run(Broker::with_client(client, &config).await?).await
        }
    }
}

/// Hold the broker handles until a shutdown signal arrives.
async fn run<C: BrokerClient>(broker: Broker<C>) -> Result<()> {
    info!(
        events_queue = %broker.events_queue.name,
        reply_timeout_ms = broker.async_template.receive_timeout().as_millis() as u64,
        "broker_started"
    );

    shutdown_signal().await;

    info!(
        pending_replies = broker.async_template.pending_replies(),
        "broker_stopping"
    );
    broker.shutdown().await?;

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
