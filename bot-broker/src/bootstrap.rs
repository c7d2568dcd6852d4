//! Startup wiring for the broker connection.
//!
//! Builds the three process-wide handles in a fixed order and hands them to
//! the caller:
//!
//! 1. the JSON codec
//! 2. the synchronous client, then the async template on top of it
//! 3. the events queue declaration, declared through the client
//!
//! Any failure aborts startup. There is no fallback codec or queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::codec::JsonCodec;
use crate::config::Config;
use crate::queue::{events_queue, AsyncTemplate, BrokerClient, QueueDeclaration, Template};

/// Shared broker handles, read-only after construction.
pub struct Broker<C: BrokerClient = Template> {
    pub codec: Arc<JsonCodec>,
    pub client: Arc<C>,
    pub async_template: AsyncTemplate<C>,
    pub events_queue: QueueDeclaration,
}

impl Broker<Template> {
    /// Connect to RabbitMQ and build every handle.
    pub async fn start(config: &Config) -> Result<Self> {
        let codec = Arc::new(JsonCodec::new());

        let template = Template::connect(config)
            .await
            .context("Failed to build broker client")?;

        Self::assemble(Arc::new(template), codec, config).await
    }
}

impl<C: BrokerClient> Broker<C> {
    /// Build the handles over a client that is already constructed.
    pub async fn with_client(client: Arc<C>, config: &Config) -> Result<Self> {
        Self::assemble(client, Arc::new(JsonCodec::new()), config).await
    }

    async fn assemble(client: Arc<C>, codec: Arc<JsonCodec>, config: &Config) -> Result<Self> {
        let async_template =
            AsyncTemplate::new(Arc::clone(&client), Arc::clone(&codec), config.reply_timeout)
                .await
                .context("Failed to build async template")?
                .with_routing_key(config.request_routing_key.clone());

        let events_queue = events_queue();
        client
            .declare_queue(&events_queue)
            .await
            .with_context(|| format!("Failed to declare queue {}", events_queue.name))?;

        info!(
            queue = %events_queue.name,
            durable = events_queue.durable,
            reply_address = client.reply_address(),
            request_routing_key = %config.request_routing_key,
            "broker_ready"
        );

        Ok(Self {
            codec,
            client,
            async_template,
            events_queue,
        })
    }

    /// Close the underlying client.
    pub async fn shutdown(&self) -> Result<()> {
        self.client
            .close()
            .await
            .context("Failed to close broker client")?;

        info!("broker_shutdown_complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryClient, EVENTS};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        #[serde(rename = "type")]
        kind: String,
        id: i32,
    }

    #[tokio::test]
    async fn test_with_client_builds_all_handles() {
        let client = Arc::new(MemoryClient::new());
        let broker = Broker::with_client(Arc::clone(&client), &Config::default())
            .await
            .unwrap();

        assert_eq!(broker.events_queue.name, EVENTS);
        assert!(!broker.events_queue.durable);
        assert_eq!(client.declared(), vec![events_queue()]);
        assert_eq!(
            broker.async_template.receive_timeout(),
            Config::default().reply_timeout
        );
    }

    #[tokio::test]
    async fn test_requests_use_configured_routing_key() {
        let client = Arc::new(MemoryClient::new());
        let config = Config {
            request_routing_key: "sentinel-requests-eu".to_string(),
            ..Config::default()
        };
        let broker = Broker::with_client(Arc::clone(&client), &config)
            .await
            .unwrap();

        let ping = Ping {
            kind: "PING".to_string(),
            id: 1,
        };
        broker
            .async_template
            .send_default(&ping)
            .unwrap()
            .await
            .unwrap();
        let _pending = broker
            .async_template
            .send_and_receive_default::<_, Ping>(&ping)
            .unwrap();

        let published = client.wait_for_published(2).await;
        assert_eq!(published[0].routing_key, config.request_routing_key);
        assert_eq!(published[1].routing_key, config.request_routing_key);
    }

    #[tokio::test]
    async fn test_closed_client_aborts_startup() {
        let client = Arc::new(MemoryClient::closed());
        let result = Broker::with_client(Arc::clone(&client), &Config::default()).await;

        assert!(result.is_err());
        assert!(client.declared().is_empty());
    }

    #[tokio::test]
    async fn test_events_flow_through_shared_codec() {
        let client = Arc::new(MemoryClient::new());
        let broker = Broker::with_client(Arc::clone(&client), &Config::default())
            .await
            .unwrap();

        let ping = Ping {
            kind: "PING".to_string(),
            id: 42,
        };
        broker
            .async_template
            .send(&broker.events_queue.name, &ping)
            .unwrap()
            .await
            .unwrap();

        let published = client.published();
        assert_eq!(published[0].routing_key, EVENTS);
        let decoded: Ping = broker.codec.decode(&published[0].message).unwrap();
        assert_eq!(decoded, ping);

        broker.shutdown().await.unwrap();
        assert!(!client.is_open());
    }
}
