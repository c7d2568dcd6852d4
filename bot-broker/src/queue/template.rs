//! RabbitMQ client backed by lapin.
//!
//! The template owns one connection and one channel. Publisher confirms are
//! enabled on the channel so every publish waits for the broker's ack.

use anyhow::Context;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use tracing::{info, warn};

use super::client::BrokerClient;
use super::types::QueueDeclaration;
use crate::config::Config;
use crate::error::{BrokerError, Result};
use crate::message::Message;

/// RabbitMQ's direct reply-to pseudo queue.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

const REPLY_CONSUMER_TAG: &str = "bot-broker-replies";

/// Confirmed-publish RabbitMQ client.
pub struct Template {
    connection: Connection,
    channel: Channel,
}

impl Template {
    /// Connect to the broker and open a confirm-mode channel.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        info!(
            url_length = config.amqp_url.len(),
            connection_name = %config.connection_name,
            "rabbitmq_connecting"
        );

        let properties = ConnectionProperties::default()
            .with_connection_name(config.connection_name.clone().into());

        let connection = Connection::connect(&config.amqp_url, properties)
            .await
            .context("Failed to connect to RabbitMQ")?;

        info!("rabbitmq_connected");

        let channel = connection
            .create_channel()
            .await
            .context("Failed to create channel")?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        info!(channel_id = channel.id(), "rabbitmq_channel_created");

        Ok(Self {
            connection,
            channel,
        })
    }
}

impl BrokerClient for Template {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    fn declare_queue<'a>(&'a self, queue: &'a QueueDeclaration) -> BoxFuture<'a, Result<()>> {
        async move {
            let declared = self
                .channel
                .queue_declare(&queue.name, queue.options(), FieldTable::default())
                .await?;

            info!(
                queue = %queue.name,
                durable = queue.durable,
                message_count = declared.message_count(),
                consumer_count = declared.consumer_count(),
                "rabbitmq_queue_declared"
            );

            Ok(())
        }
        .boxed()
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: Message,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let confirmation = self
                .channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &message.body,
                    message.properties.to_amqp(),
                )
                .await?
                .await?;

            if confirmation.is_nack() {
                warn!(
                    exchange = exchange,
                    routing_key = routing_key,
                    "rabbitmq_publish_nacked"
                );
                return Err(BrokerError::PublishNacked {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }

            info!(
                exchange = exchange,
                routing_key = routing_key,
                correlation_id = ?message.properties.correlation_id,
                body_length = message.body.len(),
                "rabbitmq_published"
            );

            Ok(())
        }
        .boxed()
    }

    fn reply_address(&self) -> &str {
        DIRECT_REPLY_TO
    }

    fn replies(&self) -> BoxFuture<'_, Result<BoxStream<'static, Message>>> {
        async move {
            // Direct reply-to requires no-ack consumption on the publishing channel
            let consumer = self
                .channel
                .basic_consume(
                    DIRECT_REPLY_TO,
                    REPLY_CONSUMER_TAG,
                    BasicConsumeOptions {
                        no_ack: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;

            info!(queue = DIRECT_REPLY_TO, "rabbitmq_reply_consumer_started");

            let replies = consumer.filter_map(|delivery| {
                future::ready(match delivery {
                    Ok(delivery) => Some(Message::from_delivery(delivery)),
                    Err(e) => {
                        warn!(error = %e, "rabbitmq_reply_delivery_error");
                        None
                    }
                })
            });

            Ok(replies.boxed())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            if let Err(e) = self.channel.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }

            self.connection.close(200, "Normal shutdown").await?;

            info!("rabbitmq_template_closed");
            Ok(())
        }
        .boxed()
    }
}
