//! In-process broker client.
//!
//! Nothing leaves the process: declarations and publishes are recorded, and
//! replies are injected by hand. The binary runs on it when
//! `BROKER_TRANSPORT=memory`, and the async template tests use it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::Notify;
use tracing::debug;

use super::client::BrokerClient;
use super::types::QueueDeclaration;
use crate::error::{BrokerError, Result};
use crate::message::Message;

const MEMORY_REPLY_ADDRESS: &str = "memory.reply-to";

/// A message recorded by [`MemoryClient::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

/// Brokerless [`BrokerClient`].
pub struct MemoryClient {
    open: AtomicBool,
    publish_delay: Option<Duration>,
    declared: Mutex<Vec<QueueDeclaration>>,
    published: Mutex<Vec<Published>>,
    published_notify: Notify,
    reply_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    reply_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryClient {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            open: AtomicBool::new(true),
            publish_delay: None,
            declared: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            published_notify: Notify::new(),
            reply_tx: Mutex::new(Some(tx)),
            reply_rx: Mutex::new(Some(rx)),
        }
    }

    /// A client that has already been closed.
    pub fn closed() -> Self {
        let client = Self::new();
        client.shut();
        client
    }

    /// Make every publish take `delay` before it is recorded, like a slow
    /// broker confirm.
    pub fn with_publish_delay(mut self, delay: Duration) -> Self {
        self.publish_delay = Some(delay);
        self
    }

    pub fn declared(&self) -> Vec<QueueDeclaration> {
        lock(&self.declared).clone()
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.published).clone()
    }

    /// Wait until at least `count` messages have been published.
    pub async fn wait_for_published(&self, count: usize) -> Vec<Published> {
        loop {
            let notified = self.published_notify.notified();
            {
                let published = lock(&self.published);
                if published.len() >= count {
                    return published.clone();
                }
            }
            notified.await;
        }
    }

    /// Deliver a reply to the reply stream.
    pub fn inject_reply(&self, reply: Message) -> Result<()> {
        let tx = lock(&self.reply_tx);
        let tx = tx.as_ref().ok_or(BrokerError::ClientUnavailable)?;
        tx.unbounded_send(reply)
            .map_err(|_| BrokerError::ReplyChannelClosed)
    }

    /// Answer a published request, copying its correlation id onto `reply`.
    pub fn reply_to(&self, request: &Message, mut reply: Message) -> Result<()> {
        reply.properties.correlation_id = request.properties.correlation_id.clone();
        self.inject_reply(reply)
    }

    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the sender ends the reply stream
        lock(&self.reply_tx).take();
    }
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerClient for MemoryClient {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn declare_queue<'a>(&'a self, queue: &'a QueueDeclaration) -> BoxFuture<'a, Result<()>> {
        async move {
            if !self.is_open() {
                return Err(BrokerError::ClientUnavailable);
            }

            let mut declared = lock(&self.declared);
            if !declared.iter().any(|q| q.name == queue.name) {
                declared.push(queue.clone());
            }
            debug!(queue = %queue.name, "memory_queue_declared");
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
            if let Some(delay) = self.publish_delay {
                tokio::time::sleep(delay).await;
            }

            if !self.is_open() {
                return Err(BrokerError::ClientUnavailable);
            }

            lock(&self.published).push(Published {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message,
            });
            self.published_notify.notify_waiters();

            debug!(routing_key = routing_key, "memory_published");
            Ok(())
        }
        .boxed()
    }

    fn reply_address(&self) -> &str {
        MEMORY_REPLY_ADDRESS
    }

    fn replies(&self) -> BoxFuture<'_, Result<BoxStream<'static, Message>>> {
        async move {
            let rx = lock(&self.reply_rx)
                .take()
                .ok_or(BrokerError::ClientUnavailable)?;
            Ok(rx.boxed())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.shut();
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageProperties;

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let client = MemoryClient::new();
        let queue = QueueDeclaration::new("events", false);

        client.declare_queue(&queue).await.unwrap();
        client.declare_queue(&queue).await.unwrap();

        assert_eq!(client.declared(), vec![queue]);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_publish() {
        let client = MemoryClient::closed();
        assert!(!client.is_open());

        let result = client.publish("", "events", Message::default()).await;
        assert!(matches!(result, Err(BrokerError::ClientUnavailable)));
        assert!(client.published().is_empty());
    }

    #[tokio::test]
    async fn test_reply_stream_ends_on_close() {
        let client = MemoryClient::new();
        let mut replies = client.replies().await.unwrap();

        let request = Message::new(
            Vec::new(),
            MessageProperties {
                correlation_id: Some("c-1".to_string()),
                ..Default::default()
            },
        );
        client.reply_to(&request, Message::default()).unwrap();

        let reply = replies.next().await.unwrap();
        assert_eq!(reply.properties.correlation_id.as_deref(), Some("c-1"));

        client.close().await.unwrap();
        assert!(replies.next().await.is_none());
    }

    #[tokio::test]
    async fn test_replies_can_only_be_taken_once() {
        let client = MemoryClient::new();
        assert!(client.replies().await.is_ok());
        assert!(matches!(client.replies().await, Err(BrokerError::ClientUnavailable)));
    }
}
