//! The synchronous broker client seam.
//!
//! "Synchronous" here means a publish does not return until the broker has
//! confirmed it. The [`AsyncTemplate`](super::AsyncTemplate) wraps any
//! implementation of this trait and moves that wait off the caller.

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use super::types::QueueDeclaration;
use crate::error::Result;
use crate::message::Message;

/// Operations the async template needs from a broker client.
pub trait BrokerClient: Send + Sync + 'static {
    /// Whether the client currently holds a usable connection.
    fn is_open(&self) -> bool;

    /// Declare a queue, creating it if it does not exist.
    fn declare_queue<'a>(&'a self, queue: &'a QueueDeclaration) -> BoxFuture<'a, Result<()>>;

    /// Publish a message and wait for the broker to confirm it.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: Message,
    ) -> BoxFuture<'a, Result<()>>;

    /// Address replies should be sent to, used as the `reply_to` property.
    fn reply_address(&self) -> &str;

    /// Start receiving messages sent to [`reply_address`](Self::reply_address).
    ///
    /// The stream ends when the client is closed.
    fn replies(&self) -> BoxFuture<'_, Result<BoxStream<'static, Message>>>;

    /// Close the connection.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}
