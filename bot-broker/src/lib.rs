//! Bot Broker - message broker client layer for the bot.
//!
//! This library builds the handles the bot uses to talk to the gateway
//! service over RabbitMQ:
//! - `JsonCodec`: JSON conversion for immutable message records
//! - `AsyncTemplate`: non-blocking send and request/response
//! - `QueueDeclaration`: the non-durable events queue
//!
//! ## Startup order
//!
//! ```text
//! JsonCodec → Template (confirmed publish) → AsyncTemplate → declare EVENTS
//! ```

pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod queue;

// Re-export commonly used types
pub use bootstrap::Broker;
pub use codec::JsonCodec;
pub use config::{Config, Transport};
pub use error::{BrokerError, CodecError};
pub use message::{Message, MessageProperties};
pub use queue::{
    events_queue, AsyncTemplate, BrokerClient, MemoryClient, PendingReply, PendingSend,
    QueueDeclaration, Template, EVENTS, REQUESTS,
};
