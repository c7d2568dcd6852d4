//! Queue names shared with the gateway service, and queue declarations.
//!
//! The names here must stay in lock-step with the service on the other end
//! of the broker connection.

use lapin::options::QueueDeclareOptions;

/// Queue carrying events from the gateway service to the bot.
pub const EVENTS: &str = "sentinel-events";

/// Queue the gateway service consumes requests from.
pub const REQUESTS: &str = "sentinel-requests";

/// Name and flags describing a queue to declare on the broker.
///
/// Declaring is idempotent on the broker side as long as the flags match an
/// existing queue of the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    /// Survives a broker restart
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueDeclaration {
    /// A shared, non-auto-deleting queue with the given durability.
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            durable,
            exclusive: false,
            auto_delete: false,
        }
    }

    pub fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            ..Default::default()
        }
    }
}

/// The non-durable events queue.
pub fn events_queue() -> QueueDeclaration {
    QueueDeclaration::new(EVENTS, false)
}
