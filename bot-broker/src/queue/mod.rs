//! Queue module for broker operations.
//!
//! This module provides:
//! - Queue names shared with the gateway service and queue declarations
//! - The [`BrokerClient`] seam with a RabbitMQ and an in-memory client
//! - The non-blocking [`AsyncTemplate`] wrapper
//!
//! ## Layering
//!
//! ```text
//! AsyncTemplate (non-blocking) → BrokerClient (confirmed publish) → Template (lapin) | MemoryClient
//! ```

pub mod async_template;
pub mod client;
pub mod memory;
pub mod template;
pub mod types;

pub use async_template::{AsyncTemplate, PendingReply, PendingSend};
pub use client::BrokerClient;
pub use memory::{MemoryClient, Published};
pub use template::{Template, DIRECT_REPLY_TO};
pub use types::{events_queue, QueueDeclaration, EVENTS, REQUESTS};
