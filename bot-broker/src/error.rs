//! Error types for the broker client layer.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while converting between payloads and messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {type_name} as JSON: {source}")]
    Encode {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode JSON payload: {0}")]
    Json(#[source] serde_json::Error),

    #[error("unsupported content type `{0}`, expected JSON")]
    UnsupportedContentType(String),
}

/// Errors raised by the broker clients and the async template.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The underlying client is closed or was never connected.
    #[error("broker client is not available")]
    ClientUnavailable,

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("broker rejected publish to exchange `{exchange}` with routing key `{routing_key}`")]
    PublishNacked {
        exchange: String,
        routing_key: String,
    },

    #[error("no reply for correlation id {correlation_id} within {timeout:?}")]
    ReplyTimeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("reply channel closed before a reply arrived")]
    ReplyChannelClosed,

    #[error("background task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
