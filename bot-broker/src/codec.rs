//! JSON message codec.
//!
//! Payloads are immutable records: plain `serde` structs whose fields are
//! filled from name-matched JSON keys in one step, with no setters and no
//! `Default` required. One codec is built at startup and shared read-only.

use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::error::CodecError;
use crate::message::{Message, MessageProperties, JSON_CONTENT_TYPE};

const JSON_ENCODING: &str = "UTF-8";

/// Converts payloads to and from JSON [`Message`]s.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec {
    _private: (),
}

impl JsonCodec {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Serialize a payload into a message with JSON content headers.
    pub fn encode<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Message, CodecError> {
        let type_name = std::any::type_name::<T>();
        let body = serde_json::to_vec(payload)
            .map_err(|source| CodecError::Encode { type_name, source })?;

        Ok(Message::new(
            body,
            MessageProperties {
                content_type: Some(JSON_CONTENT_TYPE.to_string()),
                content_encoding: Some(JSON_ENCODING.to_string()),
                type_id: Some(short_type_name(type_name)),
                ..Default::default()
            },
        ))
    }

    /// Deserialize a message body into a payload.
    ///
    /// A missing content type is read as JSON. Any other non-JSON content
    /// type is rejected rather than guessed at.
    pub fn decode<T: DeserializeOwned>(&self, message: &Message) -> Result<T, CodecError> {
        if !message.properties.is_json() {
            let content_type = message.properties.content_type.clone().unwrap_or_default();
            warn!(
                content_type = %content_type,
                body_length = message.body.len(),
                "codec_unsupported_content_type"
            );
            return Err(CodecError::UnsupportedContentType(content_type));
        }

        serde_json::from_slice(&message.body).map_err(CodecError::Json)
    }
}

/// Strip module paths from a type name, including inside generic
/// arguments: `a::Wrapper<b::Ping>` becomes `Wrapper<Ping>`.
fn short_type_name(full: &str) -> String {
    let mut short = String::with_capacity(full.len());
    let mut segment = String::new();

    for c in full.chars() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            segment.push(c);
            continue;
        }
        short.push_str(segment.rsplit("::").next().unwrap_or_default());
        segment.clear();
        short.push(c);
    }
    short.push_str(segment.rsplit("::").next().unwrap_or_default());

    short
}
