//! Broker-neutral message envelope.
//!
//! The codec produces [`Message`]s and the broker clients translate them to
//! and from AMQP deliveries, so nothing above the client layer touches
//! `lapin` types directly.

use lapin::{message::Delivery, types::ShortString, BasicProperties};

/// Content type written by the JSON codec.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message body plus the subset of AMQP properties this crate uses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Message metadata carried alongside the body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Name of the payload type, sent as the AMQP `type` property
    pub type_id: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// 1 = transient, 2 = persistent
    pub delivery_mode: Option<u8>,
}

impl Message {
    pub fn new(body: Vec<u8>, properties: MessageProperties) -> Self {
        Self { body, properties }
    }

    /// Build a message from an AMQP delivery.
    pub fn from_delivery(delivery: Delivery) -> Self {
        Self {
            properties: MessageProperties::from_amqp(&delivery.properties),
            body: delivery.data,
        }
    }
}

impl MessageProperties {
    /// Convert into AMQP basic properties for publishing.
    pub fn to_amqp(&self) -> BasicProperties {
        let mut props = BasicProperties::default();
        if let Some(v) = &self.content_type {
            props = props.with_content_type(v.clone().into());
        }
        if let Some(v) = &self.content_encoding {
            props = props.with_content_encoding(v.clone().into());
        }
        if let Some(v) = &self.type_id {
            props = props.with_kind(v.clone().into());
        }
        if let Some(v) = &self.message_id {
            props = props.with_message_id(v.clone().into());
        }
        if let Some(v) = &self.correlation_id {
            props = props.with_correlation_id(v.clone().into());
        }
        if let Some(v) = &self.reply_to {
            props = props.with_reply_to(v.clone().into());
        }
        if let Some(mode) = self.delivery_mode {
            props = props.with_delivery_mode(mode);
        }
        props
    }

    pub fn from_amqp(props: &BasicProperties) -> Self {
        fn owned(value: &Option<ShortString>) -> Option<String> {
            value.as_ref().map(|s| s.as_str().to_string())
        }

        Self {
            content_type: owned(props.content_type()),
            content_encoding: owned(props.content_encoding()),
            type_id: owned(props.kind()),
            message_id: owned(props.message_id()),
            correlation_id: owned(props.correlation_id()),
            reply_to: owned(props.reply_to()),
            delivery_mode: *props.delivery_mode(),
        }
    }

    /// True when the content type is absent or names a JSON media type.
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map_or(true, |ct| ct.to_ascii_lowercase().contains("json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amqp_properties_roundtrip() {
        let props = MessageProperties {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            content_encoding: Some("UTF-8".to_string()),
            type_id: Some("Ping".to_string()),
            message_id: None,
            correlation_id: Some("abc-123".to_string()),
            reply_to: Some("amq.rabbitmq.reply-to".to_string()),
            delivery_mode: Some(1),
        };

        let amqp = props.to_amqp();
        assert_eq!(amqp.correlation_id().as_ref().map(|s| s.as_str()), Some("abc-123"));
        assert_eq!(MessageProperties::from_amqp(&amqp), props);
    }

    #[test]
    fn test_is_json() {
        let mut props = MessageProperties::default();
        assert!(props.is_json());

        props.content_type = Some("application/vnd.api+json".to_string());
        assert!(props.is_json());

        props.content_type = Some("text/plain".to_string());
        assert!(!props.is_json());
    }
}
