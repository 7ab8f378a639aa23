//! Bus and queue seams.
//!
//! The pub/sub bus and the work queue are external services; this module
//! only fixes their interface. Both carry the same record shape: a string
//! body plus string attributes. Consumers receive these records in batches
//! and hand them to a pipeline handler.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A message body with routing attributes, as published or delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Payload, usually JSON.
    pub body: String,
    /// Routing and correlation attributes.
    pub attributes: BTreeMap<String, String>,
}

impl Message {
    /// Create a message with no attributes.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Exact-name attribute lookup (bus convention).
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Case-insensitive attribute lookup (queue convention).
    pub fn attribute_ignore_case(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Publish side of the pub/sub bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message to a topic. Returns the bus-assigned delivery id.
    async fn publish(&self, topic: &str, message: &Message) -> Result<String>;
}

/// Send side of the work queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a message.
    async fn send(&self, queue: &str, message: &Message) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_lookup() {
        let msg = Message::new("{}")
            .with_attribute("message_type", "table")
            .with_attribute("ExportBatchId", "42");
        assert_eq!(msg.attribute("message_type"), Some("table"));
        assert_eq!(msg.attribute("exportbatchid"), None);
        assert_eq!(msg.attribute_ignore_case("exportbatchid"), Some("42"));
        assert_eq!(msg.attribute_ignore_case("EXPORTBATCHID"), Some("42"));
        assert_eq!(msg.attribute_ignore_case("schematype"), None);
    }
}
