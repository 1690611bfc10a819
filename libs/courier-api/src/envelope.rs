use bytes::Bytes;

use crate::error::BrokerError;

/// One message to publish: topic, payload, key and partition key.
///
/// Immutable once built. When no partition key is set, the message key
/// doubles as the partition key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    topic: String,
    payload: Bytes,
    key: Option<Bytes>,
    partition_key: Option<Bytes>,
}

impl MessageEnvelope {
    /// Build an envelope without key. Rejects an empty topic.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Result<Self, BrokerError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(BrokerError::message("topic must not be empty"));
        }
        Ok(Self {
            topic,
            payload: payload.into(),
            key: None,
            partition_key: None,
        })
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<Bytes>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    /// Explicit partition key, or the message key when none was set.
    pub fn partition_key(&self) -> Option<&Bytes> {
        self.partition_key.as_ref().or(self.key.as_ref())
    }
}
