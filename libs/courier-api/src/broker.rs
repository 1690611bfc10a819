//! Collaborator traits: the only way the façade talks to a broker.
//!
//! The engine doesn't know concrete broker clients. For the engine, a broker
//! is just these traits. Every method may block on network I/O.

use std::sync::Arc;

use crate::config::ConfigValues;
use crate::envelope::MessageEnvelope;
use crate::error::BrokerError;

/// Creates connected clients. Called by the engine only when no client is
/// configured for the calling context.
pub trait ClientFactory: Send + Sync {
    fn create_client(&self, config: &ConfigValues) -> Result<Arc<dyn BrokerClient>, BrokerError>;
}

/// A connection/session with the broker, able to yield producers.
pub trait BrokerClient: Send + Sync {
    /// One-shot producer: buffers `produce` calls until `deliver_all`.
    fn producer(&self, config: &ConfigValues) -> Result<Box<dyn SyncProducer>, BrokerError>;

    /// Long-lived producer, shared by reference until shut down.
    fn async_producer(&self, config: &ConfigValues) -> Result<Arc<dyn AsyncProducer>, BrokerError>;

    fn close(&self) -> Result<(), BrokerError>;
}

pub trait SyncProducer: Send {
    /// Buffer a message. Nothing is sent until `deliver_all`.
    fn produce(&mut self, message: &MessageEnvelope) -> Result<(), BrokerError>;

    /// Flush every buffered message.
    fn deliver_all(&mut self) -> Result<(), BrokerError>;
}

pub trait AsyncProducer: Send + Sync {
    fn produce(&self, message: &MessageEnvelope) -> Result<(), BrokerError>;

    fn deliver_all(&self) -> Result<(), BrokerError>;

    /// Terminate the producer. Messages still buffered are discarded, so
    /// callers flush with `deliver_all` first.
    fn shutdown(&self) -> Result<(), BrokerError>;
}
