use std::fmt;

/// Error kind for broker errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid client or producer configuration.
    Config,
    /// Client could not connect, or was used after `close()`.
    Connection,
    /// The message itself was rejected (empty topic, oversized payload).
    Message,
    /// Produce or flush failed.
    Delivery,
    /// The producer buffer is full; messages must be delivered first.
    BufferOverflow,
    /// Flushing or terminating an async producer failed.
    Shutdown,
}

/// Broker error, returned by every collaborator trait method.
///
/// The façade never rewrites these: a failure raised by the broker client
/// reaches the caller with the same kind and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Connection, message: msg.into() }
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Message, message: msg.into() }
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Delivery, message: msg.into() }
    }

    pub fn buffer_overflow(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::BufferOverflow, message: msg.into() }
    }

    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Shutdown, message: msg.into() }
    }

    /// Add context to the error, preserving the original ErrorKind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for BrokerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_context_keeps_kind() {
        let err = BrokerError::delivery("leader not available").with_context("topic 'orders'");
        assert_eq!(err.kind, ErrorKind::Delivery);
        assert_eq!(err.message, "topic 'orders': leader not available");
        assert_eq!(err.to_string(), "Delivery: topic 'orders': leader not available");
    }
}
