use courier_api::BrokerError;

use crate::context::ContextId;
use crate::registry::AsyncProducerState;

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error(
        "async producer not configured for {context} (state: {state}), \
         call create_async_producer first"
    )]
    AsyncProducerNotConfigured {
        context: ContextId,
        state: AsyncProducerState,
    },

    /// Failure raised by the broker client, passed through untouched.
    #[error(transparent)]
    Delivery(#[from] BrokerError),

    #[error("shutdown failed: {0}")]
    Shutdown(BrokerError),

    #[error("invalid message: {0}")]
    InvalidMessage(BrokerError),

    #[error("config error: {0}")]
    Config(String),
}

impl ProducerError {
    /// Add context to a configuration error.
    ///
    /// Broker failures are never rewritten; other variants are returned as is.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            ProducerError::Config(msg) => ProducerError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }

    /// The broker error behind this failure, if any.
    pub fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            ProducerError::Delivery(e) | ProducerError::Shutdown(e) | ProducerError::InvalidMessage(e) => {
                Some(e)
            }
            _ => None,
        }
    }
}
