use std::sync::Arc;

use bytes::Bytes;

use courier_api::{
    AsyncProducer, BrokerClient, BrokerError, ClientFactory, ConfigValues, MessageEnvelope,
};

use crate::config::CourierConfig;
use crate::context::ContextId;
use crate::error::ProducerError;
use crate::registry::{AsyncProducerState, ContextRegistry};

/// Entry point for application code publishing to the broker.
///
/// Cheap to clone: all clones share one registry, factory and config.
#[derive(Clone)]
pub struct ProducerFacade {
    registry: Arc<ContextRegistry>,
    factory: Arc<dyn ClientFactory>,
    config: Arc<CourierConfig>,
}

impl std::fmt::Debug for ProducerFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerFacade")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl ProducerFacade {
    pub fn new(factory: Arc<dyn ClientFactory>, config: CourierConfig) -> Self {
        Self {
            registry: Arc::new(ContextRegistry::new()),
            factory,
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    /// Bind the façade to one execution context.
    pub fn bind(&self, ctx: ContextId) -> ContextProducer {
        ContextProducer {
            facade: self.clone(),
            ctx,
        }
    }

    /// Inject a pre-built client for `ctx` (or clear it with `None`).
    ///
    /// The caller keeps ownership: the façade never closes a configured client.
    pub fn configure_client(&self, ctx: ContextId, client: Option<Arc<dyn BrokerClient>>) {
        self.registry.configure_client(ctx, client);
    }

    pub fn client(&self, ctx: ContextId) -> Option<Arc<dyn BrokerClient>> {
        self.registry.client(ctx)
    }

    pub fn async_producer(&self, ctx: ContextId) -> Option<Arc<dyn AsyncProducer>> {
        self.registry.async_producer(ctx)
    }

    pub fn async_producer_state(&self, ctx: ContextId) -> AsyncProducerState {
        self.registry.async_producer_state(ctx)
    }

    /// Publish one message synchronously. The key doubles as partition key.
    pub fn publish(
        &self,
        ctx: ContextId,
        topic: &str,
        payload: impl Into<Bytes>,
        key: Option<Bytes>,
    ) -> Result<(), ProducerError> {
        let message = envelope(topic, payload, key)?;
        self.publish_list(ctx, std::slice::from_ref(&message))
    }

    /// Publish a batch synchronously: produce in order, deliver once.
    ///
    /// Uses the context's client if one is stored. Otherwise a client is
    /// created for this call and closed once the batch is done, whether
    /// delivery succeeded or not. A failed close fails the call; when the
    /// batch already failed, the delivery error is returned instead.
    pub fn publish_list(&self, ctx: ContextId, messages: &[MessageEnvelope]) -> Result<(), ProducerError> {
        let lease = self.registry.lease_client(ctx, || self.create_client())?;
        let delivered = deliver_batch(&**lease.client(), self.config.producer.for_sync(), messages);
        let closed = if lease.is_owned() {
            lease.client().close()
        } else {
            Ok(())
        };

        match (delivered, closed) {
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    tracing::warn!(context = %ctx, error = %close_err, "failed to close one-shot broker client after failed batch");
                }
                Err(ProducerError::Delivery(e))
            }
            (Ok(()), Err(e)) => Err(ProducerError::Delivery(e)),
            (Ok(()), Ok(())) => {
                tracing::debug!(context = %ctx, messages = messages.len(), "delivered batch");
                Ok(())
            }
        }
    }

    /// Publish one message through the context's async producer.
    pub fn async_publish(
        &self,
        ctx: ContextId,
        topic: &str,
        payload: impl Into<Bytes>,
        key: Option<Bytes>,
    ) -> Result<(), ProducerError> {
        let message = envelope(topic, payload, key)?;
        self.async_publish_list(ctx, std::slice::from_ref(&message))
    }

    /// Publish a batch through the context's async producer.
    ///
    /// Fails without touching the broker unless `create_async_producer` was
    /// called in this context. Never closes the client or the producer.
    pub fn async_publish_list(
        &self,
        ctx: ContextId,
        messages: &[MessageEnvelope],
    ) -> Result<(), ProducerError> {
        let producer = self.registry.async_producer(ctx).ok_or_else(|| {
            ProducerError::AsyncProducerNotConfigured {
                context: ctx,
                state: self.registry.async_producer_state(ctx),
            }
        })?;

        for message in messages {
            producer.produce(message)?;
        }
        producer.deliver_all()?;
        tracing::debug!(context = %ctx, messages = messages.len(), "delivered async batch");
        Ok(())
    }

    /// Create the async producer for `ctx`, creating a client first if none
    /// is configured. No-op while a producer is live.
    pub fn create_async_producer(&self, ctx: ContextId) -> Result<(), ProducerError> {
        let config = self.config.producer.for_async();
        self.registry
            .create_async_producer(ctx, || self.create_client(), |client| client.async_producer(config))?;
        Ok(())
    }

    /// Flush and shut down the async producer of `ctx`. The client stays.
    pub fn async_producer_shutdown(&self, ctx: ContextId) -> Result<(), ProducerError> {
        self.registry
            .async_producer_shutdown(ctx)
            .map_err(ProducerError::Shutdown)
    }

    /// Drop all state of `ctx`; see [`ContextRegistry::release`].
    pub fn release_context(&self, ctx: ContextId) -> Result<(), ProducerError> {
        self.registry.release(ctx).map_err(ProducerError::Shutdown)
    }

    /// Flush and shut down the async producers of every context.
    ///
    /// Keeps going after a failure and returns the first one.
    pub fn shutdown_all(&self) -> Result<(), ProducerError> {
        let mut first_error = None;
        for ctx in self.registry.contexts() {
            if let Err(e) = self.registry.async_producer_shutdown(ctx) {
                tracing::error!(context = %ctx, error = %e, "async producer shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(ProducerError::Shutdown(e)))
    }

    fn create_client(&self) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        self.factory.create_client(&self.config.client)
    }
}

fn envelope(topic: &str, payload: impl Into<Bytes>, key: Option<Bytes>) -> Result<MessageEnvelope, ProducerError> {
    let message = MessageEnvelope::new(topic, payload).map_err(ProducerError::InvalidMessage)?;
    Ok(match key {
        Some(key) => message.with_key(key),
        None => message,
    })
}

fn deliver_batch(
    client: &dyn BrokerClient,
    config: &ConfigValues,
    messages: &[MessageEnvelope],
) -> Result<(), BrokerError> {
    let mut producer = client.producer(config)?;
    for message in messages {
        producer.produce(message)?;
    }
    producer.deliver_all()
}

/// A [`ProducerFacade`] bound to one execution context.
///
/// Owned and `Send`: move it into the thread or blocking task that acts as
/// the context.
#[derive(Debug, Clone)]
pub struct ContextProducer {
    facade: ProducerFacade,
    ctx: ContextId,
}

impl ContextProducer {
    pub fn context(&self) -> ContextId {
        self.ctx
    }

    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>, key: Option<Bytes>) -> Result<(), ProducerError> {
        self.facade.publish(self.ctx, topic, payload, key)
    }

    pub fn publish_list(&self, messages: &[MessageEnvelope]) -> Result<(), ProducerError> {
        self.facade.publish_list(self.ctx, messages)
    }

    pub fn async_publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        key: Option<Bytes>,
    ) -> Result<(), ProducerError> {
        self.facade.async_publish(self.ctx, topic, payload, key)
    }

    pub fn async_publish_list(&self, messages: &[MessageEnvelope]) -> Result<(), ProducerError> {
        self.facade.async_publish_list(self.ctx, messages)
    }

    pub fn create_async_producer(&self) -> Result<(), ProducerError> {
        self.facade.create_async_producer(self.ctx)
    }

    pub fn async_producer_shutdown(&self) -> Result<(), ProducerError> {
        self.facade.async_producer_shutdown(self.ctx)
    }

    pub fn configure_client(&self, client: Option<Arc<dyn BrokerClient>>) {
        self.facade.configure_client(self.ctx, client);
    }

    pub fn client(&self) -> Option<Arc<dyn BrokerClient>> {
        self.facade.client(self.ctx)
    }

    pub fn async_producer(&self) -> Option<Arc<dyn AsyncProducer>> {
        self.facade.async_producer(self.ctx)
    }

    /// Release the context; the handle is consumed.
    pub fn release(self) -> Result<(), ProducerError> {
        self.facade.release_context(self.ctx)
    }
}
