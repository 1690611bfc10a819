use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use courier_api::{AsyncProducer, BrokerClient, BrokerError};

use crate::context::ContextId;

/// Who owns a stored client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOrigin {
    /// Injected via `configure_client`; the caller closes it.
    Configured,
    /// Created by the registry through the client factory.
    Created,
}

/// Lifecycle of a context's async producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncProducerState {
    Uninitialized,
    Created,
    ShutDown,
}

impl fmt::Display for AsyncProducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncProducerState::Uninitialized => f.write_str("uninitialized"),
            AsyncProducerState::Created => f.write_str("created"),
            AsyncProducerState::ShutDown => f.write_str("shut down"),
        }
    }
}

struct ClientSlot {
    client: Arc<dyn BrokerClient>,
    origin: ClientOrigin,
}

#[derive(Default)]
enum AsyncSlot {
    #[default]
    Uninitialized,
    Created(Arc<dyn AsyncProducer>),
    ShutDown,
}

impl AsyncSlot {
    fn state(&self) -> AsyncProducerState {
        match self {
            AsyncSlot::Uninitialized => AsyncProducerState::Uninitialized,
            AsyncSlot::Created(_) => AsyncProducerState::Created,
            AsyncSlot::ShutDown => AsyncProducerState::ShutDown,
        }
    }

    fn producer(&self) -> Option<Arc<dyn AsyncProducer>> {
        match self {
            AsyncSlot::Created(p) => Some(p.clone()),
            _ => None,
        }
    }
}

#[derive(Default)]
struct ContextEntry {
    client: Option<ClientSlot>,
    async_producer: AsyncSlot,
}

/// A client handed out for a single synchronous batch.
pub struct ClientLease {
    client: Arc<dyn BrokerClient>,
    owned: bool,
}

impl ClientLease {
    pub fn client(&self) -> &Arc<dyn BrokerClient> {
        &self.client
    }

    /// True when the client was created for this lease and must be closed
    /// by the holder once the batch is delivered.
    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

type EntryMap = HashMap<ContextId, Arc<Mutex<ContextEntry>>>;

/// Per-context client and async producer store.
///
/// The map lock only guards structure (lookup/insert/remove). Each context
/// has its own entry mutex, so lazy creation in one context never blocks
/// another context.
pub struct ContextRegistry {
    entries: RwLock<EntryMap>,
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("contexts", &self.read_map().len())
            .finish()
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client for `ctx`, or clear it with `None`.
    ///
    /// A configured client belongs to the caller: the registry never closes it.
    pub fn configure_client(&self, ctx: ContextId, client: Option<Arc<dyn BrokerClient>>) {
        match client {
            Some(client) => {
                let entry = self.entry(ctx);
                lock_entry(&entry).client = Some(ClientSlot {
                    client,
                    origin: ClientOrigin::Configured,
                });
                tracing::debug!(context = %ctx, "configured broker client");
            }
            None => {
                if let Some(entry) = self.lookup(ctx) {
                    lock_entry(&entry).client = None;
                }
            }
        }
    }

    pub fn client(&self, ctx: ContextId) -> Option<Arc<dyn BrokerClient>> {
        let entry = self.lookup(ctx)?;
        let guard = lock_entry(&entry);
        guard.client.as_ref().map(|slot| slot.client.clone())
    }

    pub fn client_origin(&self, ctx: ContextId) -> Option<ClientOrigin> {
        let entry = self.lookup(ctx)?;
        let guard = lock_entry(&entry);
        guard.client.as_ref().map(|slot| slot.origin)
    }

    /// Return the context's client, creating and storing one via `factory`
    /// if there is none.
    pub fn ensure_client<F>(&self, ctx: ContextId, factory: F) -> Result<Arc<dyn BrokerClient>, BrokerError>
    where
        F: FnOnce() -> Result<Arc<dyn BrokerClient>, BrokerError>,
    {
        let entry = self.entry(ctx);
        let mut guard = lock_entry(&entry);
        ensure_client_locked(&mut guard, ctx, factory)
    }

    /// Client for one synchronous batch.
    ///
    /// A stored client is lent as is. Otherwise a new client is created and
    /// returned as owned without being stored: the holder closes it after
    /// delivery, so it must not outlive the batch.
    pub fn lease_client<F>(&self, ctx: ContextId, factory: F) -> Result<ClientLease, BrokerError>
    where
        F: FnOnce() -> Result<Arc<dyn BrokerClient>, BrokerError>,
    {
        let entry = self.entry(ctx);
        let guard = lock_entry(&entry);
        if let Some(slot) = guard.client.as_ref() {
            return Ok(ClientLease {
                client: slot.client.clone(),
                owned: false,
            });
        }
        let client = factory()?;
        tracing::debug!(context = %ctx, "created one-shot broker client");
        Ok(ClientLease { client, owned: true })
    }

    /// Create the context's async producer unless one is already live.
    ///
    /// Ensures a client first (see [`ContextRegistry::ensure_client`]), then
    /// builds the producer from it. Re-creation after a shutdown is allowed.
    pub fn create_async_producer<C, P>(
        &self,
        ctx: ContextId,
        client_factory: C,
        producer_factory: P,
    ) -> Result<(), BrokerError>
    where
        C: FnOnce() -> Result<Arc<dyn BrokerClient>, BrokerError>,
        P: FnOnce(&Arc<dyn BrokerClient>) -> Result<Arc<dyn AsyncProducer>, BrokerError>,
    {
        let entry = self.entry(ctx);
        let mut guard = lock_entry(&entry);
        if let AsyncSlot::Created(_) = guard.async_producer {
            return Ok(());
        }

        let client = ensure_client_locked(&mut guard, ctx, client_factory)?;
        let producer = producer_factory(&client)?;
        guard.async_producer = AsyncSlot::Created(producer);
        tracing::info!(context = %ctx, "created async producer");
        Ok(())
    }

    pub fn async_producer(&self, ctx: ContextId) -> Option<Arc<dyn AsyncProducer>> {
        let entry = self.lookup(ctx)?;
        let guard = lock_entry(&entry);
        guard.async_producer.producer()
    }

    pub fn async_producer_state(&self, ctx: ContextId) -> AsyncProducerState {
        match self.lookup(ctx) {
            Some(entry) => lock_entry(&entry).async_producer.state(),
            None => AsyncProducerState::Uninitialized,
        }
    }

    /// Flush and terminate the context's async producer, then forget it.
    ///
    /// No-op without a live producer. On failure the producer stays in place.
    pub fn async_producer_shutdown(&self, ctx: ContextId) -> Result<(), BrokerError> {
        let Some(entry) = self.lookup(ctx) else {
            return Ok(());
        };
        let mut guard = lock_entry(&entry);
        let Some(producer) = guard.async_producer.producer() else {
            return Ok(());
        };

        producer.deliver_all()?;
        producer.shutdown()?;
        guard.async_producer = AsyncSlot::ShutDown;
        tracing::info!(context = %ctx, "async producer shut down");
        Ok(())
    }

    /// Tear down a context: shut down its async producer, close its client
    /// if the registry created it, and drop the entry.
    ///
    /// The entry is removed even when teardown fails; the first error is
    /// returned.
    pub fn release(&self, ctx: ContextId) -> Result<(), BrokerError> {
        let Some(entry) = self.write_map().remove(&ctx) else {
            return Ok(());
        };
        let mut guard = lock_entry(&entry);
        let mut first_error = None;

        if let Some(producer) = std::mem::take(&mut guard.async_producer).producer() {
            if let Err(e) = producer.deliver_all().and_then(|()| producer.shutdown()) {
                tracing::error!(context = %ctx, error = %e, "async producer teardown failed");
                first_error.get_or_insert(e);
            }
        }

        if let Some(slot) = guard.client.take() {
            if slot.origin == ClientOrigin::Created {
                if let Err(e) = slot.client.close() {
                    tracing::error!(context = %ctx, error = %e, "client close failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(context = %ctx, "context released");
        first_error.map_or(Ok(()), Err)
    }

    pub fn contexts(&self) -> Vec<ContextId> {
        self.read_map().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    fn lookup(&self, ctx: ContextId) -> Option<Arc<Mutex<ContextEntry>>> {
        self.read_map().get(&ctx).cloned()
    }

    fn entry(&self, ctx: ContextId) -> Arc<Mutex<ContextEntry>> {
        if let Some(entry) = self.lookup(ctx) {
            return entry;
        }
        self.write_map().entry(ctx).or_default().clone()
    }

    fn read_map(&self) -> RwLockReadGuard<'_, EntryMap> {
        match self.entries.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("context registry read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, EntryMap> {
        match self.entries.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("context registry write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn ensure_client_locked<F>(
    entry: &mut ContextEntry,
    ctx: ContextId,
    factory: F,
) -> Result<Arc<dyn BrokerClient>, BrokerError>
where
    F: FnOnce() -> Result<Arc<dyn BrokerClient>, BrokerError>,
{
    if let Some(slot) = entry.client.as_ref() {
        return Ok(slot.client.clone());
    }
    let client = factory()?;
    entry.client = Some(ClientSlot {
        client: client.clone(),
        origin: ClientOrigin::Created,
    });
    tracing::info!(context = %ctx, "created broker client");
    Ok(client)
}

fn lock_entry(entry: &Mutex<ContextEntry>) -> MutexGuard<'_, ContextEntry> {
    match entry.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("context entry lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use courier_api::{ConfigValues, SyncProducer};

    use super::*;

    #[derive(Default)]
    struct NullClient {
        closed: AtomicUsize,
    }

    impl BrokerClient for NullClient {
        fn producer(&self, _config: &ConfigValues) -> Result<Box<dyn SyncProducer>, BrokerError> {
            Err(BrokerError::connection("not used"))
        }

        fn async_producer(&self, _config: &ConfigValues) -> Result<Arc<dyn AsyncProducer>, BrokerError> {
            Err(BrokerError::connection("not used"))
        }

        fn close(&self) -> Result<(), BrokerError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn lookups_do_not_create_entries() {
        let registry = ContextRegistry::new();
        let ctx = ContextId::new();
        assert!(registry.client(ctx).is_none());
        assert!(registry.async_producer(ctx).is_none());
        assert_eq!(registry.async_producer_state(ctx), AsyncProducerState::Uninitialized);
        assert!(registry.async_producer_shutdown(ctx).is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn ensure_client_calls_factory_once() {
        let registry = ContextRegistry::new();
        let ctx = ContextId::new();
        let calls = AtomicUsize::new(0);
        let factory = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullClient::default()) as Arc<dyn BrokerClient>)
        };

        let first = registry.ensure_client(ctx, factory).unwrap();
        let second = registry.ensure_client(ctx, factory).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.client_origin(ctx), Some(ClientOrigin::Created));
    }

    #[test]
    fn ensure_client_failure_stores_nothing() {
        let registry = ContextRegistry::new();
        let ctx = ContextId::new();
        let err = registry
            .ensure_client(ctx, || Err(BrokerError::connection("no brokers reachable")))
            .err()
            .unwrap();
        assert_eq!(err, BrokerError::connection("no brokers reachable"));
        assert!(registry.client(ctx).is_none());
    }

    #[test]
    fn lease_does_not_store_new_clients() {
        let registry = ContextRegistry::new();
        let ctx = ContextId::new();
        let lease = registry
            .lease_client(ctx, || Ok(Arc::new(NullClient::default()) as Arc<dyn BrokerClient>))
            .unwrap();
        assert!(lease.is_owned());
        assert!(registry.client(ctx).is_none());

        let configured: Arc<dyn BrokerClient> = Arc::new(NullClient::default());
        registry.configure_client(ctx, Some(configured.clone()));
        let lease = registry
            .lease_client(ctx, || Err(BrokerError::connection("factory must not run")))
            .unwrap();
        assert!(!lease.is_owned());
        assert!(Arc::ptr_eq(lease.client(), &configured));
    }

    #[test]
    fn configure_none_clears_client() {
        let registry = ContextRegistry::new();
        let ctx = ContextId::new();
        registry.configure_client(ctx, Some(Arc::new(NullClient::default())));
        assert_eq!(registry.client_origin(ctx), Some(ClientOrigin::Configured));
        registry.configure_client(ctx, None);
        assert!(registry.client(ctx).is_none());
    }

    #[test]
    fn release_closes_only_created_clients() {
        let registry = ContextRegistry::new();
        let created = Arc::new(NullClient::default());
        let configured = Arc::new(NullClient::default());

        let a = ContextId::new();
        let b = ContextId::new();
        let created_dyn: Arc<dyn BrokerClient> = created.clone();
        registry.ensure_client(a, move || Ok(created_dyn)).unwrap();
        registry.configure_client(b, Some(configured.clone()));
        assert_eq!(registry.len(), 2);

        registry.release(a).unwrap();
        registry.release(b).unwrap();

        assert_eq!(created.closed.load(Ordering::SeqCst), 1);
        assert_eq!(configured.closed.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
        assert!(registry.release(a).is_ok());
    }
}
