//! Recording broker double: every collaborator call lands in one ordered log.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use courier_api::{
    AsyncProducer, BrokerClient, BrokerError, ClientFactory, ConfigValues, MessageEnvelope,
    SyncProducer,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Produced {
    pub payload: String,
    pub topic: String,
    pub key: Option<String>,
    pub partition_key: Option<String>,
}

impl Produced {
    pub fn keyed(payload: &str, topic: &str, key: &str) -> Self {
        Self {
            payload: payload.into(),
            topic: topic.into(),
            key: Some(key.into()),
            partition_key: Some(key.into()),
        }
    }

    fn from_envelope(message: &MessageEnvelope) -> Self {
        let text = |b: &bytes::Bytes| String::from_utf8_lossy(b).into_owned();
        Self {
            payload: text(message.payload()),
            topic: message.topic().to_string(),
            key: message.key().map(text),
            partition_key: message.partition_key().map(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateClient { client: usize },
    Producer { client: usize, config_keys: Vec<String> },
    Produce(Produced),
    DeliverAll,
    AsyncProducer { client: usize, producer: usize },
    AsyncProduce { producer: usize, message: Produced },
    AsyncDeliverAll { producer: usize },
    AsyncShutdown { producer: usize },
    Close { client: usize },
}

#[derive(Default)]
struct Failures {
    create_client: AtomicBool,
    /// 1-based position of the sync `produce` call that fails; 0 = never.
    produce_at: AtomicUsize,
    deliver: AtomicBool,
    close: AtomicBool,
    async_produce: AtomicBool,
    async_deliver: AtomicBool,
    async_shutdown: AtomicBool,
}

#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
    client_ids: Arc<AtomicUsize>,
    producer_ids: Arc<AtomicUsize>,
    failures: Arc<Failures>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Factory recording `CreateClient` for every client it builds.
    pub fn factory(&self) -> Arc<dyn ClientFactory> {
        Arc::new(self.clone())
    }

    /// Pre-built client, as a caller would pass to `configure_client`.
    pub fn client(&self) -> Arc<dyn BrokerClient> {
        Arc::new(MockClient {
            id: self.next_client_id(),
            recorder: self.clone(),
        })
    }

    pub fn fail_create_client(&self) {
        self.failures.create_client.store(true, Ordering::SeqCst);
    }

    /// Fail the `n`-th `produce` of every sync producer.
    pub fn fail_produce_at(&self, n: usize) {
        self.failures.produce_at.store(n, Ordering::SeqCst);
    }

    pub fn fail_deliver(&self) {
        self.failures.deliver.store(true, Ordering::SeqCst);
    }

    pub fn fail_close(&self) {
        self.failures.close.store(true, Ordering::SeqCst);
    }

    pub fn fail_async_produce(&self, fail: bool) {
        self.failures.async_produce.store(fail, Ordering::SeqCst);
    }

    pub fn fail_async_deliver(&self, fail: bool) {
        self.failures.async_deliver.store(fail, Ordering::SeqCst);
    }

    pub fn fail_async_shutdown(&self, fail: bool) {
        self.failures.async_shutdown.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_client_id(&self) -> usize {
        self.client_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_producer_id(&self) -> usize {
        self.producer_ids.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl ClientFactory for Recorder {
    fn create_client(&self, _config: &ConfigValues) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        if self.failures.create_client.load(Ordering::SeqCst) {
            return Err(BrokerError::connection("no seed broker reachable"));
        }
        let id = self.next_client_id();
        self.record(Call::CreateClient { client: id });
        Ok(Arc::new(MockClient {
            id,
            recorder: self.clone(),
        }))
    }
}

struct MockClient {
    id: usize,
    recorder: Recorder,
}

impl BrokerClient for MockClient {
    fn producer(&self, config: &ConfigValues) -> Result<Box<dyn SyncProducer>, BrokerError> {
        self.recorder.record(Call::Producer {
            client: self.id,
            config_keys: config.names().map(str::to_string).collect(),
        });
        Ok(Box::new(MockSyncProducer {
            recorder: self.recorder.clone(),
            produced: 0,
        }))
    }

    fn async_producer(&self, _config: &ConfigValues) -> Result<Arc<dyn AsyncProducer>, BrokerError> {
        let producer = self.recorder.next_producer_id();
        self.recorder.record(Call::AsyncProducer {
            client: self.id,
            producer,
        });
        Ok(Arc::new(MockAsyncProducer {
            id: producer,
            recorder: self.recorder.clone(),
        }))
    }

    fn close(&self) -> Result<(), BrokerError> {
        self.recorder.record(Call::Close { client: self.id });
        if self.recorder.failures.close.load(Ordering::SeqCst) {
            return Err(BrokerError::connection("socket already reset by broker"));
        }
        Ok(())
    }
}

struct MockSyncProducer {
    recorder: Recorder,
    produced: usize,
}

impl SyncProducer for MockSyncProducer {
    fn produce(&mut self, message: &MessageEnvelope) -> Result<(), BrokerError> {
        self.produced += 1;
        if self.recorder.failures.produce_at.load(Ordering::SeqCst) == self.produced {
            return Err(BrokerError::buffer_overflow("producer buffer is full"));
        }
        self.recorder.record(Call::Produce(Produced::from_envelope(message)));
        Ok(())
    }

    fn deliver_all(&mut self) -> Result<(), BrokerError> {
        self.recorder.record(Call::DeliverAll);
        if self.recorder.failures.deliver.load(Ordering::SeqCst) {
            return Err(BrokerError::delivery("leader not available for topic-1"));
        }
        Ok(())
    }
}

struct MockAsyncProducer {
    id: usize,
    recorder: Recorder,
}

impl AsyncProducer for MockAsyncProducer {
    fn produce(&self, message: &MessageEnvelope) -> Result<(), BrokerError> {
        if self.recorder.failures.async_produce.load(Ordering::SeqCst) {
            return Err(BrokerError::buffer_overflow("async queue is full"));
        }
        self.recorder.record(Call::AsyncProduce {
            producer: self.id,
            message: Produced::from_envelope(message),
        });
        Ok(())
    }

    fn deliver_all(&self) -> Result<(), BrokerError> {
        self.recorder.record(Call::AsyncDeliverAll { producer: self.id });
        if self.recorder.failures.async_deliver.load(Ordering::SeqCst) {
            return Err(BrokerError::delivery("not enough in-sync replicas"));
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<(), BrokerError> {
        if self.recorder.failures.async_shutdown.load(Ordering::SeqCst) {
            return Err(BrokerError::shutdown("producer thread did not stop"));
        }
        self.recorder.record(Call::AsyncShutdown { producer: self.id });
        Ok(())
    }
}

pub fn message(topic: &str, payload: &str, key: &str) -> MessageEnvelope {
    MessageEnvelope::new(topic, payload.to_string())
        .unwrap()
        .with_key(key.to_string())
}

pub fn two_messages() -> Vec<MessageEnvelope> {
    vec![
        message("topic-1", "message-1", "key-1"),
        message("topic-2", "message-2", "key-2"),
    ]
}
