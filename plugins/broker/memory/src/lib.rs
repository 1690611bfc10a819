use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use courier_api::{
    AsyncProducer, BrokerClient, BrokerError, ClientFactory, ConfigValues, MessageEnvelope,
    SyncProducer,
};

const DEFAULT_MAX_BUFFER_SIZE: u64 = 1000;
const DEFAULT_MAX_QUEUE_SIZE: u64 = 1000;

// ═══════════════════════════════════════════════════════════════
//  StoredMessage
// ═══════════════════════════════════════════════════════════════

/// A delivered message, as kept by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub partition: u32,
    pub offset: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub ts_ms: i64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════════
//  BrokerState — topic logs shared by every client
// ═══════════════════════════════════════════════════════════════

struct TopicLog {
    partitions: Vec<Vec<StoredMessage>>,
    next_unkeyed: usize,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| Vec::new()).collect(),
            next_unkeyed: 0,
        }
    }

    /// Keyed messages hash onto a fixed partition, unkeyed ones round-robin.
    fn pick_partition(&mut self, partition_key: Option<&Bytes>) -> usize {
        let count = self.partitions.len();
        match partition_key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            None => {
                let p = self.next_unkeyed % count;
                self.next_unkeyed = self.next_unkeyed.wrapping_add(1);
                p
            }
        }
    }
}

struct BrokerState {
    partitions: u32,
    topics: RwLock<HashMap<String, TopicLog>>,
    clients_created: AtomicUsize,
    open_clients: AtomicUsize,
}

impl BrokerState {
    fn append(&self, messages: &[MessageEnvelope]) {
        let mut topics = match self.topics.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("broker topic lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let ts_ms = now_ms();
        for message in messages {
            let log = topics
                .entry(message.topic().to_string())
                .or_insert_with(|| TopicLog::new(self.partitions));
            let partition = log.pick_partition(message.partition_key());
            let records = &mut log.partitions[partition];
            records.push(StoredMessage {
                partition: partition as u32,
                offset: records.len() as u64,
                key: message.key().cloned(),
                payload: message.payload().clone(),
                ts_ms,
            });
        }
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<String, TopicLog>) -> T) -> T {
        match self.topics.read() {
            Ok(g) => f(&*g),
            Err(poisoned) => {
                tracing::warn!("broker topic lock was poisoned, recovering");
                f(&*poisoned.into_inner())
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBroker — ClientFactory
// ═══════════════════════════════════════════════════════════════

/// In-process broker. Hands out clients that deliver into shared topic logs.
///
/// Honors `seed_brokers` and `client_id` from the client config, and
/// `max_buffer_size`, `max_queue_size`, `delivery_threshold` from the
/// producer config. Everything else is accepted and ignored.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("partitions", &self.state.partitions)
            .field("open_clients", &self.open_clients())
            .finish()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryBroker {
    /// Broker whose topics have `partitions` partitions (at least one).
    pub fn new(partitions: u32) -> Self {
        Self {
            state: Arc::new(BrokerState {
                partitions: partitions.max(1),
                topics: RwLock::new(HashMap::new()),
                clients_created: AtomicUsize::new(0),
                open_clients: AtomicUsize::new(0),
            }),
        }
    }

    /// All messages of a topic, partition by partition, in offset order.
    pub fn messages(&self, topic: &str) -> Vec<StoredMessage> {
        self.state.read(|topics| {
            topics
                .get(topic)
                .map(|log| log.partitions.iter().flatten().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn partition(&self, topic: &str, partition: u32) -> Vec<StoredMessage> {
        self.state.read(|topics| {
            topics
                .get(topic)
                .and_then(|log| log.partitions.get(partition as usize))
                .cloned()
                .unwrap_or_default()
        })
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read(|topics| topics.keys().cloned().collect());
        names.sort();
        names
    }

    pub fn clients_created(&self) -> usize {
        self.state.clients_created.load(Ordering::SeqCst)
    }

    pub fn open_clients(&self) -> usize {
        self.state.open_clients.load(Ordering::SeqCst)
    }
}

impl ClientFactory for MemoryBroker {
    fn create_client(&self, config: &ConfigValues) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        let seeds = config.get_str_list("seed_brokers").unwrap_or_default();
        if seeds.is_empty() {
            return Err(BrokerError::config("seed_brokers must list at least one broker"));
        }
        let client_id = config.get_str("client_id").unwrap_or("courier").to_string();

        self.state.clients_created.fetch_add(1, Ordering::SeqCst);
        self.state.open_clients.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(client_id = %client_id, seeds = ?seeds, "memory client connected");

        Ok(Arc::new(MemoryClient {
            state: self.state.clone(),
            client_id,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryClient
// ═══════════════════════════════════════════════════════════════

struct MemoryClient {
    state: Arc<BrokerState>,
    client_id: String,
    closed: Arc<AtomicBool>,
}

impl MemoryClient {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::connection(format!("client '{}' is closed", self.client_id)));
        }
        Ok(())
    }
}

impl BrokerClient for MemoryClient {
    fn producer(&self, config: &ConfigValues) -> Result<Box<dyn SyncProducer>, BrokerError> {
        self.check_open()?;
        Ok(Box::new(MemorySyncProducer {
            state: self.state.clone(),
            closed: self.closed.clone(),
            buffer: Vec::new(),
            max_buffer_size: config.get_u64("max_buffer_size").unwrap_or(DEFAULT_MAX_BUFFER_SIZE) as usize,
        }))
    }

    fn async_producer(&self, config: &ConfigValues) -> Result<Arc<dyn AsyncProducer>, BrokerError> {
        self.check_open()?;
        Ok(Arc::new(MemoryAsyncProducer {
            state: self.state.clone(),
            closed: self.closed.clone(),
            queue: Mutex::new(Vec::new()),
            max_queue_size: config.get_u64("max_queue_size").unwrap_or(DEFAULT_MAX_QUEUE_SIZE) as usize,
            delivery_threshold: config.get_u64("delivery_threshold").unwrap_or(0) as usize,
            shut_down: AtomicBool::new(false),
        }))
    }

    fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.open_clients.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(client_id = %self.client_id, "memory client closed");
        }
        Ok(())
    }
}

fn check_connected(closed: &AtomicBool) -> Result<(), BrokerError> {
    if closed.load(Ordering::SeqCst) {
        return Err(BrokerError::connection("client closed before delivery"));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
//  Producers
// ═══════════════════════════════════════════════════════════════

struct MemorySyncProducer {
    state: Arc<BrokerState>,
    closed: Arc<AtomicBool>,
    buffer: Vec<MessageEnvelope>,
    max_buffer_size: usize,
}

impl SyncProducer for MemorySyncProducer {
    fn produce(&mut self, message: &MessageEnvelope) -> Result<(), BrokerError> {
        if self.buffer.len() >= self.max_buffer_size {
            return Err(BrokerError::buffer_overflow(format!(
                "cannot buffer more than {} messages",
                self.max_buffer_size
            )));
        }
        self.buffer.push(message.clone());
        Ok(())
    }

    fn deliver_all(&mut self) -> Result<(), BrokerError> {
        check_connected(&self.closed)?;
        self.state.append(&self.buffer);
        tracing::debug!(messages = self.buffer.len(), "memory producer delivered");
        self.buffer.clear();
        Ok(())
    }
}

struct MemoryAsyncProducer {
    state: Arc<BrokerState>,
    closed: Arc<AtomicBool>,
    queue: Mutex<Vec<MessageEnvelope>>,
    max_queue_size: usize,
    delivery_threshold: usize,
    shut_down: AtomicBool,
}

impl MemoryAsyncProducer {
    fn lock_queue(&self) -> MutexGuard<'_, Vec<MessageEnvelope>> {
        match self.queue.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("async producer queue lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn flush(&self, queue: &mut Vec<MessageEnvelope>) -> Result<(), BrokerError> {
        check_connected(&self.closed)?;
        self.state.append(queue);
        tracing::debug!(messages = queue.len(), "memory async producer delivered");
        queue.clear();
        Ok(())
    }
}

impl AsyncProducer for MemoryAsyncProducer {
    fn produce(&self, message: &MessageEnvelope) -> Result<(), BrokerError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BrokerError::shutdown("async producer is shut down"));
        }
        let mut queue = self.lock_queue();
        if queue.len() >= self.max_queue_size {
            return Err(BrokerError::buffer_overflow(format!(
                "async queue is full ({} messages)",
                self.max_queue_size
            )));
        }
        queue.push(message.clone());
        if self.delivery_threshold > 0 && queue.len() >= self.delivery_threshold {
            self.flush(&mut queue)?;
        }
        Ok(())
    }

    fn deliver_all(&self) -> Result<(), BrokerError> {
        let mut queue = self.lock_queue();
        self.flush(&mut queue)
    }

    fn shutdown(&self) -> Result<(), BrokerError> {
        self.shut_down.store(true, Ordering::SeqCst);
        let mut queue = self.lock_queue();
        if !queue.is_empty() {
            tracing::warn!(dropped = queue.len(), "async producer shut down with undelivered messages");
            queue.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use courier_api::{ErrorKind, ParamValue};

    use super::*;

    fn client_config() -> ConfigValues {
        ConfigValues::new().with("seed_brokers", ParamValue::StrList(vec!["memory:0".into()]))
    }

    fn msg(topic: &str, payload: &'static str, key: Option<&'static str>) -> MessageEnvelope {
        let m = MessageEnvelope::new(topic, payload).unwrap();
        match key {
            Some(k) => m.with_key(k),
            None => m,
        }
    }

    #[test]
    fn create_client_requires_seed_brokers() {
        let broker = MemoryBroker::default();
        let err = broker.create_client(&ConfigValues::new()).err().unwrap();
        assert_eq!(err.kind, ErrorKind::Config);
        assert_eq!(broker.clients_created(), 0);
    }

    #[test]
    fn sync_producer_delivers_in_order_on_deliver_all() {
        let broker = MemoryBroker::default();
        let client = broker.create_client(&client_config()).unwrap();
        let mut producer = client.producer(&ConfigValues::new()).unwrap();

        producer.produce(&msg("orders", "m1", Some("k1"))).unwrap();
        producer.produce(&msg("orders", "m2", None)).unwrap();
        assert!(broker.messages("orders").is_empty());

        producer.deliver_all().unwrap();
        let stored = broker.messages("orders");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].payload, Bytes::from_static(b"m1"));
        assert_eq!(stored[0].key, Some(Bytes::from_static(b"k1")));
        assert_eq!(stored[1].payload, Bytes::from_static(b"m2"));
        assert_eq!((stored[0].offset, stored[1].offset), (0, 1));
    }

    #[test]
    fn same_partition_key_lands_on_same_partition() {
        let broker = MemoryBroker::new(8);
        let client = broker.create_client(&client_config()).unwrap();
        let mut producer = client.producer(&ConfigValues::new()).unwrap();
        for payload in ["a", "b", "c", "d"] {
            let m = MessageEnvelope::new("events", payload).unwrap().with_key("customer-42");
            producer.produce(&m).unwrap();
        }
        producer.deliver_all().unwrap();

        let stored = broker.messages("events");
        assert_eq!(stored.len(), 4);
        assert!(stored.iter().all(|m| m.partition == stored[0].partition));
        let offsets: Vec<u64> = broker
            .partition("events", stored[0].partition)
            .iter()
            .map(|m| m.offset)
            .collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
    }

    #[test]
    fn unkeyed_messages_round_robin() {
        let broker = MemoryBroker::new(2);
        let client = broker.create_client(&client_config()).unwrap();
        let mut producer = client.producer(&ConfigValues::new()).unwrap();
        for _ in 0..4 {
            producer.produce(&msg("events", "x", None)).unwrap();
        }
        producer.deliver_all().unwrap();
        assert_eq!(broker.partition("events", 0).len(), 2);
        assert_eq!(broker.partition("events", 1).len(), 2);
    }

    #[test]
    fn sync_buffer_overflow() {
        let broker = MemoryBroker::default();
        let client = broker.create_client(&client_config()).unwrap();
        let config = ConfigValues::new().with("max_buffer_size", ParamValue::U64(1));
        let mut producer = client.producer(&config).unwrap();

        producer.produce(&msg("t", "m1", None)).unwrap();
        let err = producer.produce(&msg("t", "m2", None)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BufferOverflow);
    }

    #[test]
    fn closed_client_rejects_producers_and_delivery() {
        let broker = MemoryBroker::default();
        let client = broker.create_client(&client_config()).unwrap();
        let mut producer = client.producer(&ConfigValues::new()).unwrap();
        producer.produce(&msg("t", "m", None)).unwrap();
        assert_eq!(broker.open_clients(), 1);

        client.close().unwrap();
        client.close().unwrap();
        assert_eq!(broker.open_clients(), 0);

        assert_eq!(producer.deliver_all().unwrap_err().kind, ErrorKind::Connection);
        assert_eq!(
            client.producer(&ConfigValues::new()).err().unwrap().kind,
            ErrorKind::Connection
        );
    }

    #[test]
    fn async_delivery_threshold_flushes_automatically() {
        let broker = MemoryBroker::default();
        let client = broker.create_client(&client_config()).unwrap();
        let config = ConfigValues::new().with("delivery_threshold", ParamValue::U64(2));
        let producer = client.async_producer(&config).unwrap();

        producer.produce(&msg("t", "m1", None)).unwrap();
        assert!(broker.messages("t").is_empty());
        producer.produce(&msg("t", "m2", None)).unwrap();
        assert_eq!(broker.messages("t").len(), 2);
        producer.produce(&msg("t", "m3", None)).unwrap();
        producer.deliver_all().unwrap();
        assert_eq!(broker.messages("t").len(), 3);
    }

    #[test]
    fn async_queue_overflow_and_shutdown() {
        let broker = MemoryBroker::default();
        let client = broker.create_client(&client_config()).unwrap();
        let config = ConfigValues::new().with("max_queue_size", ParamValue::U64(1));
        let producer = client.async_producer(&config).unwrap();

        producer.produce(&msg("t", "m1", None)).unwrap();
        assert_eq!(
            producer.produce(&msg("t", "m2", None)).unwrap_err().kind,
            ErrorKind::BufferOverflow
        );

        producer.shutdown().unwrap();
        assert!(broker.messages("t").is_empty());
        assert_eq!(
            producer.produce(&msg("t", "m3", None)).unwrap_err().kind,
            ErrorKind::Shutdown
        );
    }
}
