use clap::{Args, Parser, Subcommand};

use broker_memory::MemoryBroker;
use courier_engine::{CourierConfig, ProducerFacade};

use crate::error::CliError;

#[derive(Parser)]
#[command(name = "courier", about = "Publish messages through the courier producer façade")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Publish payloads to one topic in a single synchronous batch
    Publish(PublishArgs),
    /// Publish messages read from a JSON-lines file
    Replay(ReplayArgs),
    /// Publish from several concurrent workers, each with its own context
    Bench(BenchArgs),
}

#[derive(Args, Clone, Debug)]
pub struct BrokerArgs {
    /// Path to TOML configuration file ([client] and [producer] tables).
    /// Built-in defaults are used when absent.
    #[arg(long, env = "COURIER_CONFIG")]
    pub config: Option<String>,

    /// Partitions per topic of the in-memory broker.
    #[arg(long, default_value_t = 1)]
    pub partitions: u32,
}

#[derive(Args, Clone, Debug)]
pub struct PublishArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    #[arg(long)]
    pub topic: String,

    /// Message key; also used as partition key.
    #[arg(long)]
    pub key: Option<String>,

    /// Payloads, one message each.
    #[arg(required = true)]
    pub payloads: Vec<String>,
}

#[derive(Args, Clone, Debug)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// JSON-lines file: {"topic": "...", "payload": "...", "key": "...", "partition_key": "..."}
    #[arg(long)]
    pub input: String,

    /// Messages per publish call.
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    /// Publish through a long-lived async producer instead of one-shot batches.
    #[arg(long = "async")]
    pub use_async: bool,
}

#[derive(Args, Clone, Debug)]
pub struct BenchArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    #[arg(long, default_value = "bench")]
    pub topic: String,

    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Messages published by each worker.
    #[arg(long, default_value_t = 1000)]
    pub messages: usize,

    /// Messages per publish call.
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    /// Publish through per-worker async producers.
    #[arg(long = "async")]
    pub use_async: bool,
}

impl BrokerArgs {
    /// Load configuration and wire the façade to an in-memory broker.
    pub fn connect(&self) -> Result<(MemoryBroker, ProducerFacade), CliError> {
        let config = match &self.config {
            Some(path) => {
                tracing::info!(config = %path, "loading configuration");
                CourierConfig::load(path)?
            }
            None => CourierConfig::default(),
        };
        let broker = MemoryBroker::new(self.partitions);
        let facade = ProducerFacade::new(std::sync::Arc::new(broker.clone()), config);
        Ok((broker, facade))
    }
}

/// Log what the broker holds, topic by topic.
pub fn report(broker: &MemoryBroker) {
    for topic in broker.topics() {
        tracing::info!(topic = %topic, messages = broker.messages(&topic).len(), "delivered");
    }
    tracing::info!(
        clients_created = broker.clients_created(),
        open_clients = broker.open_clients(),
        "broker summary"
    );
}
