pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;

pub use broker::{AsyncProducer, BrokerClient, ClientFactory, SyncProducer};
pub use config::{ConfigParam, ConfigValues, ParamType, ParamValue};
pub use envelope::MessageEnvelope;
pub use error::{BrokerError, ErrorKind};
