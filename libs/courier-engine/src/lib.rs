pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod registry;

pub use config::{CourierConfig, ProducerSettings};
pub use context::ContextId;
pub use error::ProducerError;
pub use facade::{ContextProducer, ProducerFacade};
pub use registry::{AsyncProducerState, ClientLease, ClientOrigin, ContextRegistry};
