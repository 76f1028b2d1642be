pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::{AppConfig, BrokerConfig, ConsumerConfig, DlqConfig, ObservabilityConfig};
pub use errors::*;
pub use models::{Delivery, MessageProperties, OutgoingMessage};
pub use traits::{
    handler_fn, Acknowledger, BrokerChannel, ConsumeOptions, DeclareOptions, DeliveryStream,
    ExchangeKind, MessageHandler,
};
