pub mod in_memory_broker;
pub mod rabbitmq;

pub use in_memory_broker::{BrokerStats, InMemoryBroker, PublishRecord, StoredMessage};
pub use rabbitmq::{RabbitMQChannel, RabbitMQConnection};
