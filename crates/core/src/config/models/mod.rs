pub mod app_config;
pub mod broker;
pub mod consumer;
pub mod observability;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use broker::BrokerConfig;
pub use consumer::{ConsumerConfig, DlqConfig, DEFAULT_PREFETCH_COUNT};
pub use observability::ObservabilityConfig;
