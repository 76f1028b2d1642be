//! 队列消费引擎：生命周期控制、投递分发、重试与死信路由

pub mod consumer;
mod dispatcher;
pub mod dlq;
pub mod error_slot;
pub mod processor;
pub mod stats;

pub use consumer::{Consumer, ConsumerState};
pub use dlq::setup_dlq_topology;
pub use error_slot::ConsumerErrors;
pub use processor::{FailurePolicy, MessageProcessor, ProcessOutcome};
pub use stats::{ConsumerStats, ConsumerStatsSnapshot};
