use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::processor::ProcessOutcome;

/// 消费者运行统计
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    acked: AtomicU64,
    auto_acked: AtomicU64,
    requeued: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    handler_failures: AtomicU64,
    ack_failures: AtomicU64,
    dlq_publish_failures: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub auto_acked: u64,
    pub requeued: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub handler_failures: u64,
    pub ack_failures: u64,
    pub dlq_publish_failures: u64,
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack_failure(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dlq_publish_failure(&self) {
        self.dlq_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, outcome: ProcessOutcome) {
        let counter = match outcome {
            ProcessOutcome::AutoAcked => &self.auto_acked,
            ProcessOutcome::Acked => &self.acked,
            ProcessOutcome::Requeued => &self.requeued,
            ProcessOutcome::Retried { .. } => &self.retried,
            ProcessOutcome::DeadLettered { .. } => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            auto_acked: self.auto_acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            dlq_publish_failures: self.dlq_publish_failures.load(Ordering::Relaxed),
        }
    }
}
