//! 单条投递的处理：调用处理器，然后确认、重新入队、带退避重新发布或转入死信队列

use std::sync::Arc;

use chrono::Utc;
use courier_core::{
    config::ConsumerConfig,
    models::{headers, Delivery, MessageProperties, OutgoingMessage},
    traits::{BrokerChannel, MessageHandler},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::stats::ConsumerStats;

/// 处理失败时的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// 直接 nack 并重新入队
    Requeue,
    /// 按死信配置重试，耗尽后转入死信队列
    RetryThenDeadLetter,
}

/// 一次投递的最终处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// 自动确认模式，broker已确认，不做任何操作
    AutoAcked,
    Acked,
    /// nack 并重新入队（包括发布失败和退避期间被取消）
    Requeued,
    /// 已带上新的重试次数重新发布到原队列，原消息已确认
    Retried { retry_count: u32 },
    /// 已发布到死信队列，原消息已确认
    DeadLettered { retry_count: u32 },
}

impl ProcessOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::AutoAcked => "auto_acked",
            ProcessOutcome::Acked => "acked",
            ProcessOutcome::Requeued => "requeued",
            ProcessOutcome::Retried { .. } => "retried",
            ProcessOutcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// 消息处理器，由分发器在每条投递上调用
pub struct MessageProcessor {
    channel: Arc<dyn BrokerChannel>,
    config: Arc<ConsumerConfig>,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    policy: FailurePolicy,
    stats: Arc<ConsumerStats>,
}

impl MessageProcessor {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        config: Arc<ConsumerConfig>,
        queue: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        policy: FailurePolicy,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        Self {
            channel,
            config,
            queue: queue.into(),
            handler,
            policy,
            stats,
        }
    }

    pub fn auto_ack(&self) -> bool {
        self.config.auto_ack
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// 处理一条投递
    ///
    /// 不返回错误：所有失败都在内部记录日志，并落到某个确认/拒绝动作上。
    pub async fn process(&self, ctx: &CancellationToken, delivery: Delivery) -> ProcessOutcome {
        self.stats.record_received();
        let retry_count = headers::retry_count(delivery.headers());

        let result = self.handler.handle(ctx, &delivery.body).await;

        let outcome = if self.config.auto_ack {
            if let Err(e) = &result {
                self.stats.record_handler_failure();
                warn!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "消息处理失败（自动确认模式，消息已被broker确认）"
                );
            }
            ProcessOutcome::AutoAcked
        } else {
            match result {
                Ok(()) => {
                    self.ack(&delivery).await;
                    ProcessOutcome::Acked
                }
                Err(e) => {
                    self.stats.record_handler_failure();
                    warn!(
                        queue = %self.queue,
                        delivery_tag = delivery.delivery_tag,
                        retry_count,
                        error = %e,
                        "消息处理失败"
                    );
                    self.handle_failure(ctx, &delivery, retry_count).await
                }
            }
        };

        self.record(outcome);
        outcome
    }

    async fn handle_failure(
        &self,
        ctx: &CancellationToken,
        delivery: &Delivery,
        retry_count: u32,
    ) -> ProcessOutcome {
        let dlq = &self.config.dlq;
        if self.policy == FailurePolicy::Requeue || !dlq.enabled {
            self.nack_requeue(delivery).await;
            return ProcessOutcome::Requeued;
        }

        if retry_count >= dlq.max_retries {
            return self.dead_letter(delivery, retry_count).await;
        }

        self.retry(ctx, delivery, retry_count).await
    }

    async fn retry(
        &self,
        ctx: &CancellationToken,
        delivery: &Delivery,
        retry_count: u32,
    ) -> ProcessOutcome {
        let delay = self.config.dlq.calculate_backoff(retry_count);
        debug!(
            queue = %self.queue,
            delivery_tag = delivery.delivery_tag,
            retry_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "等待退避后重试"
        );

        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                info!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    "退避等待期间上下文被取消，消息重新入队"
                );
                self.nack_requeue(delivery).await;
                return ProcessOutcome::Requeued;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let next_retry = retry_count.saturating_add(1);
        let properties = MessageProperties {
            headers: headers::with_retry_count(delivery.headers(), next_retry),
            ..delivery.properties.clone()
        };
        let message = OutgoingMessage::new(delivery.body.clone()).with_properties(properties);

        match self.channel.publish("", &self.queue, message).await {
            Ok(()) => {
                self.ack(delivery).await;
                info!(
                    queue = %self.queue,
                    retry_count = next_retry,
                    "消息已重新发布等待重试"
                );
                ProcessOutcome::Retried {
                    retry_count: next_retry,
                }
            }
            Err(e) => {
                error!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "重新发布消息失败，重新入队"
                );
                self.nack_requeue(delivery).await;
                ProcessOutcome::Requeued
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, retry_count: u32) -> ProcessOutcome {
        let dlq = &self.config.dlq;
        let properties = MessageProperties {
            headers: headers::dead_letter_headers(
                delivery.headers(),
                &delivery.exchange,
                &delivery.routing_key,
                Utc::now().timestamp(),
                retry_count,
            ),
            ..delivery.properties.clone()
        }
        .persistent();
        let message = OutgoingMessage::new(delivery.body.clone()).with_properties(properties);

        match self
            .channel
            .publish(&dlq.exchange, &dlq.routing_key, message)
            .await
        {
            Ok(()) => {
                self.ack(delivery).await;
                warn!(
                    queue = %self.queue,
                    dlq_exchange = %dlq.exchange,
                    dlq_routing_key = %dlq.routing_key,
                    retry_count,
                    "重试次数耗尽，消息已转入死信队列"
                );
                ProcessOutcome::DeadLettered { retry_count }
            }
            Err(e) => {
                self.stats.record_dlq_publish_failure();
                metrics::counter!("courier_dlq_publish_failures_total", "queue" => self.queue.clone())
                    .increment(1);
                error!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "发布到死信队列失败，消息重新入队"
                );
                self.nack_requeue(delivery).await;
                ProcessOutcome::Requeued
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = delivery.ack().await {
            self.stats.record_ack_failure();
            warn!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "确认消息失败"
            );
        }
    }

    async fn nack_requeue(&self, delivery: &Delivery) {
        if let Err(e) = delivery.nack(true).await {
            self.stats.record_ack_failure();
            warn!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "拒绝消息失败"
            );
        }
    }

    fn record(&self, outcome: ProcessOutcome) {
        self.stats.record_outcome(outcome);
        metrics::counter!(
            "courier_messages_total",
            "queue" => self.queue.clone(),
            "outcome" => outcome.label()
        )
        .increment(1);
    }
}
