#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    config::{ConsumerConfig, DlqConfig},
    models::{MessageProperties, OutgoingMessage},
    traits::{
        handler_fn, BrokerChannel, ConsumeOptions, DeclareOptions, DeliveryStream, ExchangeKind,
        MessageHandler,
    },
    Result,
};
use courier_infrastructure::InMemoryBroker;
use lapin::types::FieldTable;

pub const QUEUE: &str = "orders";
pub const DLX: &str = "orders.dlx";
pub const DLQ: &str = "orders.dlq";

pub async fn broker_with_queue() -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker
        .declare_queue(QUEUE, DeclareOptions::default())
        .await
        .unwrap();
    broker
}

pub async fn publish(broker: &InMemoryBroker, body: &str) {
    publish_with(broker, body, MessageProperties::default()).await;
}

pub async fn publish_with(broker: &InMemoryBroker, body: &str, properties: MessageProperties) {
    broker
        .publish(
            "",
            QUEUE,
            OutgoingMessage::new(body.as_bytes().to_vec()).with_properties(properties),
        )
        .await
        .unwrap();
}

pub fn header_table(entries: Vec<(&str, lapin::types::AMQPValue)>) -> FieldTable {
    courier_core::models::headers::field_table(entries)
}

pub fn dlq_config(max_retries: u32) -> ConsumerConfig {
    ConsumerConfig {
        name: "test-consumer".into(),
        prefetch_count: 4,
        dlq: DlqConfig {
            enabled: true,
            max_retries,
            retry_delay_ms: 10,
            exchange: DLX.into(),
            routing_key: DLQ.into(),
            use_exponential_backoff: false,
        },
        ..Default::default()
    }
}

/// 统计调用次数；前 `failures` 次调用返回错误
pub fn failing_handler(calls: Arc<AtomicUsize>, failures: usize) -> Arc<dyn MessageHandler> {
    Arc::new(handler_fn(move |_ctx, _body| {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(anyhow::anyhow!("attempt {n} failed"))
            } else {
                Ok(())
            }
        }
    }))
}

pub fn always_failing_handler(calls: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
    failing_handler(calls, usize::MAX)
}

/// 轮询直到条件成立，超时则失败
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// 忽略QoS的通道：broker一次推送全部投递，并发上限只能来自消费者自身
#[derive(Clone)]
pub struct UnthrottledChannel(pub InMemoryBroker);

#[async_trait]
impl BrokerChannel for UnthrottledChannel {
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        self.0.consume(queue, consumer_tag, options).await
    }

    async fn qos(&self, _prefetch_count: u16) -> Result<()> {
        Ok(())
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: DeclareOptions,
    ) -> Result<()> {
        self.0.declare_exchange(exchange, kind, options).await
    }

    async fn declare_queue(&self, queue: &str, options: DeclareOptions) -> Result<()> {
        self.0.declare_queue(queue, options).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.0.bind_queue(queue, exchange, routing_key).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()> {
        self.0.publish(exchange, routing_key, message).await
    }
}

