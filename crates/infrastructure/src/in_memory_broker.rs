use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use courier_core::{
    models::{Delivery, MessageProperties, OutgoingMessage},
    traits::{
        Acknowledger, BrokerChannel, ConsumeOptions, DeclareOptions, DeliveryStream, ExchangeKind,
    },
    CourierError, Result,
};
use futures::channel::mpsc;
use futures::StreamExt;
use tracing::{debug, info, warn};

/// 内存broker实现
///
/// 按AMQP 0-9-1的语义模拟一个通道：交换机（direct/fanout/topic）、队列、绑定、
/// 默认交换机、预取上限、ack/nack/requeue。适用于嵌入式部署和测试，
/// 另外提供故障注入和状态查询接口。
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

/// 队列中的一条消息
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

/// 一次发布记录
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutgoingMessage,
}

/// broker计数统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub requeued: u64,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: HashSet<Binding>,
    unacked: HashMap<u64, Unacked>,
    next_delivery_tag: u64,
    prefetch: Option<u16>,
    failing_exchanges: HashSet<String>,
    fail_declarations: bool,
    publish_log: Vec<PublishRecord>,
    stats: BrokerStats,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
    durable: bool,
}

struct ConsumerEntry {
    tag: String,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
    auto_ack: bool,
    exclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        info!("Creating in-memory broker");
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.state)
    }

    /// 队列中待投递的消息数量
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// 查看队列中待投递的消息（不出队）
    pub fn peek_messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 已投递但未确认的消息数量
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.lock().prefetch
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats
    }

    /// 所有成功发布的记录
    pub fn published(&self) -> Vec<PublishRecord> {
        self.lock().publish_log.clone()
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn is_durable(&self, queue: &str) -> bool {
        self.lock().queues.get(queue).is_some_and(|q| q.durable)
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock().bindings.contains(&Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        })
    }

    /// 让发往指定交换机的发布失败（空字符串表示默认交换机）
    pub fn fail_publishes_to(&self, exchange: &str) {
        self.lock().failing_exchanges.insert(exchange.to_string());
    }

    pub fn restore_publishes_to(&self, exchange: &str) {
        self.lock().failing_exchanges.remove(exchange);
    }

    /// 让所有声明/绑定操作失败
    pub fn set_fail_declarations(&self, fail: bool) {
        self.lock().fail_declarations = fail;
    }

    /// 模拟broker端关闭队列上的所有消费者：投递流随之结束
    pub fn close_consumers(&self, queue: &str) {
        let mut state = self.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            let closed = q.consumers.len();
            for consumer in q.consumers.drain(..) {
                consumer.sender.close_channel();
            }
            warn!("Closed {} consumer(s) on queue '{}'", closed, queue);
        }
    }

    fn check_declarations(state: &BrokerState) -> Result<()> {
        if state.fail_declarations {
            return Err(CourierError::Topology(
                "injected declaration failure".to_string(),
            ));
        }
        Ok(())
    }
}

fn lock_state(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unknown_tag(delivery_tag: u64) -> CourierError {
    CourierError::Acknowledge(format!(
        "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
    ))
}

impl BrokerState {
    fn ack(&mut self, delivery_tag: u64, handle: &Arc<Mutex<BrokerState>>) -> Result<()> {
        let unacked = self
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| unknown_tag(delivery_tag))?;
        self.stats.acked += 1;
        self.dispatch(&unacked.queue, handle);
        Ok(())
    }

    fn nack(
        &mut self,
        delivery_tag: u64,
        requeue: bool,
        handle: &Arc<Mutex<BrokerState>>,
    ) -> Result<()> {
        let Unacked { queue, mut message } = self
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| unknown_tag(delivery_tag))?;
        self.stats.nacked += 1;

        if requeue {
            if let Some(q) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                q.ready.push_front(message);
                self.stats.requeued += 1;
            }
        }

        self.dispatch(&queue, handle);
        Ok(())
    }

    /// 把就绪消息推送给消费者，受预取上限约束
    fn dispatch(&mut self, queue_name: &str, handle: &Arc<Mutex<BrokerState>>) {
        loop {
            if let Some(prefetch) = self.prefetch {
                if prefetch > 0 && self.unacked.len() >= usize::from(prefetch) {
                    return;
                }
            }

            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.consumers.is_empty() {
                return;
            }
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            let index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let auto_ack = queue.consumers[index].auto_ack;

            let delivery = Delivery::new(
                delivery_tag,
                message.exchange.clone(),
                message.routing_key.clone(),
                message.redelivered,
                message.body.clone(),
                message.properties.clone(),
                Arc::new(InMemoryAcker {
                    state: Arc::downgrade(handle),
                    delivery_tag,
                }),
            );

            if queue.consumers[index].sender.unbounded_send(Ok(delivery)).is_err() {
                let dropped = queue.consumers.remove(index);
                debug!("Consumer '{}' dropped its stream, removing", dropped.tag);
                queue.ready.push_front(message);
                continue;
            }

            if !auto_ack {
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        message,
                    },
                );
            }
            self.stats.delivered += 1;
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let kind = self.exchanges.get(exchange).ok_or_else(|| {
            CourierError::Publish(format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|binding| binding.exchange == exchange)
            .filter(|binding| match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Headers => false,
            })
            .map(|binding| binding.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();
        Ok(targets)
    }
}

/// topic交换机的路由匹配：`*` 匹配一个单词，`#` 匹配零个或多个单词
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

struct InMemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    delivery_tag: u64,
}

impl InMemoryAcker {
    fn state(&self) -> Result<Arc<Mutex<BrokerState>>> {
        self.state
            .upgrade()
            .ok_or_else(|| CourierError::Acknowledge("in-memory broker has been dropped".to_string()))
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> Result<()> {
        let handle = self.state()?;
        let mut state = lock_state(&handle);
        state.ack(self.delivery_tag, &handle)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let handle = self.state()?;
        let mut state = lock_state(&handle);
        state.nack(self.delivery_tag, requeue, &handle)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let (sender, receiver) = mpsc::unbounded();

        {
            let mut state = self.lock();
            let q = state.queues.get_mut(queue).ok_or_else(|| {
                CourierError::Consume(format!("NOT_FOUND - no queue '{queue}'"))
            })?;

            if q.consumers.iter().any(|c| c.exclusive)
                || (options.exclusive && !q.consumers.is_empty())
            {
                return Err(CourierError::Consume(format!(
                    "ACCESS_REFUSED - queue '{queue}' has an exclusive consumer conflict"
                )));
            }

            q.consumers.push(ConsumerEntry {
                tag: consumer_tag.to_string(),
                sender,
                auto_ack: options.auto_ack,
                exclusive: options.exclusive,
            });
            state.dispatch(queue, &self.state);
        }

        debug!("Registered consumer '{}' on queue '{}'", consumer_tag, queue);
        Ok(receiver.boxed())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.lock().prefetch = Some(prefetch_count);
        debug!("Set prefetch to {}", prefetch_count);
        Ok(())
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        _options: DeclareOptions,
    ) -> Result<()> {
        let mut state = self.lock();
        Self::check_declarations(&state)?;

        if kind == ExchangeKind::Headers {
            return Err(CourierError::Topology(
                "headers exchanges are not supported by the in-memory broker".to_string(),
            ));
        }

        match state.exchanges.get(exchange) {
            Some(existing) if *existing != kind => Err(CourierError::Topology(format!(
                "PRECONDITION_FAILED - exchange '{exchange}' redeclared with a different type"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.to_string(), kind);
                debug!("Declared exchange '{}' ({:?})", exchange, kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &str, options: DeclareOptions) -> Result<()> {
        let mut state = self.lock();
        Self::check_declarations(&state)?;

        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| {
                debug!("Declared queue '{}' (durable: {})", queue, options.durable);
                QueueState {
                    durable: options.durable,
                    ..Default::default()
                }
            });
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_declarations(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(CourierError::Topology(format!("NOT_FOUND - no queue '{queue}'")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(CourierError::Topology(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }

        state.bindings.insert(Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()> {
        let mut state = self.lock();

        if state.failing_exchanges.contains(exchange) {
            return Err(CourierError::Publish(format!(
                "injected publish failure for exchange '{exchange}'"
            )));
        }

        let targets = state.route(exchange, routing_key)?;
        if targets.is_empty() {
            warn!(
                "Message published to '{}' with key '{}' was unroutable",
                exchange, routing_key
            );
        }

        for target in &targets {
            if let Some(q) = state.queues.get_mut(target) {
                q.ready.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: message.body.clone(),
                    properties: message.properties.clone(),
                    redelivered: false,
                });
            }
        }

        state.stats.published += 1;
        state.publish_log.push(PublishRecord {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
        });

        for target in &targets {
            state.dispatch(target, &self.state);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn broker_with_queue(queue: &str) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(queue, DeclareOptions::default())
            .await
            .unwrap();
        broker
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("invoices.*", "orders.created"));
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = broker_with_queue("orders").await;

        broker
            .publish("", "orders", OutgoingMessage::new(b"one".to_vec()))
            .await
            .unwrap();
        broker
            .publish("", "missing", OutgoingMessage::new(b"two".to_vec()))
            .await
            .unwrap();

        assert_eq!(broker.queue_len("orders"), 1);
        assert_eq!(broker.peek_messages("orders")[0].body, b"one");
        assert_eq!(broker.stats().published, 2);
    }

    #[tokio::test]
    async fn test_consume_unknown_queue_fails() {
        let broker = InMemoryBroker::new();
        let result = broker
            .consume("missing", "c1", ConsumeOptions::default())
            .await;
        assert!(matches!(result, Err(CourierError::Consume(_))));
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let broker = broker_with_queue("orders").await;
        let mut stream = broker
            .consume("orders", "c1", ConsumeOptions::default())
            .await
            .unwrap();

        broker
            .publish("", "orders", OutgoingMessage::new(b"payload".to_vec()))
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.body, b"payload");
        second.ack().await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let broker = broker_with_queue("orders").await;
        let mut stream = broker
            .consume("orders", "c1", ConsumeOptions::default())
            .await
            .unwrap();
        broker
            .publish("", "orders", OutgoingMessage::new(b"x".to_vec()))
            .await
            .unwrap();

        let delivery = stream.next().await.unwrap().unwrap();
        delivery.ack().await.unwrap();
        assert!(matches!(
            delivery.ack().await,
            Err(CourierError::Acknowledge(_))
        ));
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked() {
        let broker = broker_with_queue("orders").await;
        broker.qos(2).await.unwrap();
        let mut stream = broker
            .consume("orders", "c1", ConsumeOptions::default())
            .await
            .unwrap();

        for i in 0..5u8 {
            broker
                .publish("", "orders", OutgoingMessage::new(vec![i]))
                .await
                .unwrap();
        }

        assert_eq!(broker.unacked_count(), 2);
        assert_eq!(broker.queue_len("orders"), 3);

        let first = stream.next().await.unwrap().unwrap();
        first.ack().await.unwrap();
        assert_eq!(broker.unacked_count(), 2);
        assert_eq!(broker.queue_len("orders"), 2);
    }

    #[tokio::test]
    async fn test_direct_exchange_binding() {
        let broker = broker_with_queue("dlq").await;
        broker
            .declare_exchange("dlx", ExchangeKind::Direct, DeclareOptions::default())
            .await
            .unwrap();
        broker.bind_queue("dlq", "dlx", "dlq").await.unwrap();

        broker
            .publish("dlx", "dlq", OutgoingMessage::new(b"dead".to_vec()))
            .await
            .unwrap();
        broker
            .publish("dlx", "other", OutgoingMessage::new(b"lost".to_vec()))
            .await
            .unwrap();

        assert_eq!(broker.queue_len("dlq"), 1);
        assert!(broker.has_binding("dlq", "dlx", "dlq"));
    }

    #[tokio::test]
    async fn test_exchange_redeclare_with_other_kind_fails() {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange("dlx", ExchangeKind::Direct, DeclareOptions::default())
            .await
            .unwrap();
        broker
            .declare_exchange("dlx", ExchangeKind::Direct, DeclareOptions::default())
            .await
            .unwrap();
        assert!(broker
            .declare_exchange("dlx", ExchangeKind::Fanout, DeclareOptions::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_consumers_ends_stream() {
        let broker = broker_with_queue("orders").await;
        let mut stream = broker
            .consume("orders", "c1", ConsumeOptions::default())
            .await
            .unwrap();

        broker.close_consumers("orders");
        assert!(stream.next().await.is_none());
        assert_eq!(broker.consumer_count("orders"), 0);
    }

    #[tokio::test]
    async fn test_exclusive_consumer_conflict() {
        let broker = broker_with_queue("orders").await;
        let _stream = broker
            .consume(
                "orders",
                "c1",
                ConsumeOptions {
                    exclusive: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let second = broker
            .consume("orders", "c2", ConsumeOptions::default())
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let broker = broker_with_queue("orders").await;
        broker.fail_publishes_to("");
        assert!(broker
            .publish("", "orders", OutgoingMessage::new(b"x".to_vec()))
            .await
            .is_err());

        broker.restore_publishes_to("");
        assert!(broker
            .publish("", "orders", OutgoingMessage::new(b"x".to_vec()))
            .await
            .is_ok());
        assert_eq!(broker.queue_len("orders"), 1);
    }
}
