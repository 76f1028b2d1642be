use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    config::BrokerConfig,
    models::{Delivery, MessageProperties, OutgoingMessage},
    traits::{
        Acknowledger, BrokerChannel, ConsumeOptions, DeclareOptions, DeliveryStream, ExchangeKind,
    },
    CourierError, Result,
};
use futures::StreamExt;
use lapin::{
    acker::Acker, options::*, types::FieldTable, BasicProperties, Channel, Connection,
    ConnectionProperties,
};
use tracing::{debug, info};

/// RabbitMQ连接
pub struct RabbitMQConnection {
    connection: Connection,
    url: String,
}

impl RabbitMQConnection {
    /// 建立连接，超过 `connection_timeout_seconds` 视为失败
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let connect = Connection::connect(&config.url, ConnectionProperties::default());
        let connection = tokio::time::timeout(
            Duration::from_secs(config.connection_timeout_seconds),
            connect,
        )
        .await
        .map_err(|_| CourierError::Connection(format!("连接RabbitMQ超时: {}", config.url)))?
        .map_err(|e| CourierError::Connection(format!("连接RabbitMQ失败: {e}")))?;

        info!("成功连接到RabbitMQ: {}", config.url);

        Ok(Self {
            connection,
            url: config.url.clone(),
        })
    }

    /// 创建通道
    pub async fn create_channel(&self) -> Result<RabbitMQChannel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| CourierError::Connection(format!("创建通道失败: {e}")))?;

        debug!("在 {} 上创建了新通道", self.url);
        Ok(RabbitMQChannel::new(channel))
    }

    /// 获取连接状态
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// 关闭连接
    pub async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| CourierError::Connection(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

/// 基于lapin通道的 [`BrokerChannel`] 实现
///
/// lapin的 `Channel` 内部是 `Arc`，可以在分发器和工作任务之间并发使用。
#[derive(Clone)]
pub struct RabbitMQChannel {
    channel: Channel,
}

impl RabbitMQChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn inner(&self) -> &Channel {
        &self.channel
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_headers(properties.headers);
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(content_type.into());
    }
    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(delivery_mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(delivery_mode);
    }
    basic
}

fn from_basic_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        headers: properties.headers().clone().unwrap_or_default(),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str().to_string()),
        priority: *properties.priority(),
        delivery_mode: *properties.delivery_mode(),
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = from_basic_properties(&delivery.properties);
    Delivery::new(
        delivery.delivery_tag,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.redelivered,
        delivery.data,
        properties,
        Arc::new(RabbitMQAcker(delivery.acker)),
    )
}

/// lapin投递的确认器
struct RabbitMQAcker(Acker);

#[async_trait]
impl Acknowledger for RabbitMQAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|e| CourierError::Acknowledge(format!("ack失败: {e}")))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|e| CourierError::Acknowledge(format!("nack失败: {e}")))
    }
}

#[async_trait]
impl BrokerChannel for RabbitMQChannel {
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| CourierError::Consume(format!("在队列 {queue} 上创建消费者失败: {e}")))?;

        debug!("为队列 {} 创建消费者: {}", queue, consumer_tag);

        let queue = queue.to_string();
        Ok(consumer
            .map(move |delivery| {
                delivery.map(from_lapin_delivery).map_err(|e| {
                    CourierError::Connection(format!("队列 {queue} 的投递流出错: {e}"))
                })
            })
            .boxed())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|e| CourierError::Qos(format!("设置prefetch={prefetch_count}失败: {e}")))
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: DeclareOptions,
    ) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| CourierError::Topology(format!("声明交换机 {exchange} 失败: {e}")))?;

        debug!("交换机 {} 声明成功", exchange);
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, options: DeclareOptions) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: false,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| CourierError::Topology(format!("声明队列 {queue} 失败: {e}")))?;

        debug!("队列 {} 声明成功", queue);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                CourierError::Topology(format!(
                    "绑定队列 {queue} 到交换机 {exchange} ({routing_key}) 失败: {e}"
                ))
            })?;

        debug!("队列 {} 已绑定到交换机 {} ({})", queue, exchange, routing_key);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                to_basic_properties(message.properties),
            )
            .await
            .map_err(|e| {
                CourierError::Publish(format!("发布消息到 {exchange}/{routing_key} 失败: {e}"))
            })?;

        // 等待确认
        let confirmation = confirm
            .await
            .map_err(|e| CourierError::Publish(format!("消息发布确认失败: {e}")))?;

        if confirmation.is_nack() {
            return Err(CourierError::Publish(format!(
                "broker拒绝了发往 {exchange}/{routing_key} 的消息"
            )));
        }

        debug!("消息已发布到 {}/{}", exchange, routing_key);
        Ok(())
    }
}
