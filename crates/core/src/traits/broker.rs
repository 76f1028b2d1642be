use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::models::{Delivery, OutgoingMessage};
use crate::Result;

/// 投递流：broker端关闭时流结束，流中的错误表示通道已不可用
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// 注册消费者的选项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
}

/// 交换机类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// 声明交换机/队列的选项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclareOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for DeclareOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// broker通道抽象接口
///
/// 分发器和所有工作任务共享同一个通道对象，实现必须支持并发的发布和声明调用。
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// 在指定队列上注册消费者，返回投递流
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream>;

    /// 设置预取数量
    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    /// 声明交换机
    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: DeclareOptions,
    ) -> Result<()>;

    /// 声明队列
    async fn declare_queue(&self, queue: &str, options: DeclareOptions) -> Result<()>;

    /// 绑定队列到交换机
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// 发布消息，空交换机名表示默认交换机（路由键即队列名）
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()>;
}

/// 单条投递的确认能力
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}
