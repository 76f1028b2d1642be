use std::fmt;
use std::sync::Arc;

use lapin::types::FieldTable;

use crate::traits::Acknowledger;
use crate::Result;

/// 持久化投递模式（AMQP delivery-mode = 2）
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// 消息属性
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub headers: FieldTable,
    pub content_type: Option<String>,
    pub priority: Option<u8>,
    pub delivery_mode: Option<u8>,
}

impl MessageProperties {
    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.delivery_mode = Some(PERSISTENT_DELIVERY_MODE);
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(PERSISTENT_DELIVERY_MODE)
    }
}

/// 从broker收到的一次投递
///
/// 消息体和属性视为不可变输入；确认/拒绝通过内部的 [`Acknowledger`] 转发给broker。
/// 重复确认的幂等性由broker保证，这里不做去重。
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        body: Vec<u8>,
        properties: MessageProperties,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            body,
            properties,
            acker,
        }
    }

    /// 确认单条消息（multiple = false）
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// 拒绝单条消息
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    pub fn headers(&self) -> &FieldTable {
        &self.properties.headers
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .finish()
    }
}

/// 待发布的消息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}
