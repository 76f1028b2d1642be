use thiserror::Error;

/// 消费者错误类型定义
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("消费者已在运行")]
    AlreadyRunning,

    #[error("投递流已意外关闭: {queue}")]
    StreamClosed { queue: String },

    #[error("连接错误: {0}")]
    Connection(String),

    #[error("注册消费者失败: {0}")]
    Consume(String),

    #[error("设置QoS失败: {0}")]
    Qos(String),

    #[error("声明拓扑失败: {0}")]
    Topology(String),

    #[error("发布消息失败: {0}")]
    Publish(String),

    #[error("确认消息失败: {0}")]
    Acknowledge(String),
}

impl CourierError {
    /// 是否为设置阶段的错误（同步返回给调用方）
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            CourierError::Connection(_)
                | CourierError::Consume(_)
                | CourierError::Qos(_)
                | CourierError::Topology(_)
        )
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, CourierError>;
