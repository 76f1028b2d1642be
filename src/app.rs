use std::sync::Arc;

use anyhow::{Context, Result};
use courier_consumer::Consumer;
use courier_core::{
    traits::{handler_fn, BrokerChannel, DeclareOptions, MessageHandler},
    AppConfig,
};
use courier_infrastructure::RabbitMQConnection;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 主应用程序：一个连接、一个通道、一个消费者
pub struct Application {
    config: AppConfig,
    connection: RabbitMQConnection,
    consumer: Consumer,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序，队列: {}", config.broker.queue);

        let connection = RabbitMQConnection::connect(&config.broker)
            .await
            .context("连接RabbitMQ失败")?;
        let channel = connection
            .create_channel()
            .await
            .context("创建RabbitMQ通道失败")?;

        if config.broker.declare_queue {
            channel
                .declare_queue(&config.broker.queue, DeclareOptions::default())
                .await
                .with_context(|| format!("声明队列失败: {}", config.broker.queue))?;
        }

        let consumer = Consumer::new(Arc::new(channel), config.consumer.clone());

        Ok(Self {
            config,
            connection,
            consumer,
        })
    }

    /// 开始消费并阻塞到消费会话结束
    ///
    /// `shutdown` 取消后分发器退出，等待处理中的消息完成后返回。
    /// 投递流意外关闭时返回错误。
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let queue = &self.config.broker.queue;
        let handler = log_handler();

        if self.config.consumer.dlq.enabled {
            self.consumer
                .consume_with_dlq(shutdown, queue, handler)
                .await
                .context("启动消费者失败")?;
        } else {
            self.consumer
                .consume(shutdown, queue, handler)
                .await
                .context("启动消费者失败")?;
        }

        let result = self.consumer.wait().await;

        match serde_json::to_string(&self.consumer.stats()) {
            Ok(stats) => info!(stats = %stats, "消费会话结束"),
            Err(e) => error!("序列化统计信息失败: {e}"),
        }

        result.context("消费会话异常结束")
    }

    /// 关闭消费者和连接
    pub async fn close(&self) {
        if let Err(e) = self.consumer.close().await {
            error!("关闭消费者失败: {e}");
        }

        if self.connection.is_connected() {
            if let Err(e) = self.connection.close().await {
                error!("关闭RabbitMQ连接失败: {e}");
            }
        }
    }
}

/// 默认处理器：JSON消息格式化输出，其他内容按UTF-8输出
fn log_handler() -> Arc<dyn MessageHandler> {
    Arc::new(handler_fn(|_ctx, body: Vec<u8>| async move {
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(value) => {
                let pretty = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
                info!(message = %pretty, "收到消息");
            }
            Err(_) => info!(message = %String::from_utf8_lossy(&body), "收到消息"),
        }
        Ok(())
    }))
}
