//! 死信拓扑

use courier_core::{
    config::DlqConfig,
    traits::{BrokerChannel, DeclareOptions, ExchangeKind},
    Result,
};
use tracing::info;

/// 声明死信交换机（direct、持久化）和以路由键命名的死信队列，并完成绑定
///
/// 三个操作都是幂等的，可以在每次启动时调用。
pub async fn setup_dlq_topology(channel: &dyn BrokerChannel, dlq: &DlqConfig) -> Result<()> {
    let durable = DeclareOptions {
        durable: true,
        auto_delete: false,
    };

    channel
        .declare_exchange(&dlq.exchange, ExchangeKind::Direct, durable)
        .await?;
    channel.declare_queue(&dlq.routing_key, durable).await?;
    channel
        .bind_queue(&dlq.routing_key, &dlq.exchange, &dlq.routing_key)
        .await?;

    info!(
        exchange = %dlq.exchange,
        queue = %dlq.routing_key,
        "死信拓扑已就绪"
    );
    Ok(())
}
