use std::sync::Arc;

use courier_core::{models::Delivery, traits::DeliveryStream, CourierError};
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error_slot::ErrorSlot;
use crate::processor::MessageProcessor;

/// 投递的执行方式
pub(crate) enum DispatchMode {
    /// 在分发任务内逐条同步处理
    Inline,
    /// 每条投递一个工作任务，并发数受信号量约束
    Concurrent(Arc<Semaphore>),
}

/// 单个消费会话的分发任务
///
/// 投递流不放在这里：`run` 持有流的所有权，工作任务派生期间只借用其余字段。
pub(crate) struct DeliveryDispatcher {
    pub(crate) processor: Arc<MessageProcessor>,
    pub(crate) mode: DispatchMode,
    pub(crate) ctx: CancellationToken,
    pub(crate) stop: CancellationToken,
    pub(crate) errors: ErrorSlot,
    pub(crate) tracker: TaskTracker,
}

impl DeliveryDispatcher {
    pub(crate) async fn run(self, mut stream: DeliveryStream) {
        let queue = self.processor.queue().to_string();
        info!(queue = %queue, "分发器启动");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => {
                    info!(queue = %queue, "上下文已取消，分发器退出");
                    return;
                }
                _ = self.stop.cancelled() => {
                    info!(queue = %queue, "收到停止信号，分发器退出");
                    return;
                }
                next = stream.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(queue = %queue, error = %e, "投递流出错，分发器退出");
                    self.errors.report(CourierError::StreamClosed { queue });
                    return;
                }
                None => {
                    error!(queue = %queue, "投递流已意外关闭，分发器退出");
                    self.errors.report(CourierError::StreamClosed { queue });
                    return;
                }
            };

            debug!(
                queue = %queue,
                delivery_tag = delivery.delivery_tag,
                redelivered = delivery.redelivered,
                "收到投递"
            );

            match &self.mode {
                DispatchMode::Inline => {
                    self.processor.process(&self.ctx, delivery).await;
                }
                DispatchMode::Concurrent(semaphore) => {
                    if let Err(delivery) = self.spawn_worker(semaphore, delivery).await {
                        // 先取消订阅，交还的投递不会再推给本消费者
                        drop(stream);
                        self.give_back(delivery).await;
                        return;
                    }
                }
            }
        }
    }

    /// 等待空闲槽位后派生工作任务；等待期间被取消或停止时原样返回投递
    async fn spawn_worker(
        &self,
        semaphore: &Arc<Semaphore>,
        delivery: Delivery,
    ) -> Result<(), Delivery> {
        let permit = tokio::select! {
            biased;
            _ = self.ctx.cancelled() => None,
            _ = self.stop.cancelled() => None,
            permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
        };

        let Some(permit) = permit else {
            return Err(delivery);
        };

        let processor = Arc::clone(&self.processor);
        let ctx = self.ctx.clone();
        let inflight = InflightGuard::new(processor.queue());

        self.tracker.spawn(async move {
            let _permit = permit;
            let _inflight = inflight;
            processor.process(&ctx, delivery).await;
        });
        Ok(())
    }

    async fn give_back(&self, delivery: Delivery) {
        info!(
            queue = %self.processor.queue(),
            delivery_tag = delivery.delivery_tag,
            "等待处理槽位时退出，交还未处理的投递"
        );
        if self.processor.auto_ack() {
            return;
        }
        if let Err(e) = delivery.nack(true).await {
            warn!(error = %e, "交还投递失败");
        }
    }
}

/// 处理中消息数量指标，工作任务结束（包括panic）时递减
struct InflightGuard {
    queue: String,
}

impl InflightGuard {
    fn new(queue: &str) -> Self {
        metrics::gauge!("courier_inflight_messages", "queue" => queue.to_string()).increment(1.0);
        Self {
            queue: queue.to_string(),
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        metrics::gauge!("courier_inflight_messages", "queue" => self.queue.clone()).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    // 分发循环要交给 tokio::spawn，future 必须是 Send
    fn dispatch_loop(
        dispatcher: DeliveryDispatcher,
        stream: DeliveryStream,
    ) -> impl std::future::Future<Output = ()> + Send {
        dispatcher.run(stream)
    }

    #[test]
    fn test_dispatch_loop_is_send() {
        let _ = dispatch_loop;
    }

    #[test]
    fn test_inflight_gauge_released_on_panic() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let result = std::panic::catch_unwind(|| {
                let _inflight = InflightGuard::new("orders");
                panic!("handler panicked");
            });
            assert!(result.is_err());
        });

        let rendered = handle.render();
        assert!(
            rendered.contains("courier_inflight_messages{queue=\"orders\"} 0"),
            "{rendered}"
        );
    }
}
