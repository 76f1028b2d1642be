//! 消费者生命周期控制

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use courier_core::{
    config::ConsumerConfig,
    traits::{BrokerChannel, ConsumeOptions, DeliveryStream, MessageHandler},
    CourierError, Result,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::{DeliveryDispatcher, DispatchMode};
use crate::dlq::setup_dlq_topology;
use crate::error_slot::{error_channel, ConsumerErrors, ErrorSlot};
use crate::processor::{FailurePolicy, MessageProcessor};
use crate::stats::{ConsumerStats, ConsumerStatsSnapshot};

/// 消费者状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct Lifecycle {
    state: ConsumerState,
    stop: CancellationToken,
}

/// 分发任务退出时（包括panic）把状态置为 `Stopped`
struct RunningGuard {
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock_lifecycle(&self.lifecycle).state = ConsumerState::Stopped;
    }
}

fn lock_lifecycle(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 队列消费者
///
/// 同一时刻最多运行一个消费会话。`consume` 在分发任务内逐条处理，失败时直接重新入队；
/// `consume_with_dlq` 按预取数量并发处理，失败时按死信配置重试或转入死信队列。
/// 停止后可以再次调用 `consume*` 开始新的会话。
pub struct Consumer {
    channel: Arc<dyn BrokerChannel>,
    config: Arc<ConsumerConfig>,
    consumer_tag: String,
    lifecycle: Arc<Mutex<Lifecycle>>,
    error_slot: ErrorSlot,
    errors: ConsumerErrors,
    tracker: TaskTracker,
    stats: Arc<ConsumerStats>,
}

impl Consumer {
    pub fn new(channel: Arc<dyn BrokerChannel>, config: ConsumerConfig) -> Self {
        let consumer_tag = if config.name.is_empty() {
            format!("courier-{}", Uuid::new_v4())
        } else {
            config.name.clone()
        };

        let (error_slot, errors) = error_channel();

        // 关闭后仍可派生任务，wait() 等待当前所有任务结束
        let tracker = TaskTracker::new();
        tracker.close();

        Self {
            channel,
            config: Arc::new(config),
            consumer_tag,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: ConsumerState::Idle,
                stop: CancellationToken::new(),
            })),
            error_slot,
            errors,
            tracker,
            stats: Arc::new(ConsumerStats::new()),
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// 开始消费，逐条同步处理；处理失败时 nack 并重新入队
    pub async fn consume(
        &self,
        ctx: CancellationToken,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.start(ctx, queue, handler, FailurePolicy::Requeue).await
    }

    /// 开始消费，按预取数量并发处理；失败时按死信配置重试或转入死信队列
    ///
    /// 总是先设置QoS，死信启用时再声明死信拓扑。
    pub async fn consume_with_dlq(
        &self,
        ctx: CancellationToken,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.start(ctx, queue, handler, FailurePolicy::RetryThenDeadLetter)
            .await
    }

    async fn start(
        &self,
        ctx: CancellationToken,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        policy: FailurePolicy,
    ) -> Result<()> {
        let (stop, previous) = self.begin_run()?;

        if self.config.auto_ack && self.config.dlq.enabled {
            warn!(queue = %queue, "自动确认模式下消息已由broker确认，失败消息不会重试或进入死信队列");
        }

        let stream = match self.register(queue, policy).await {
            Ok(stream) => stream,
            Err(e) => {
                lock_lifecycle(&self.lifecycle).state = previous;
                error!(queue = %queue, error = %e, "启动消费者失败");
                return Err(e);
            }
        };

        let processor = Arc::new(MessageProcessor::new(
            Arc::clone(&self.channel),
            Arc::clone(&self.config),
            queue,
            handler,
            policy,
            Arc::clone(&self.stats),
        ));

        let mode = match policy {
            FailurePolicy::Requeue => DispatchMode::Inline,
            FailurePolicy::RetryThenDeadLetter => DispatchMode::Concurrent(Arc::new(
                Semaphore::new(usize::from(self.config.effective_prefetch())),
            )),
        };

        let dispatcher = DeliveryDispatcher {
            processor,
            mode,
            ctx,
            stop,
            errors: self.error_slot.clone(),
            tracker: self.tracker.clone(),
        };
        let guard = RunningGuard {
            lifecycle: Arc::clone(&self.lifecycle),
        };

        self.tracker.spawn(async move {
            let _guard = guard;
            dispatcher.run(stream).await;
        });

        info!(
            queue = %queue,
            consumer_tag = %self.consumer_tag,
            dlq_enabled = policy == FailurePolicy::RetryThenDeadLetter && self.config.dlq.enabled,
            "消费者已启动"
        );
        Ok(())
    }

    /// 进入 `Running`，返回本次会话的停止信号和之前的状态
    fn begin_run(&self) -> Result<(CancellationToken, ConsumerState)> {
        let mut lifecycle = lock_lifecycle(&self.lifecycle);
        if matches!(
            lifecycle.state,
            ConsumerState::Running | ConsumerState::Stopping
        ) {
            return Err(CourierError::AlreadyRunning);
        }

        let previous = lifecycle.state;
        lifecycle.state = ConsumerState::Running;
        lifecycle.stop = CancellationToken::new();
        Ok((lifecycle.stop.clone(), previous))
    }

    async fn register(&self, queue: &str, policy: FailurePolicy) -> Result<DeliveryStream> {
        if policy == FailurePolicy::RetryThenDeadLetter {
            self.channel
                .qos(self.config.effective_prefetch())
                .await?;

            if self.config.dlq.enabled {
                setup_dlq_topology(self.channel.as_ref(), &self.config.dlq).await?;
            }
        }

        self.channel
            .consume(
                queue,
                &self.consumer_tag,
                ConsumeOptions {
                    auto_ack: self.config.auto_ack,
                    exclusive: self.config.exclusive,
                    no_local: self.config.no_local,
                },
            )
            .await
    }

    /// 等待所有任务结束，返回记录到的第一个致命错误
    pub async fn wait(&self) -> Result<()> {
        self.tracker.wait().await;
        match self.errors.try_recv() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 通知分发器退出，可重复调用
    pub fn stop(&self) {
        let mut lifecycle = lock_lifecycle(&self.lifecycle);
        if lifecycle.state == ConsumerState::Running {
            lifecycle.state = ConsumerState::Stopping;
            debug!(consumer_tag = %self.consumer_tag, "消费者正在停止");
        }
        lifecycle.stop.cancel();
    }

    /// 错误通道的只读视图
    pub fn errors(&self) -> ConsumerErrors {
        self.errors.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            ConsumerState::Running | ConsumerState::Stopping
        )
    }

    pub fn state(&self) -> ConsumerState {
        lock_lifecycle(&self.lifecycle).state
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    /// 停止并等待所有任务结束，总是成功
    pub async fn close(&self) -> Result<()> {
        self.stop();
        self.tracker.wait().await;
        info!(consumer_tag = %self.consumer_tag, "消费者已关闭");
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        lock_lifecycle(&self.lifecycle).stop.cancel();
    }
}
