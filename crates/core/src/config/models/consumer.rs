use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 预取数量为0时使用的默认值
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// 死信队列配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DlqConfig {
    pub enabled: bool,
    /// 最大重试次数，0表示首次失败即进入死信队列
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    pub retry_delay_ms: u64,
    /// 死信交换机
    pub exchange: String,
    /// 死信路由键，同时作为死信队列名
    pub routing_key: String,
    pub use_exponential_backoff: bool,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            retry_delay_ms: 5000,
            exchange: "dlx".to_string(),
            routing_key: "dlq".to_string(),
            use_exponential_backoff: true,
        }
    }
}

impl DlqConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// 计算第 `attempt` 次重试前的等待时间（attempt从0开始）
    ///
    /// 固定退避始终返回 `retry_delay`；指数退避返回 `retry_delay * 2^attempt`，
    /// 溢出时饱和到 `Duration::MAX`。
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_delay();
        if !self.use_exponential_backoff {
            return base;
        }

        2u32.checked_pow(attempt)
            .and_then(|multiplier| base.checked_mul(multiplier))
            .unwrap_or(if base.is_zero() { base } else { Duration::MAX })
    }

    /// 验证死信配置
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.exchange.is_empty() {
            return Err(anyhow::anyhow!("死信交换机名称不能为空"));
        }

        if self.routing_key.is_empty() {
            return Err(anyhow::anyhow!("死信路由键不能为空"));
        }

        Ok(())
    }
}

/// 消费者配置，开始消费后不可变
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsumerConfig {
    /// 消费者标签，为空时自动生成
    pub name: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    /// 预取数量，0表示使用 [`DEFAULT_PREFETCH_COUNT`]
    pub prefetch_count: u16,
    pub dlq: DlqConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            auto_ack: false,
            exclusive: false,
            no_local: false,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            dlq: DlqConfig::default(),
        }
    }
}

impl ConsumerConfig {
    /// 实际生效的预取数量，同时也是并发处理上限（至少为1）
    pub fn effective_prefetch(&self) -> u16 {
        if self.prefetch_count == 0 {
            DEFAULT_PREFETCH_COUNT
        } else {
            self.prefetch_count
        }
    }

    /// 验证消费者配置
    pub fn validate(&self) -> anyhow::Result<()> {
        self.dlq.validate()
    }
}
