use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 优雅关闭管理器
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    /// 等待组件退出的超时时间
    grace_period: Duration,
}

impl ShutdownManager {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace_period,
        }
    }

    /// 订阅关闭信号；关闭后订阅得到的令牌立即处于取消状态
    pub fn subscribe(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// 触发关闭，可重复调用
    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            debug!("关闭管理器已经触发过关闭");
            return;
        }

        info!("触发系统关闭");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 触发关闭，并在宽限期内等待组件退出；超时返回 `false`
    pub async fn graceful_shutdown<F>(&self, drain: F) -> bool
    where
        F: Future<Output = ()>,
    {
        self.shutdown();

        match timeout(self.grace_period, drain).await {
            Ok(()) => {
                info!("所有组件已退出");
                true
            }
            Err(_) => {
                warn!("等待组件退出超时（{:?}），强制退出", self.grace_period);
                false
            }
        }
    }
}
