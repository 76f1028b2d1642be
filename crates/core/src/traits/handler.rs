use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// 消息处理器
///
/// 返回 `Ok(())` 表示成功（进入确认路径），返回错误表示失败（进入重试/死信路径）。
/// 处理器不能假设预取上限之外的任何顺序或独占保证。
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &CancellationToken, body: &[u8]) -> anyhow::Result<()>;
}

/// 闭包适配器，见 [`handler_fn`]
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// 把异步闭包包装成 [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(CancellationToken, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(CancellationToken, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &CancellationToken, body: &[u8]) -> anyhow::Result<()> {
        (self.f)(ctx.clone(), body.to_vec()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_handler_fn_forwards_body() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler = handler_fn(move |_ctx, body: Vec<u8>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(body.len(), Ordering::SeqCst);
                Ok(())
            }
        });

        handler
            .handle(&CancellationToken::new(), b"hello")
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_handler_fn_propagates_error() {
        let handler = handler_fn(|_ctx, _body| async { Err(anyhow::anyhow!("boom")) });
        let err = handler
            .handle(&CancellationToken::new(), b"x")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
