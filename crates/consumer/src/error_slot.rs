//! 单槽错误通道
//!
//! 容量为1：只保留第一个致命错误，槽位已满时后续错误直接丢弃。
//! 调用方依赖"只看到第一个致命错误"这一行为，不要改成无界队列。

use std::sync::Arc;

use courier_core::CourierError;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// 创建一对单槽错误通道的写端和读端
pub fn error_channel() -> (ErrorSlot, ConsumerErrors) {
    let (sender, receiver) = mpsc::channel(1);
    (
        ErrorSlot { sender },
        ConsumerErrors {
            receiver: Arc::new(Mutex::new(receiver)),
        },
    )
}

/// 写端，非阻塞
#[derive(Clone)]
pub struct ErrorSlot {
    sender: mpsc::Sender<CourierError>,
}

impl ErrorSlot {
    /// 记录错误，返回是否被接收（槽位已满时返回false）
    pub fn report(&self, error: CourierError) -> bool {
        match self.sender.try_send(error) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                debug!(error = %dropped, "错误槽位已满，丢弃后续错误");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// 只读视图
#[derive(Clone)]
pub struct ConsumerErrors {
    receiver: Arc<Mutex<mpsc::Receiver<CourierError>>>,
}

impl ConsumerErrors {
    /// 等待下一个错误
    pub async fn recv(&self) -> Option<CourierError> {
        self.receiver.lock().await.recv().await
    }

    /// 非阻塞读取。另一个任务正在 `recv` 时返回 `None`
    pub fn try_recv(&self) -> Option<CourierError> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_wins() {
        let (slot, errors) = error_channel();

        assert!(slot.report(CourierError::StreamClosed {
            queue: "first".into()
        }));
        assert!(!slot.report(CourierError::StreamClosed {
            queue: "second".into()
        }));
        assert!(!slot.report(CourierError::Connection("third".into())));

        match errors.try_recv() {
            Some(CourierError::StreamClosed { queue }) => assert_eq!(queue, "first"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(errors.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_waits_for_error() {
        let (slot, errors) = error_channel();
        let reader = errors.clone();
        let handle = tokio::spawn(async move { reader.recv().await });

        tokio::task::yield_now().await;
        slot.report(CourierError::Connection("late".into()));

        let received = handle.await.unwrap();
        assert!(matches!(received, Some(CourierError::Connection(_))));
    }
}
