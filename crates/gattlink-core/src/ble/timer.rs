//! 定时器
//!
//! 所有超时都通过 [`Timer::schedule_after`] 安排。超时是否仍然有效由
//! 序列号守卫在触发时判断，句柄上的取消只在 `Central` 关闭时使用。

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// 已安排工作的可取消句柄
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// 延迟执行设施
///
/// 每个安排的工作都是根令牌的子令牌，`shutdown` 会一次性取消全部。
#[derive(Debug, Clone, Default)]
pub struct Timer {
    root: CancellationToken,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在 `delay` 之后执行 `work`（需要在 tokio 运行时中调用）
    pub fn schedule_after<F>(&self, delay: Duration, work: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.root.child_token();
        let handle = TimerHandle {
            token: token.clone(),
        };
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => work(),
            }
        });
        handle
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let timer = Timer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timer.schedule_after(Duration::from_secs(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_shutdown() {
        let timer = Timer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let handle = timer.schedule_after(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        assert!(handle.is_cancelled());

        let counter = fired.clone();
        let other = timer.schedule_after(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.shutdown();
        assert!(other.is_cancelled());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
