//! 一次性异步结果
//!
//! [`Promise`] 是完成端，[`Deferred`] 是可克隆的观察端。完成只会生效一次，
//! 之后的 `complete` 调用被忽略并返回 `false`。
//! 若 `Promise` 在完成之前被丢弃，所有观察者得到 [`BleError::Cancelled`]。

use std::future::IntoFuture;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, try_join_all};
use tokio::sync::watch;

use crate::ble::BleError;

/// 成功值或错误
pub type Outcome<T> = Result<T, BleError>;

/// 创建一对完成端 / 观察端
pub fn promise<T>() -> (Promise<T>, Deferred<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let promise = Promise::new();
    let deferred = promise.deferred();
    (promise, deferred)
}

/// 完成端
pub struct Promise<T> {
    tx: watch::Sender<Option<Outcome<T>>>,
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn deferred(&self) -> Deferred<T> {
        Deferred {
            rx: self.tx.subscribe(),
        }
    }

    /// 完成结果；已完成时不做任何事并返回 `false`
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, error: BleError) -> bool {
        self.complete(Err(error))
    }

    pub fn is_completed(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// 观察端
pub struct Deferred<T> {
    rx: watch::Receiver<Option<Outcome<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// 已完成的结果
    pub fn completed(outcome: Outcome<T>) -> Self {
        let promise = Promise::new();
        promise.complete(outcome);
        promise.deferred()
    }

    pub fn ok(value: T) -> Self {
        Self::completed(Ok(value))
    }

    pub fn failed(error: BleError) -> Self {
        Self::completed(Err(error))
    }

    /// 当前结果（未完成时为 `None`）
    pub fn try_outcome(&self) -> Option<Outcome<T>> {
        self.rx.borrow().clone()
    }

    pub fn is_completed(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// 等待结果
    pub async fn wait(self) -> Outcome<T> {
        let mut rx = self.rx;
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(BleError::Cancelled))
    }

    /// 成功时调用 `handler`（在独立任务中执行）
    pub fn on_success<F>(&self, handler: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            if let Ok(value) = this.wait().await {
                handler(value);
            }
        });
    }

    /// 失败时调用 `handler`（在独立任务中执行）
    pub fn on_failure<F>(&self, handler: F)
    where
        F: FnOnce(BleError) + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(error) = this.wait().await {
                handler(error);
            }
        });
    }

    pub fn on_complete<F>(&self, handler: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            handler(this.wait().await);
        });
    }

    /// 转换成功值；失败原样传递，`f` 不会被调用
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (next, deferred) = promise();
        let this = self.clone();
        tokio::spawn(async move {
            next.complete(this.wait().await.map(f));
        });
        deferred
    }

    /// 成功时接续另一个异步结果
    pub fn flat_map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Deferred<U> + Send + 'static,
    {
        let (next, deferred) = promise();
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = match this.wait().await {
                Ok(value) => f(value).wait().await,
                Err(e) => Err(e),
            };
            next.complete(outcome);
        });
        deferred
    }

    /// 全部成功时按顺序返回所有值；任一失败则以该错误失败
    pub fn sequence<I>(items: I) -> Deferred<Vec<T>>
    where
        I: IntoIterator<Item = Deferred<T>>,
    {
        let waits: Vec<_> = items.into_iter().map(Deferred::wait).collect();
        let (next, deferred) = promise();
        tokio::spawn(async move {
            next.complete(try_join_all(waits).await);
        });
        deferred
    }
}

impl<T> IntoFuture for Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Outcome<T>;
    type IntoFuture = BoxFuture<'static, Outcome<T>>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_complete_once() {
        let (promise, deferred) = promise::<u32>();
        assert!(!deferred.is_completed());
        assert!(promise.succeed(1));
        assert!(!promise.succeed(2));
        assert!(!promise.fail(BleError::Cancelled));
        assert_eq!(deferred.await, Ok(1));
    }

    #[tokio::test]
    async fn test_handler_fires_when_already_completed() {
        let deferred = Deferred::ok("done".to_string());
        let (tx, rx) = oneshot::channel();
        deferred.on_success(move |v| {
            let _ = tx.send(v);
        });
        assert_eq!(rx.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_on_failure_not_called_on_success() {
        let (promise, deferred) = promise::<u8>();
        let (tx, rx) = oneshot::channel::<BleError>();
        deferred.on_failure(move |e| {
            let _ = tx.send(e);
        });
        promise.succeed(7);
        // 成功后 handler 被丢弃，发送端随之关闭
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_map_propagates_failure_without_calling_f() {
        let uuid = Uuid::nil();
        let deferred = Deferred::<u8>::failed(BleError::ReadTimeout(uuid));
        let mapped = deferred.map(|_| -> u8 { panic!("map called on failure") });
        assert_eq!(mapped.await, Err(BleError::ReadTimeout(uuid)));
    }

    #[tokio::test]
    async fn test_flat_map_chains() {
        let (promise, deferred) = promise::<u8>();
        let chained = deferred.flat_map(|v| Deferred::ok(u32::from(v) * 10));
        promise.succeed(4);
        assert_eq!(chained.await, Ok(40));
    }

    #[tokio::test]
    async fn test_dropped_promise_cancels() {
        let (promise, deferred) = promise::<()>();
        drop(promise);
        assert_eq!(deferred.await, Err(BleError::Cancelled));
    }

    #[tokio::test]
    async fn test_completed_then_dropped_keeps_value() {
        let (promise, deferred) = promise::<u8>();
        promise.succeed(3);
        drop(promise);
        assert_eq!(deferred.try_outcome(), Some(Ok(3)));
        assert_eq!(deferred.await, Ok(3));
    }

    #[tokio::test]
    async fn test_sequence() {
        let all = Deferred::sequence(vec![Deferred::ok(1), Deferred::ok(2), Deferred::ok(3)]);
        assert_eq!(all.await, Ok(vec![1, 2, 3]));

        let (pending, never) = promise::<i32>();
        let failing = Deferred::sequence(vec![never, Deferred::failed(BleError::Cancelled)]);
        assert_eq!(failing.await, Err(BleError::Cancelled));
        drop(pending);
    }
}
