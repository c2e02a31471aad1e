//! 多次发射的异步结果流
//!
//! 连接事件在同一个句柄上反复发射，因此不能用一次性的 [`Deferred`]。
//! 每个订阅者拥有自己的无界通道：发射不会运行用户代码，
//! 每个订阅者按发射顺序收到全部事件。关闭后不再发射任何事件。

use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::promise::{Deferred, Outcome};
use crate::ble::BleError;

/// 订阅：`Stream<Item = Outcome<T>>`，流关闭后结束
pub type Subscription<T> = UnboundedReceiverStream<Outcome<T>>;

struct Subscribers<T> {
    senders: Vec<mpsc::UnboundedSender<Outcome<T>>>,
    closed: bool,
}

struct Shared<T> {
    subscribers: Mutex<Subscribers<T>>,
}

/// 创建一对发射端 / 观察端
pub fn result_stream<T>() -> (StreamPromise<T>, ResultStream<T>)
where
    T: Clone + Send + 'static,
{
    let promise = StreamPromise::new();
    let stream = promise.stream();
    (promise, stream)
}

/// 发射端，丢弃时关闭流
pub struct StreamPromise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> StreamPromise<T> {
    pub fn close(&self) {
        let mut subscribers = self.shared.subscribers.lock();
        subscribers.closed = true;
        subscribers.senders.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.subscribers.lock().closed
    }
}

impl<T> StreamPromise<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: Mutex::new(Subscribers {
                    senders: Vec::new(),
                    closed: false,
                }),
            }),
        }
    }

    pub fn stream(&self) -> ResultStream<T> {
        ResultStream {
            shared: self.shared.clone(),
        }
    }

    /// 向当前所有订阅者发射，返回送达的订阅者数量
    pub fn emit(&self, outcome: Outcome<T>) -> usize {
        let mut subscribers = self.shared.subscribers.lock();
        if subscribers.closed {
            return 0;
        }
        subscribers
            .senders
            .retain(|tx| tx.send(outcome.clone()).is_ok());
        subscribers.senders.len()
    }

    pub fn success(&self, value: T) -> usize {
        self.emit(Ok(value))
    }

    pub fn failure(&self, error: BleError) -> usize {
        self.emit(Err(error))
    }
}

impl<T> Default for StreamPromise<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for StreamPromise<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// 观察端
pub struct ResultStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ResultStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> ResultStream<T>
where
    T: Clone + Send + 'static,
{
    /// 订阅此后的所有发射；已关闭的流返回立即结束的订阅
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.shared.subscribers.lock();
        if !subscribers.closed {
            subscribers.senders.push(tx);
        }
        UnboundedReceiverStream::new(rx)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.subscribers.lock().closed
    }

    pub fn same_stream(&self, other: &ResultStream<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// 每次发射调用 `handler`（在独立任务中按顺序执行）
    pub fn on_event<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(Outcome<T>) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        tokio::spawn(async move {
            while let Some(outcome) = subscription.next().await {
                handler(outcome);
            }
        })
    }

    pub fn on_success<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(T) + Send + 'static,
    {
        self.on_event(move |outcome| {
            if let Ok(value) = outcome {
                handler(value);
            }
        })
    }

    pub fn on_failure<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(BleError) + Send + 'static,
    {
        self.on_event(move |outcome| {
            if let Err(error) = outcome {
                handler(error);
            }
        })
    }

    /// 逐个转换成功值，错误原样传递；上游关闭时下游随之关闭
    pub fn map<U, F>(&self, mut f: F) -> ResultStream<U>
    where
        U: Clone + Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let (next, stream) = result_stream();
        let mut subscription = self.subscribe();
        tokio::spawn(async move {
            while let Some(outcome) = subscription.next().await {
                next.emit(outcome.map(&mut f));
            }
        });
        stream
    }

    /// 每个成功值接续一个一次性结果，按上游顺序逐个等待
    pub fn flat_map<U, F>(&self, mut f: F) -> ResultStream<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnMut(T) -> Deferred<U> + Send + 'static,
    {
        let (next, stream) = result_stream();
        let mut subscription = self.subscribe();
        tokio::spawn(async move {
            while let Some(outcome) = subscription.next().await {
                let mapped = match outcome {
                    Ok(value) => f(value).wait().await,
                    Err(e) => Err(e),
                };
                next.emit(mapped);
            }
        });
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emission_order_for_every_subscriber() {
        let (promise, stream) = result_stream::<u32>();
        let mut first = stream.subscribe();
        let mut second = stream.subscribe();

        for i in 0..3 {
            assert_eq!(promise.success(i), 2);
        }
        promise.close();

        let a: Vec<_> = (&mut first).collect().await;
        let b: Vec<_> = (&mut second).collect().await;
        assert_eq!(a, vec![Ok(0), Ok(1), Ok(2)]);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let (promise, stream) = result_stream::<u32>();
        promise.success(1);
        let mut late = stream.subscribe();
        promise.success(2);
        assert_eq!(late.next().await, Some(Ok(2)));
    }

    #[tokio::test]
    async fn test_closed_stream_emits_nothing() {
        let (promise, stream) = result_stream::<u32>();
        let mut sub = stream.subscribe();
        promise.failure(BleError::Cancelled);
        drop(promise);
        assert!(stream.is_closed());
        assert_eq!(sub.next().await, Some(Err(BleError::Cancelled)));
        assert_eq!(sub.next().await, None);

        let mut after = stream.subscribe();
        assert_eq!(after.next().await, None);
    }

    #[tokio::test]
    async fn test_map_and_flat_map() {
        let (promise, stream) = result_stream::<u32>();
        let doubled = stream.map(|v| v * 2);
        let deferred = stream.flat_map(|v| Deferred::ok(format!("#{v}")));
        let mut doubled_sub = doubled.subscribe();
        let mut deferred_sub = deferred.subscribe();

        promise.success(1);
        promise.failure(BleError::Cancelled);
        promise.success(5);
        drop(promise);

        let doubled: Vec<_> = (&mut doubled_sub).collect().await;
        assert_eq!(doubled, vec![Ok(2), Err(BleError::Cancelled), Ok(10)]);
        let labels: Vec<_> = (&mut deferred_sub).collect().await;
        assert_eq!(
            labels,
            vec![
                Ok("#1".to_string()),
                Err(BleError::Cancelled),
                Ok("#5".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_flat_map_invokes_once_per_emission() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let (promise, stream) = result_stream::<u32>();
        let counter = calls.clone();
        let chained = stream.flat_map(move |v| {
            counter.fetch_add(1, Ordering::SeqCst);
            Deferred::ok(v)
        });
        let mut sub = chained.subscribe();

        promise.success(1);
        promise.success(2);
        drop(promise);

        let values: Vec<_> = (&mut sub).collect().await;
        assert_eq!(values, vec![Ok(1), Ok(2)]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
