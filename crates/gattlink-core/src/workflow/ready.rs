//! 外设就绪工作流
//!
//! 组合连接管理与服务发现：
//! 1. 连接外设
//! 2. 每次 `Connect` 后发现全部服务和特征
//! 3. 发现完成后发射一次就绪的 [`Peripheral`]
//!
//! `GiveUp` / `Failed` 以错误结束输出流；主动断开后输出流正常结束。

use futures_util::StreamExt;
use log::{debug, info};
use uuid::Uuid;

use crate::ble::peripheral::{ConnectOptions, ConnectionEvent, Peripheral};
use crate::ble::{BleError, TransportError};
use crate::deferred::{Deferred, Promise, ResultStream, StreamPromise, result_stream};

/// 就绪工作流选项
#[derive(Debug, Clone, Default)]
pub struct ReadyOptions {
    pub connect: ConnectOptions,
    /// 只发现这些服务（`None` 表示全部）
    pub services: Option<Vec<Uuid>>,
    /// 意外断开后自动调用 `reconnect()`
    pub reconnect_on_disconnect: bool,
}

/// 外设就绪工作流
pub struct ReadyWorkflow {
    options: ReadyOptions,
}

impl ReadyWorkflow {
    pub fn new(options: ReadyOptions) -> Self {
        Self { options }
    }

    /// 每次连接并完成发现后发射一次外设
    pub fn start(&self, peripheral: &Peripheral) -> ResultStream<Peripheral> {
        let (output, stream) = result_stream();
        self.run(peripheral, output);
        stream
    }

    /// 第一次就绪（或第一个错误）
    pub fn ready(&self, peripheral: &Peripheral) -> Deferred<Peripheral> {
        let (output, stream) = result_stream();
        let mut subscription = stream.subscribe();
        self.run(peripheral, output);

        let promise = Promise::new();
        let deferred = promise.deferred();
        tokio::spawn(async move {
            // 流在发射前结束时 promise 被丢弃，观察者得到 Cancelled
            if let Some(outcome) = subscription.next().await {
                promise.complete(outcome);
            }
        });
        deferred
    }

    fn run(&self, peripheral: &Peripheral, output: StreamPromise<Peripheral>) {
        let services = self.options.services.clone();
        let reconnect = self.options.reconnect_on_disconnect;
        let peripheral = peripheral.clone();

        let already_connected = peripheral.is_connected();
        let (_connection, mut events) = peripheral.connect_subscribed(self.options.connect);

        tokio::spawn(async move {
            if already_connected {
                let discovered = peripheral.discover_all_services(services.clone()).await;
                output.emit(discovered.map(|_| peripheral.clone()));
            }

            while let Some(outcome) = events.next().await {
                match outcome {
                    Ok(ConnectionEvent::Connect) => {
                        debug!("{} connected, discovering services", peripheral.id());
                        let discovered = peripheral.discover_all_services(services.clone()).await;
                        if discovered.is_ok() {
                            info!("{} ready", peripheral.id());
                        }
                        output.emit(discovered.map(|_| peripheral.clone()));
                    }
                    Ok(ConnectionEvent::Timeout) => {
                        debug!("{} timed out, retrying", peripheral.id());
                    }
                    Ok(ConnectionEvent::Disconnect) => {
                        if reconnect {
                            info!("{} dropped, reconnecting", peripheral.id());
                            peripheral.reconnect();
                        }
                    }
                    Ok(ConnectionEvent::ForceDisconnect) => {
                        debug!("{} disconnected by request", peripheral.id());
                        break;
                    }
                    Ok(ConnectionEvent::GiveUp) => {
                        output.failure(BleError::ConnectionGiveUp(peripheral.id().clone()));
                        break;
                    }
                    Ok(ConnectionEvent::Failed) => {
                        output.failure(BleError::ConnectionFailed(TransportError::new(
                            -1,
                            "connection failed",
                        )));
                        break;
                    }
                    Err(error) => {
                        output.failure(error);
                        break;
                    }
                }
            }
        });
    }
}

/// 使用默认选项连接并发现全部服务
pub fn connect_and_discover(peripheral: &Peripheral) -> ResultStream<Peripheral> {
    ReadyWorkflow::new(ReadyOptions::default()).start(peripheral)
}
