//! 外设连接管理
//!
//! 每个外设一个 [`ConnectionManager`]：
//!
//! ```text
//! Disconnected --connect--> Connecting --did_connect--> Connected
//!      ^                        |  ^                        |
//!      |                  timeout  | retry            disconnect
//!      |                        v  |                        v
//!      +------ give up ------ Timeout              Disconnecting
//! ```
//!
//! 连接事件通过同一个 [`ResultStream`] 反复发射，直到 `GiveUp` 或 `Failed`
//! 关闭该流。重试次数为 `None` 时不设上限。

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use uuid::Uuid;

use super::central::{Inner, Outbox, TimerEvent};
use super::codec::ProfileRegistry;
use super::sequence::SequenceGuard;
use super::service::{Service, ServiceEntry};
use super::transport::Request;
use super::{BleError, PeripheralId, TransportError};
use crate::config::CentralSettings;
use crate::deferred::{Deferred, Outcome, Promise, ResultStream, StreamPromise, Subscription};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Timeout,
    Failed,
}

/// 连接流上发射的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Connect,
    Timeout,
    /// 意外断开
    Disconnect,
    /// 由 `disconnect()` 主动断开
    ForceDisconnect,
    Failed,
    GiveUp,
}

impl ConnectionEvent {
    /// 发射后连接流会关闭
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionEvent::Failed | ConnectionEvent::GiveUp)
    }
}

/// 连接参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectOptions {
    pub timeout: Duration,
    /// 超时后自动重试的次数上限
    pub timeout_retries: Option<u32>,
    /// 意外断开的次数上限
    pub disconnect_retries: Option<u32>,
    /// 覆盖该外设上特征读写的超时
    pub characteristic_timeout: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from(&CentralSettings::default())
    }
}

impl From<&CentralSettings> for ConnectOptions {
    fn from(settings: &CentralSettings) -> Self {
        Self {
            timeout: settings.connection_timeout(),
            timeout_retries: settings.timeout_retries,
            disconnect_retries: settings.disconnect_retries,
            characteristic_timeout: None,
        }
    }
}

impl ConnectOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_timeout_retries(mut self, retries: u32) -> Self {
        self.timeout_retries = Some(retries);
        self
    }

    pub fn with_disconnect_retries(mut self, retries: u32) -> Self {
        self.disconnect_retries = Some(retries);
        self
    }

    pub fn with_characteristic_timeout(mut self, timeout: Duration) -> Self {
        self.characteristic_timeout = Some(timeout);
        self
    }
}

/// 一次连接尝试的参数与计数
#[derive(Debug, Clone, Copy)]
struct ConnectionAttempt {
    sequence: u64,
    timeout: Duration,
    deadline: Instant,
    timeout_retries: Option<u32>,
    disconnect_retries: Option<u32>,
    timeout_count: u32,
    disconnect_count: u32,
}

impl ConnectionAttempt {
    fn new(sequence: u64, options: &ConnectOptions) -> Self {
        Self {
            sequence,
            timeout: options.timeout,
            deadline: Instant::now() + options.timeout,
            timeout_retries: options.timeout_retries,
            disconnect_retries: options.disconnect_retries,
            timeout_count: 0,
            disconnect_count: 0,
        }
    }

    /// 新序列号，保留参数和计数
    fn renew(&self, sequence: u64) -> Self {
        Self {
            sequence,
            deadline: Instant::now() + self.timeout,
            ..*self
        }
    }

    fn can_retry_timeout(&self) -> bool {
        self.timeout_retries
            .is_none_or(|max| self.timeout_count < max)
    }

    fn can_retry_disconnect(&self) -> bool {
        self.disconnect_retries
            .is_none_or(|max| self.disconnect_count < max)
    }
}

/// 单个外设的连接状态机
pub(crate) struct ConnectionManager {
    peripheral: PeripheralId,
    state: ConnectionState,
    guard: SequenceGuard,
    attempt: Option<ConnectionAttempt>,
    events: Option<StreamPromise<ConnectionEvent>>,
}

impl ConnectionManager {
    pub(crate) fn new(peripheral: PeripheralId) -> Self {
        Self {
            peripheral,
            state: ConnectionState::Disconnected,
            guard: SequenceGuard::new(),
            attempt: None,
            events: None,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn connect(
        &mut self,
        options: &ConnectOptions,
        outbox: &mut Outbox,
    ) -> ResultStream<ConnectionEvent> {
        let stream = self.open_stream();
        if self.state == ConnectionState::Connected {
            debug!("{} already connected", self.peripheral);
            return stream;
        }
        let sequence = self.guard.begin();
        self.start(ConnectionAttempt::new(sequence, options), outbox);
        stream
    }

    /// 使用上一次的连接参数重新连接，已连接或连接中时不做任何事
    pub(crate) fn reconnect(&mut self, outbox: &mut Outbox) -> bool {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Disconnecting => {
                debug!("Ignoring reconnect of {} in state {:?}", self.peripheral, self.state);
                return false;
            }
            ConnectionState::Disconnected | ConnectionState::Timeout | ConnectionState::Failed => {}
        }
        let Some(previous) = self.attempt else {
            warn!("Cannot reconnect {}: no previous connection attempt", self.peripheral);
            return false;
        };
        if self.events.as_ref().is_none_or(StreamPromise::is_closed) {
            warn!("Cannot reconnect {}: connection stream closed", self.peripheral);
            return false;
        }
        let sequence = self.guard.begin();
        self.start(previous.renew(sequence), outbox);
        true
    }

    pub(crate) fn disconnect(&mut self, outbox: &mut Outbox) {
        match self.state {
            ConnectionState::Connected => {
                info!("Disconnecting {}", self.peripheral);
                self.guard.finish();
                self.state = ConnectionState::Disconnecting;
                outbox.request(Request::Disconnect(self.peripheral.clone()));
            }
            ConnectionState::Connecting | ConnectionState::Timeout => {
                info!("Cancelling connection to {}", self.peripheral);
                self.guard.finish();
                outbox.request(Request::CancelConnect(self.peripheral.clone()));
                self.state = ConnectionState::Disconnected;
                self.emit(ConnectionEvent::ForceDisconnect);
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.emit(ConnectionEvent::ForceDisconnect);
            }
            ConnectionState::Disconnecting => {
                debug!("{} already disconnecting", self.peripheral);
            }
        }
    }

    pub(crate) fn on_timeout(&mut self, sequence: u64, outbox: &mut Outbox) {
        if !self.guard.is_current(sequence) || self.state != ConnectionState::Connecting {
            debug!("Connection timer {} for {} expired", sequence, self.peripheral);
            return;
        }
        let Some(mut attempt) = self.attempt else {
            return;
        };
        self.guard.finish();
        self.state = ConnectionState::Timeout;
        outbox.request(Request::CancelConnect(self.peripheral.clone()));

        if attempt.can_retry_timeout() {
            attempt.timeout_count += 1;
            info!(
                "Connection to {} timed out after {:?} (attempt {})",
                self.peripheral, attempt.timeout, attempt.timeout_count
            );
            self.emit(ConnectionEvent::Timeout);
            let sequence = self.guard.begin();
            self.start(attempt.renew(sequence), outbox);
        } else {
            warn!(
                "Giving up on {} after {} timeouts",
                self.peripheral, attempt.timeout_count
            );
            self.state = ConnectionState::Disconnected;
            self.terminate(Ok(ConnectionEvent::GiveUp));
        }
    }

    pub(crate) fn did_connect(&mut self) {
        let Some(attempt) = self.attempt.as_mut() else {
            debug!("Ignoring connect callback for {}: no attempt", self.peripheral);
            return;
        };
        if self.state != ConnectionState::Connecting {
            debug!(
                "Ignoring connect callback for {} in state {:?}",
                self.peripheral, self.state
            );
            return;
        }
        attempt.timeout_count = 0;
        attempt.disconnect_count = 0;
        self.guard.finish();
        self.state = ConnectionState::Connected;
        info!("Connected to {}", self.peripheral);
        self.emit(ConnectionEvent::Connect);
    }

    pub(crate) fn did_fail_to_connect(&mut self, error: Option<TransportError>) {
        if self.state == ConnectionState::Disconnected {
            debug!("Ignoring failure callback for {}: disconnected", self.peripheral);
            return;
        }
        self.state = ConnectionState::Failed;
        match error {
            Some(error) => {
                warn!("Connection to {} failed: {}", self.peripheral, error);
                self.terminate(Err(BleError::ConnectionFailed(error)));
            }
            None => {
                warn!("Connection to {} failed", self.peripheral);
                self.terminate(Ok(ConnectionEvent::Failed));
            }
        }
    }

    pub(crate) fn did_disconnect(&mut self, error: Option<TransportError>) {
        // 只有 Disconnecting 状态下的断开才是对 disconnect() 的确认
        if self.state == ConnectionState::Disconnecting {
            self.state = ConnectionState::Disconnected;
            match &error {
                Some(e) => info!("Disconnected from {} ({})", self.peripheral, e),
                None => info!("Disconnected from {}", self.peripheral),
            }
            self.emit(ConnectionEvent::ForceDisconnect);
            return;
        }

        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {}
            state => {
                debug!("Ignoring disconnect callback for {} in state {:?}", self.peripheral, state);
                return;
            }
        }
        let Some(mut attempt) = self.attempt else {
            return;
        };
        match &error {
            Some(e) => warn!("{} disconnected unexpectedly: {}", self.peripheral, e),
            None => warn!("{} disconnected unexpectedly", self.peripheral),
        }
        self.guard.finish();
        self.state = ConnectionState::Disconnected;

        if attempt.can_retry_disconnect() {
            attempt.disconnect_count += 1;
            self.attempt = Some(attempt);
            self.emit(ConnectionEvent::Disconnect);
        } else {
            warn!(
                "Giving up on {} after {} disconnects",
                self.peripheral, attempt.disconnect_count
            );
            self.terminate(Ok(ConnectionEvent::GiveUp));
        }
    }

    fn start(&mut self, attempt: ConnectionAttempt, outbox: &mut Outbox) {
        debug!(
            "Connecting to {} (sequence {}, deadline in {:?})",
            self.peripheral,
            attempt.sequence,
            attempt.deadline.saturating_duration_since(Instant::now())
        );
        self.state = ConnectionState::Connecting;
        outbox.request(Request::Connect(self.peripheral.clone()));
        outbox.arm(
            attempt.timeout,
            TimerEvent::Connect {
                peripheral: self.peripheral.clone(),
                sequence: attempt.sequence,
            },
        );
        self.attempt = Some(attempt);
    }

    /// 复用仍然打开的连接流，否则新建
    fn open_stream(&mut self) -> ResultStream<ConnectionEvent> {
        match &self.events {
            Some(events) if !events.is_closed() => events.stream(),
            _ => {
                let events = StreamPromise::new();
                let stream = events.stream();
                self.events = Some(events);
                stream
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        debug!("{}: {:?}", self.peripheral, event);
        if let Some(events) = &self.events {
            events.success(event);
        }
    }

    /// 发射最终结果并关闭连接流
    fn terminate(&mut self, outcome: Outcome<ConnectionEvent>) {
        debug!("{}: {:?} (final)", self.peripheral, outcome);
        self.guard.finish();
        self.attempt = None;
        if let Some(events) = self.events.take() {
            events.emit(outcome);
        }
    }
}

/// 注册表中单个外设的全部状态
pub(crate) struct PeripheralEntry {
    id: PeripheralId,
    pub(crate) link: ConnectionManager,
    services: Vec<ServiceEntry>,
    pending_services: Option<Promise<Vec<Uuid>>>,
    characteristic_timeout: Option<Duration>,
}

impl PeripheralEntry {
    pub(crate) fn new(id: PeripheralId) -> Self {
        Self {
            link: ConnectionManager::new(id.clone()),
            id,
            services: Vec::new(),
            pending_services: None,
            characteristic_timeout: None,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.link.state() == ConnectionState::Connected
    }

    pub(crate) fn characteristic_timeout(&self) -> Option<Duration> {
        self.characteristic_timeout
    }

    pub(crate) fn service(&self, uuid: &Uuid) -> Option<&ServiceEntry> {
        self.services.iter().find(|s| s.uuid() == *uuid)
    }

    pub(crate) fn service_mut(&mut self, uuid: &Uuid) -> Option<&mut ServiceEntry> {
        self.services.iter_mut().find(|s| s.uuid() == *uuid)
    }

    fn connect(
        &mut self,
        options: &ConnectOptions,
        outbox: &mut Outbox,
    ) -> ResultStream<ConnectionEvent> {
        if self.link.state() != ConnectionState::Connected {
            self.characteristic_timeout = options.characteristic_timeout;
        }
        self.link.connect(options, outbox)
    }

    fn discover_services(
        &mut self,
        uuids: Option<Vec<Uuid>>,
        outbox: &mut Outbox,
    ) -> Deferred<Vec<Uuid>> {
        if !self.is_connected() {
            return Deferred::failed(BleError::NotConnected(self.id.clone()));
        }
        let promise = Promise::new();
        let deferred = promise.deferred();
        if self.pending_services.replace(promise).is_some() {
            debug!("Superseding pending service discovery on {}", self.id);
        }
        outbox.request(Request::DiscoverServices {
            peripheral: self.id.clone(),
            uuids,
        });
        deferred
    }

    /// 以发现结果替换服务列表；已存在的服务保留其特征状态
    pub(crate) fn did_discover_services(
        &mut self,
        uuids: Vec<Uuid>,
        error: Option<TransportError>,
        profiles: &ProfileRegistry,
    ) {
        let pending = self.pending_services.take();
        if let Some(error) = error {
            warn!("Service discovery on {} failed: {}", self.id, error);
            if let Some(promise) = pending {
                promise.fail(BleError::Transport(error));
            }
            return;
        }

        let mut previous = std::mem::take(&mut self.services);
        for uuid in &uuids {
            let entry = match previous.iter().position(|s| s.uuid() == *uuid) {
                Some(index) => previous.swap_remove(index),
                None => ServiceEntry::new(
                    self.id.clone(),
                    *uuid,
                    profiles.service_name(uuid),
                ),
            };
            self.services.push(entry);
        }
        debug!("Discovered {} services on {}", uuids.len(), self.id);
        if let Some(promise) = pending {
            promise.succeed(uuids);
        }
    }
}

/// 外设句柄
#[derive(Clone)]
pub struct Peripheral {
    central: Arc<Inner>,
    id: PeripheralId,
}

impl std::fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peripheral").field("id", &self.id).finish()
    }
}

impl Peripheral {
    pub(crate) fn new(central: Arc<Inner>, id: PeripheralId) -> Self {
        Self { central, id }
    }

    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.central.inspect(|registry| {
            registry
                .peripheral(&self.id)
                .map_or(ConnectionState::Disconnected, |entry| entry.link.state())
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// 使用设置中的默认参数连接
    pub fn connect(&self) -> ResultStream<ConnectionEvent> {
        self.connect_with(ConnectOptions::from(&self.central.settings))
    }

    /// 连接并返回连接事件流
    ///
    /// 已连接时直接返回现有的流，不发射任何事件。
    pub fn connect_with(&self, options: ConnectOptions) -> ResultStream<ConnectionEvent> {
        self.central.dispatch(|registry, outbox| {
            registry.peripheral_mut(&self.id).connect(&options, outbox)
        })
    }

    /// 连接，并在发出连接请求之前订阅事件流，保证不会错过任何事件
    pub fn connect_subscribed(
        &self,
        options: ConnectOptions,
    ) -> (ResultStream<ConnectionEvent>, Subscription<ConnectionEvent>) {
        self.central.dispatch(|registry, outbox| {
            let stream = registry.peripheral_mut(&self.id).connect(&options, outbox);
            let subscription = stream.subscribe();
            (stream, subscription)
        })
    }

    pub fn disconnect(&self) {
        self.central.dispatch(|registry, outbox| {
            match registry.existing_mut(&self.id) {
                Some(entry) => entry.link.disconnect(outbox),
                None => debug!("Ignoring disconnect of unknown peripheral {}", self.id),
            }
        });
    }

    /// 返回是否真正发起了新的连接尝试
    pub fn reconnect(&self) -> bool {
        self.central.dispatch(|registry, outbox| {
            registry
                .existing_mut(&self.id)
                .is_some_and(|entry| entry.link.reconnect(outbox))
        })
    }

    /// 发现服务（`None` 表示全部）；再次调用会取代尚未完成的发现
    pub fn discover_services(&self, uuids: Option<Vec<Uuid>>) -> Deferred<Vec<Service>> {
        let discovered = self.central.dispatch(|registry, outbox| {
            match registry.existing_mut(&self.id) {
                Some(entry) => entry.discover_services(uuids, outbox),
                None => Deferred::failed(BleError::PeripheralNotFound(self.id.clone())),
            }
        });
        let central = self.central.clone();
        let id = self.id.clone();
        discovered.map(move |uuids| {
            uuids
                .into_iter()
                .map(|uuid| Service::new(central.clone(), id.clone(), uuid))
                .collect()
        })
    }

    /// 发现服务，再发现每个服务的全部特征
    pub fn discover_all_services(&self, uuids: Option<Vec<Uuid>>) -> Deferred<Vec<Service>> {
        self.discover_services(uuids).flat_map(|services| {
            let discoveries: Vec<_> = services
                .iter()
                .map(|service| service.discover_characteristics(None))
                .collect();
            Deferred::sequence(discoveries).map(move |_| services)
        })
    }

    /// 已发现的服务
    pub fn services(&self) -> Vec<Service> {
        let uuids: Vec<Uuid> = self.central.inspect(|registry| {
            registry
                .peripheral(&self.id)
                .map(|entry| entry.services.iter().map(ServiceEntry::uuid).collect())
                .unwrap_or_default()
        });
        uuids
            .into_iter()
            .map(|uuid| Service::new(self.central.clone(), self.id.clone(), uuid))
            .collect()
    }

    pub fn service(&self, uuid: Uuid) -> Option<Service> {
        let known = self.central.inspect(|registry| {
            registry
                .peripheral(&self.id)
                .is_some_and(|entry| entry.service(&uuid).is_some())
        });
        known.then(|| Service::new(self.central.clone(), self.id.clone(), uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{FutureExt, StreamExt};

    fn manager() -> (ConnectionManager, ResultStream<ConnectionEvent>, Outbox) {
        let mut manager = ConnectionManager::new(PeripheralId::from("AA:BB"));
        let mut outbox = Outbox::default();
        let stream = manager.connect(
            &ConnectOptions::default().with_timeout_retries(1),
            &mut outbox,
        );
        (manager, stream, outbox)
    }

    #[test]
    fn test_connect_enters_connecting() {
        let (manager, stream, _) = manager();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(!stream.is_closed());
    }

    #[test]
    fn test_stale_timer_is_noop() {
        let (mut manager, _stream, mut outbox) = manager();
        let first = manager.attempt.map(|a| a.sequence).unwrap();
        manager.did_connect();
        manager.on_timeout(first, &mut outbox);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_connect_when_connected_reuses_stream() {
        let (mut manager, stream, mut outbox) = manager();
        manager.did_connect();
        let sequence = manager.guard.sequence();
        let again = manager.connect(&ConnectOptions::default(), &mut outbox);
        assert!(again.same_stream(&stream));
        assert_eq!(manager.guard.sequence(), sequence);
    }

    #[test]
    fn test_timeout_retry_budget() {
        let (mut manager, stream, mut outbox) = manager();
        let first = manager.guard.sequence();
        manager.on_timeout(first, &mut outbox);
        // 第一次超时后自动重试
        assert_eq!(manager.state(), ConnectionState::Connecting);
        let second = manager.guard.sequence();
        assert!(second > first);
        manager.on_timeout(second, &mut outbox);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(stream.is_closed());
        assert!(manager.attempt.is_none());
    }

    #[test]
    fn test_failure_while_disconnected_is_ignored() {
        let mut manager = ConnectionManager::new(PeripheralId::from("AA:BB"));
        manager.did_fail_to_connect(None);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reconnect_is_noop_while_connecting() {
        let (mut manager, _stream, mut outbox) = manager();
        let sequence = manager.guard.sequence();
        assert!(!manager.reconnect(&mut outbox));
        assert_eq!(manager.guard.sequence(), sequence);
    }

    #[test]
    fn test_disconnect_counter_resets_on_connect() {
        let mut manager = ConnectionManager::new(PeripheralId::from("AA:BB"));
        let mut outbox = Outbox::default();
        let stream = manager.connect(
            &ConnectOptions::default().with_disconnect_retries(1),
            &mut outbox,
        );
        manager.did_connect();
        manager.did_disconnect(None);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.reconnect(&mut outbox));
        manager.did_connect();
        // 重新连接成功后计数清零，再断开一次仍然可以重试
        manager.did_disconnect(None);
        assert!(!stream.is_closed());
        assert!(manager.reconnect(&mut outbox));
        manager.did_disconnect(None);
        manager.did_connect();
        assert!(stream.is_closed());
    }

    #[test]
    fn test_drop_after_unconfirmed_disconnect_is_unsolicited() {
        let (mut manager, stream, mut outbox) = manager();
        let mut events = stream.subscribe();
        manager.did_connect();
        // 传输层没有确认这次断开
        manager.disconnect(&mut outbox);
        assert_eq!(manager.state(), ConnectionState::Disconnecting);
        manager.connect(&ConnectOptions::default(), &mut outbox);
        manager.did_connect();

        manager.did_disconnect(None);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let received: Vec<_> = std::iter::from_fn(|| events.next().now_or_never().flatten()).collect();
        assert_eq!(
            received,
            vec![
                Ok(ConnectionEvent::Connect),
                Ok(ConnectionEvent::Connect),
                Ok(ConnectionEvent::Disconnect),
            ]
        );
    }
}
