//! 特征读/写/通知引擎
//!
//! 读和写各有一个序列号守卫：发起操作时安排超时，超时触发时若序列号已过期
//! 则什么也不做。同一时间每类操作只有一个待完成的结果，新的操作会取代旧的，
//! 被取代的结果以 [`BleError::Cancelled`] 结束。

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use uuid::Uuid;

use super::central::{Inner, Outbox, TimerEvent};
use super::codec::{CharacteristicProfile, StringValues};
use super::sequence::SequenceGuard;
use super::transport::Request;
use super::{BleError, CharacteristicRef, PeripheralId, Properties, TransportError, WriteType};
use crate::config::{UpdateRouting, WriteWithoutResponsePolicy};
use crate::deferred::{Deferred, Promise, ResultStream, StreamPromise};

/// 最近配置的值接收方（仅在 [`UpdateRouting::Exclusive`] 下有意义）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Receiver {
    Read,
    Updates,
}

/// 注册表中单个特征的状态
pub(crate) struct CharacteristicEngine {
    reference: CharacteristicRef,
    properties: Properties,
    profile: CharacteristicProfile,
    value: Option<Vec<u8>>,
    notifying: bool,
    read_guard: SequenceGuard,
    write_guard: SequenceGuard,
    pending_read: Option<Promise<Vec<u8>>>,
    pending_write: Option<Promise<()>>,
    pending_notify: Option<Promise<()>>,
    updates: Option<StreamPromise<Vec<u8>>>,
    last_configured: Receiver,
}

impl CharacteristicEngine {
    pub(crate) fn new(
        reference: CharacteristicRef,
        properties: Properties,
        profile: CharacteristicProfile,
    ) -> Self {
        Self {
            reference,
            properties,
            profile,
            value: None,
            notifying: false,
            read_guard: SequenceGuard::new(),
            write_guard: SequenceGuard::new(),
            pending_read: None,
            pending_write: None,
            pending_notify: None,
            updates: None,
            last_configured: Receiver::Read,
        }
    }

    pub(crate) fn uuid(&self) -> Uuid {
        self.reference.uuid
    }

    pub(crate) fn set_properties(&mut self, properties: Properties) {
        self.properties = properties;
    }

    fn require(&self, property: Properties, operation: &'static str) -> Result<(), BleError> {
        if self.properties.intersects(property) {
            Ok(())
        } else {
            Err(BleError::CapabilityUnsupported {
                uuid: self.reference.uuid,
                operation,
            })
        }
    }

    fn require_notifiable(&self, operation: &'static str) -> Result<(), BleError> {
        self.require(Properties::NOTIFY | Properties::INDICATE, operation)
    }

    pub(crate) fn read(&mut self, timeout: Duration, outbox: &mut Outbox) -> Deferred<Vec<u8>> {
        if let Err(e) = self.require(Properties::READ, "read") {
            return Deferred::failed(e);
        }
        let sequence = self.read_guard.begin();
        let promise = Promise::new();
        let deferred = promise.deferred();
        if self.pending_read.replace(promise).is_some() {
            debug!("Superseding pending read of {}", self.reference);
        }
        self.last_configured = Receiver::Read;
        outbox.request(Request::ReadValue(self.reference.clone()));
        outbox.arm(
            timeout,
            TimerEvent::Read {
                characteristic: self.reference.clone(),
                sequence,
            },
        );
        deferred
    }

    pub(crate) fn on_read_timeout(&mut self, sequence: u64) {
        if !self.read_guard.is_current(sequence) {
            debug!("Read timer {} for {} expired", sequence, self.reference);
            return;
        }
        self.read_guard.finish();
        warn!("Read of {} timed out", self.reference);
        if let Some(promise) = self.pending_read.take() {
            promise.fail(BleError::ReadTimeout(self.reference.uuid));
        }
    }

    pub(crate) fn write(
        &mut self,
        data: Vec<u8>,
        write_type: WriteType,
        timeout: Duration,
        policy: WriteWithoutResponsePolicy,
        outbox: &mut Outbox,
    ) -> Deferred<()> {
        let operation = match write_type {
            WriteType::WithResponse => "write",
            WriteType::WithoutResponse => "write without response",
        };
        if let Err(e) = self.require(write_type.required_property(), operation) {
            return Deferred::failed(e);
        }
        let sequence = self.write_guard.begin();
        outbox.request(Request::WriteValue {
            characteristic: self.reference.clone(),
            data,
            write_type,
        });

        if write_type == WriteType::WithoutResponse
            && policy == WriteWithoutResponsePolicy::ResolveOnSubmit
        {
            self.write_guard.finish();
            self.pending_write = None;
            return Deferred::ok(());
        }

        let promise = Promise::new();
        let deferred = promise.deferred();
        if self.pending_write.replace(promise).is_some() {
            debug!("Superseding pending write of {}", self.reference);
        }
        outbox.arm(
            timeout,
            TimerEvent::Write {
                characteristic: self.reference.clone(),
                sequence,
            },
        );
        deferred
    }

    pub(crate) fn on_write_timeout(&mut self, sequence: u64) {
        if !self.write_guard.is_current(sequence) {
            debug!("Write timer {} for {} expired", sequence, self.reference);
            return;
        }
        self.write_guard.finish();
        warn!("Write of {} timed out", self.reference);
        if let Some(promise) = self.pending_write.take() {
            promise.fail(BleError::WriteTimeout(self.reference.uuid));
        }
    }

    fn set_notify(&mut self, enabled: bool, outbox: &mut Outbox) -> Deferred<()> {
        let operation = if enabled {
            "start notifying"
        } else {
            "stop notifying"
        };
        if let Err(e) = self.require_notifiable(operation) {
            return Deferred::failed(e);
        }
        let promise = Promise::new();
        let deferred = promise.deferred();
        self.pending_notify = Some(promise);
        outbox.request(Request::SetNotify {
            characteristic: self.reference.clone(),
            enabled,
        });
        deferred
    }

    fn start_updates(&mut self) -> Result<ResultStream<Vec<u8>>, BleError> {
        self.require_notifiable("updates")?;
        let updates = StreamPromise::new();
        let stream = updates.stream();
        // 旧的订阅流随之关闭
        self.updates = Some(updates);
        self.last_configured = Receiver::Updates;
        Ok(stream)
    }

    fn stop_updates(&mut self) {
        self.updates = None;
    }

    /// 读响应或通知
    pub(crate) fn did_update(
        &mut self,
        value: Vec<u8>,
        error: Option<TransportError>,
        routing: UpdateRouting,
    ) {
        let outcome = match error {
            None => {
                self.value = Some(value.clone());
                Ok(value)
            }
            Some(error) => {
                warn!("Value update for {} failed: {}", self.reference, error);
                Err(BleError::Transport(error))
            }
        };

        let reading = self.read_guard.in_flight() && self.pending_read.is_some();
        let to_read = match routing {
            UpdateRouting::Shared => reading,
            UpdateRouting::Exclusive => {
                reading && (self.last_configured == Receiver::Read || self.updates.is_none())
            }
        };
        let to_updates = match routing {
            UpdateRouting::Shared => self.updates.is_some(),
            UpdateRouting::Exclusive => self.updates.is_some() && !to_read,
        };

        if self.read_guard.in_flight() {
            self.read_guard.finish();
            let pending = self.pending_read.take();
            match pending {
                Some(promise) if to_read => {
                    promise.complete(outcome.clone());
                }
                // 值归订阅所有，被取代的读随 promise 丢弃以 Cancelled 结束
                Some(_) => debug!("Read of {} superseded by updates", self.reference),
                None => {}
            }
        }
        if to_updates {
            if let Some(updates) = &self.updates {
                updates.emit(outcome);
            }
        } else if !to_read {
            debug!("No receiver for value update of {}", self.reference);
        }
    }

    pub(crate) fn did_write(&mut self, error: Option<TransportError>) {
        if !self.write_guard.in_flight() {
            debug!("Dropping late write confirmation for {}", self.reference);
            return;
        }
        self.write_guard.finish();
        if let Some(promise) = self.pending_write.take() {
            match error {
                None => promise.succeed(()),
                Some(error) => promise.fail(BleError::Transport(error)),
            };
        }
    }

    pub(crate) fn did_update_notification_state(
        &mut self,
        enabled: bool,
        error: Option<TransportError>,
    ) {
        let pending = self.pending_notify.take();
        match error {
            None => {
                self.notifying = enabled;
                debug!("Notifications for {} now {}", self.reference, enabled);
                if let Some(promise) = pending {
                    promise.succeed(());
                }
            }
            Some(error) => {
                warn!("Notification state of {} failed: {}", self.reference, error);
                if let Some(promise) = pending {
                    promise.fail(BleError::Transport(error));
                }
            }
        }
    }

    fn encode_strings(&self, values: &StringValues) -> Result<Vec<u8>, BleError> {
        self.profile
            .codec
            .encode_strings(values)
            .map_err(|e| self.serialization_failed(e.0))
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, BleError> {
        self.profile
            .codec
            .encode_value(value)
            .map_err(|e| self.serialization_failed(e.0))
    }

    fn serialization_failed(&self, reason: String) -> BleError {
        BleError::SerializationFailed {
            uuid: self.reference.uuid,
            reason,
        }
    }
}

/// 特征句柄
#[derive(Clone)]
pub struct Characteristic {
    central: Arc<Inner>,
    reference: CharacteristicRef,
}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("reference", &self.reference)
            .finish()
    }
}

impl Characteristic {
    pub(crate) fn new(central: Arc<Inner>, reference: CharacteristicRef) -> Self {
        Self { central, reference }
    }

    pub fn uuid(&self) -> Uuid {
        self.reference.uuid
    }

    pub fn service_uuid(&self) -> Uuid {
        self.reference.service
    }

    pub fn peripheral_id(&self) -> &PeripheralId {
        &self.reference.peripheral
    }

    pub fn reference(&self) -> &CharacteristicRef {
        &self.reference
    }

    fn inspect<R>(&self, f: impl FnOnce(&CharacteristicEngine) -> R) -> Option<R> {
        self.central
            .inspect(|registry| registry.characteristic(&self.reference).ok().map(f))
    }

    pub fn name(&self) -> String {
        self.inspect(|engine| engine.profile.name.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn properties(&self) -> Properties {
        self.inspect(|engine| engine.properties)
            .unwrap_or_default()
    }

    pub fn property_enabled(&self, property: Properties) -> bool {
        self.properties().contains(property)
    }

    pub fn is_notifying(&self) -> bool {
        self.inspect(|engine| engine.notifying).unwrap_or(false)
    }

    /// 最近一次读到或收到的值
    pub fn value(&self) -> Option<Vec<u8>> {
        self.inspect(|engine| engine.value.clone()).flatten()
    }

    /// 用配置档的编解码器解码缓存值
    pub fn string_values(&self) -> Option<StringValues> {
        self.inspect(|engine| {
            engine
                .value
                .as_deref()
                .and_then(|data| engine.profile.codec.decode_strings(data))
        })
        .flatten()
    }

    pub fn json_value(&self) -> Option<Value> {
        self.inspect(|engine| {
            engine
                .value
                .as_deref()
                .and_then(|data| engine.profile.codec.decode_value(data))
        })
        .flatten()
    }

    pub fn discrete_values(&self) -> Vec<String> {
        self.inspect(|engine| engine.profile.discrete_values.clone())
            .unwrap_or_default()
    }

    pub fn read(&self) -> Deferred<Vec<u8>> {
        self.central
            .operate(&self.reference, |engine, outbox, timeout| {
                engine.read(timeout, outbox)
            })
            .unwrap_or_else(Deferred::failed)
    }

    pub fn write(&self, data: Vec<u8>, write_type: WriteType) -> Deferred<()> {
        let policy = self.central.settings.write_without_response;
        self.central
            .operate(&self.reference, |engine, outbox, timeout| {
                engine.write(data, write_type, timeout, policy, outbox)
            })
            .unwrap_or_else(Deferred::failed)
    }

    /// 先用配置档编码，失败时不会发出任何传输层请求
    pub fn write_strings(&self, values: &StringValues, write_type: WriteType) -> Deferred<()> {
        match self.encoded(|engine| engine.encode_strings(values)) {
            Ok(data) => self.write(data, write_type),
            Err(e) => Deferred::failed(e),
        }
    }

    pub fn write_value(&self, value: &Value, write_type: WriteType) -> Deferred<()> {
        match self.encoded(|engine| engine.encode_value(value)) {
            Ok(data) => self.write(data, write_type),
            Err(e) => Deferred::failed(e),
        }
    }

    fn encoded(
        &self,
        encode: impl FnOnce(&CharacteristicEngine) -> Result<Vec<u8>, BleError>,
    ) -> Result<Vec<u8>, BleError> {
        self.central.inspect(|registry| {
            let engine = registry.characteristic(&self.reference)?;
            encode(engine)
        })
    }

    pub fn start_notifying(&self) -> Deferred<()> {
        self.central
            .operate(&self.reference, |engine, outbox, _| {
                engine.set_notify(true, outbox)
            })
            .unwrap_or_else(Deferred::failed)
    }

    pub fn stop_notifying(&self) -> Deferred<()> {
        self.central
            .operate(&self.reference, |engine, outbox, _| {
                engine.set_notify(false, outbox)
            })
            .unwrap_or_else(Deferred::failed)
    }

    /// 订阅值更新（读响应与通知），取代之前的订阅
    pub fn start_updates(&self) -> Result<ResultStream<Vec<u8>>, BleError> {
        self.central
            .operate(&self.reference, |engine, _, _| engine.start_updates())?
    }

    pub fn stop_updates(&self) {
        self.central.dispatch(|registry, _| {
            if let Some(engine) = registry.characteristic_mut(&self.reference) {
                engine.stop_updates();
            }
        });
    }
}
