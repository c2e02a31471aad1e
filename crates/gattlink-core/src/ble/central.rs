//! 中心设备
//!
//! [`Central`] 拥有所有外设的状态。所有状态变更（用户调用、传输层回调、
//! 超时触发）都在同一把锁下串行执行；锁内只做状态迁移和非阻塞的通道发送，
//! 传输层请求与发现钩子收集到 [`Outbox`] 中，释放锁之后再执行。

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::characteristic::{Characteristic, CharacteristicEngine};
use super::codec::{DiscoveredHook, ProfileRegistry};
use super::peripheral::{Peripheral, PeripheralEntry};
use super::timer::Timer;
use super::transport::{EventReceiver, Request, Transport, TransportEvent};
use super::{BleError, CharacteristicRef, PeripheralId};
use crate::config::CentralSettings;

/// 超时触发时投递回执行上下文的事件
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TimerEvent {
    Connect {
        peripheral: PeripheralId,
        sequence: u64,
    },
    Read {
        characteristic: CharacteristicRef,
        sequence: u64,
    },
    Write {
        characteristic: CharacteristicRef,
        sequence: u64,
    },
}

/// 锁内产生、锁外执行的副作用
#[derive(Default)]
pub(crate) struct Outbox {
    requests: Vec<Request>,
    timers: Vec<(Duration, TimerEvent)>,
    hooks: Vec<(DiscoveredHook, CharacteristicRef)>,
}

impl Outbox {
    pub(crate) fn request(&mut self, request: Request) {
        self.requests.push(request);
    }

    pub(crate) fn arm(&mut self, delay: Duration, event: TimerEvent) {
        self.timers.push((delay, event));
    }

    pub(crate) fn discovered(&mut self, hook: DiscoveredHook, characteristic: CharacteristicRef) {
        self.hooks.push((hook, characteristic));
    }
}

/// 所有外设的状态
#[derive(Default)]
pub(crate) struct Registry {
    peripherals: HashMap<PeripheralId, PeripheralEntry>,
}

impl Registry {
    /// 获取外设条目，不存在时注册
    pub(crate) fn peripheral_mut(&mut self, id: &PeripheralId) -> &mut PeripheralEntry {
        self.peripherals
            .entry(id.clone())
            .or_insert_with(|| PeripheralEntry::new(id.clone()))
    }

    pub(crate) fn peripheral(&self, id: &PeripheralId) -> Option<&PeripheralEntry> {
        self.peripherals.get(id)
    }

    /// 获取已注册的外设条目，不会注册新外设
    pub(crate) fn existing_mut(&mut self, id: &PeripheralId) -> Option<&mut PeripheralEntry> {
        self.peripherals.get_mut(id)
    }

    pub(crate) fn characteristic(
        &self,
        reference: &CharacteristicRef,
    ) -> Result<&CharacteristicEngine, BleError> {
        self.peripheral(&reference.peripheral)
            .ok_or_else(|| BleError::PeripheralNotFound(reference.peripheral.clone()))?
            .service(&reference.service)
            .ok_or(BleError::ServiceNotFound(reference.service))?
            .characteristic(&reference.uuid)
            .ok_or(BleError::CharacteristicNotFound(reference.uuid))
    }

    pub(crate) fn characteristic_mut(
        &mut self,
        reference: &CharacteristicRef,
    ) -> Option<&mut CharacteristicEngine> {
        self.existing_mut(&reference.peripheral)?
            .service_mut(&reference.service)?
            .characteristic_mut(&reference.uuid)
    }
}

pub(crate) struct Inner {
    transport: Arc<dyn Transport>,
    pub(crate) settings: CentralSettings,
    pub(crate) profiles: ProfileRegistry,
    timer: Timer,
    registry: Mutex<Registry>,
}

impl Inner {
    /// 在执行上下文中运行 `f`，然后执行它产生的副作用
    pub(crate) fn dispatch<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut Registry, &mut Outbox) -> R,
    ) -> R {
        let mut outbox = Outbox::default();
        let result = {
            let mut registry = self.registry.lock();
            f(&mut registry, &mut outbox)
        };
        self.flush(outbox);
        result
    }

    /// 只读访问
    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&Registry) -> R) -> R {
        f(&self.registry.lock())
    }

    /// 对已连接外设上的特征执行操作
    ///
    /// `f` 收到该特征的超时时间（连接时指定的值优先于设置中的默认值）。
    pub(crate) fn operate<R>(
        self: &Arc<Self>,
        reference: &CharacteristicRef,
        f: impl FnOnce(&mut CharacteristicEngine, &mut Outbox, Duration) -> R,
    ) -> Result<R, BleError> {
        let default_timeout = self.settings.characteristic_timeout();
        self.dispatch(|registry, outbox| {
            let entry = registry
                .existing_mut(&reference.peripheral)
                .ok_or_else(|| BleError::PeripheralNotFound(reference.peripheral.clone()))?;
            if !entry.is_connected() {
                return Err(BleError::NotConnected(reference.peripheral.clone()));
            }
            let timeout = entry.characteristic_timeout().unwrap_or(default_timeout);
            let engine = entry
                .service_mut(&reference.service)
                .ok_or(BleError::ServiceNotFound(reference.service))?
                .characteristic_mut(&reference.uuid)
                .ok_or(BleError::CharacteristicNotFound(reference.uuid))?;
            Ok(f(engine, outbox, timeout))
        })
    }

    fn flush(self: &Arc<Self>, outbox: Outbox) {
        for request in outbox.requests {
            trace!("-> {} {}", request.kind(), request.peripheral());
            self.transport.submit(request);
        }

        for (delay, event) in outbox.timers {
            let weak: Weak<Inner> = Arc::downgrade(self);
            self.timer.schedule_after(delay, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(event);
                }
            });
        }

        for (hook, reference) in outbox.hooks {
            let characteristic = Characteristic::new(self.clone(), reference);
            tokio::spawn(async move { hook(characteristic) });
        }
    }

    fn fire(self: &Arc<Self>, event: TimerEvent) {
        self.dispatch(|registry, outbox| match event {
            TimerEvent::Connect {
                peripheral,
                sequence,
            } => match registry.existing_mut(&peripheral) {
                Some(entry) => entry.link.on_timeout(sequence, outbox),
                None => debug!("Connect timer for unknown peripheral {}", peripheral),
            },
            TimerEvent::Read {
                characteristic,
                sequence,
            } => match registry.characteristic_mut(&characteristic) {
                Some(engine) => engine.on_read_timeout(sequence),
                None => debug!("Read timer for unknown characteristic {}", characteristic),
            },
            TimerEvent::Write {
                characteristic,
                sequence,
            } => match registry.characteristic_mut(&characteristic) {
                Some(engine) => engine.on_write_timeout(sequence),
                None => debug!("Write timer for unknown characteristic {}", characteristic),
            },
        });
    }

    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        trace!("<- {:?}", event);
        let routing = self.settings.update_routing;
        let profiles = &self.profiles;
        self.dispatch(|registry, outbox| match event {
            TransportEvent::Connected(peripheral) => match registry.existing_mut(&peripheral) {
                Some(entry) => entry.link.did_connect(),
                None => debug!("Connected callback for unknown peripheral {}", peripheral),
            },
            TransportEvent::FailedToConnect { peripheral, error } => {
                match registry.existing_mut(&peripheral) {
                    Some(entry) => entry.link.did_fail_to_connect(error),
                    None => debug!("Failure callback for unknown peripheral {}", peripheral),
                }
            }
            TransportEvent::Disconnected { peripheral, error } => {
                match registry.existing_mut(&peripheral) {
                    Some(entry) => entry.link.did_disconnect(error),
                    None => debug!("Disconnect callback for unknown peripheral {}", peripheral),
                }
            }
            TransportEvent::ServicesDiscovered {
                peripheral,
                services,
                error,
            } => match registry.existing_mut(&peripheral) {
                Some(entry) => entry.did_discover_services(services, error, profiles),
                None => debug!("Services for unknown peripheral {}", peripheral),
            },
            TransportEvent::CharacteristicsDiscovered {
                service,
                characteristics,
                error,
            } => match registry
                .existing_mut(&service.peripheral)
                .and_then(|entry| entry.service_mut(&service.uuid))
            {
                Some(entry) => {
                    entry.did_discover_characteristics(characteristics, error, profiles, outbox)
                }
                None => warn!("Characteristics for unknown service {}", service),
            },
            TransportEvent::ValueUpdated {
                characteristic,
                value,
                error,
            } => match registry.characteristic_mut(&characteristic) {
                Some(engine) => engine.did_update(value, error, routing),
                None => debug!("Value for unknown characteristic {}", characteristic),
            },
            TransportEvent::ValueWritten {
                characteristic,
                error,
            } => match registry.characteristic_mut(&characteristic) {
                Some(engine) => engine.did_write(error),
                None => debug!("Write ack for unknown characteristic {}", characteristic),
            },
            TransportEvent::NotificationStateUpdated {
                characteristic,
                enabled,
                error,
            } => match registry.characteristic_mut(&characteristic) {
                Some(engine) => engine.did_update_notification_state(enabled, error),
                None => debug!(
                    "Notification state for unknown characteristic {}",
                    characteristic
                ),
            },
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // 未触发的定时器随中心设备一起作废
        self.timer.shutdown();
    }
}

/// BLE 中心设备
#[derive(Clone)]
pub struct Central {
    inner: Arc<Inner>,
}

impl Central {
    pub fn new(transport: Arc<dyn Transport>, settings: CentralSettings) -> Self {
        Self::with_profiles(transport, settings, ProfileRegistry::default())
    }

    pub fn with_profiles(
        transport: Arc<dyn Transport>,
        settings: CentralSettings,
        profiles: ProfileRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                settings,
                profiles,
                timer: Timer::new(),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn settings(&self) -> &CentralSettings {
        &self.inner.settings
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.inner.profiles
    }

    /// 获取外设句柄，首次使用时注册
    pub fn peripheral(&self, id: impl Into<PeripheralId>) -> Peripheral {
        let id = id.into();
        self.inner.dispatch(|registry, _| {
            registry.peripheral_mut(&id);
        });
        Peripheral::new(self.inner.clone(), id)
    }

    /// 所有已注册的外设
    pub fn peripherals(&self) -> Vec<Peripheral> {
        let mut ids: Vec<PeripheralId> = self
            .inner
            .inspect(|registry| registry.peripherals.keys().cloned().collect());
        ids.sort();
        ids.into_iter()
            .map(|id| Peripheral::new(self.inner.clone(), id))
            .collect()
    }

    /// 处理一条传输层回调
    pub fn handle_event(&self, event: TransportEvent) {
        self.inner.handle_event(event);
    }

    /// 持续处理传输层事件，直到通道关闭或中心设备被丢弃
    pub fn listen(&self, mut events: EventReceiver) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_event(event);
            }
            debug!("Transport event pump stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::service::Service;
    use crate::ble::simulated::SimTransport;
    use uuid::Uuid;

    fn central() -> Central {
        Central::new(Arc::new(SimTransport::new()), CentralSettings::default())
    }

    #[tokio::test]
    async fn test_lookups_do_not_register_peripherals() {
        let central = central();
        let unknown = PeripheralId::from("00:11:22:33:44:55");
        let service = Service::new(central.inner.clone(), unknown.clone(), Uuid::from_u128(0x180f));

        let result = service.discover_characteristics(None).await;
        assert_eq!(result.unwrap_err(), BleError::PeripheralNotFound(unknown.clone()));

        let characteristic = Characteristic::new(
            central.inner.clone(),
            service.reference().characteristic(Uuid::from_u128(0x2a19)),
        );
        assert_eq!(
            characteristic.read().await,
            Err(BleError::PeripheralNotFound(unknown))
        );
        assert!(central.peripherals().is_empty());
    }

    #[tokio::test]
    async fn test_peripheral_handle_registers_once() {
        let central = central();
        let first = central.peripheral("AA:BB:CC:DD:EE:FF");
        let second = central.peripheral("AA:BB:CC:DD:EE:FF");
        assert_eq!(first.id(), second.id());
        assert_eq!(central.peripherals().len(), 1);
        assert!(!first.reconnect());
    }
}
