//! 进程内模拟传输层
//!
//! 记录收到的每个请求；挂接事件通道并注册设备后，按设备模型异步回应
//! （可选延迟）。未注册的设备不会得到任何回应，适合测试超时路径。

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use uuid::Uuid;

use super::transport::{
    DiscoveredCharacteristic, EventSender, Request, Transport, TransportError, TransportEvent,
};
use super::{CharacteristicRef, PeripheralId, Properties, WriteType};

/// 模拟特征
#[derive(Debug, Clone)]
pub struct SimCharacteristic {
    pub uuid: Uuid,
    pub properties: Properties,
    pub value: Vec<u8>,
    notifying: bool,
}

impl SimCharacteristic {
    pub fn new(uuid: Uuid, properties: Properties, value: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid,
            properties,
            value: value.into(),
            notifying: false,
        }
    }
}

/// 模拟服务
#[derive(Debug, Clone)]
pub struct SimService {
    pub uuid: Uuid,
    pub characteristics: Vec<SimCharacteristic>,
}

impl SimService {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: SimCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// 模拟设备
#[derive(Debug, Clone, Default)]
pub struct SimDevice {
    pub services: Vec<SimService>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: SimService) -> Self {
        self.services.push(service);
        self
    }

    fn characteristic_mut(&mut self, reference: &CharacteristicRef) -> Option<&mut SimCharacteristic> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == reference.service)?
            .characteristics
            .iter_mut()
            .find(|c| c.uuid == reference.uuid)
    }
}

/// 模拟传输层
#[derive(Default)]
pub struct SimTransport {
    requests: Mutex<Vec<Request>>,
    devices: Mutex<HashMap<PeripheralId, SimDevice>>,
    events: Option<EventSender>,
    latency: Duration,
}

impl SimTransport {
    /// 只记录请求，从不回应
    pub fn new() -> Self {
        Self::default()
    }

    /// 回应已注册设备的请求
    pub fn with_events(events: EventSender) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn add_device(&self, id: impl Into<PeripheralId>, device: SimDevice) {
        self.devices.lock().insert(id.into(), device);
    }

    pub fn remove_device(&self, id: &PeripheralId) {
        self.devices.lock().remove(id);
    }

    /// 当前存储的特征值
    pub fn value(&self, reference: &CharacteristicRef) -> Option<Vec<u8>> {
        self.devices
            .lock()
            .get_mut(&reference.peripheral)?
            .characteristic_mut(reference)
            .map(|c| c.value.clone())
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// 某类请求（见 [`Request::kind`]）的数量
    pub fn count(&self, kind: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.kind() == kind)
            .count()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    /// 设备推送通知（仅在已开启通知时送达）
    pub fn notify(&self, reference: &CharacteristicRef, value: impl Into<Vec<u8>>) -> bool {
        let value = value.into();
        let delivered = {
            let mut devices = self.devices.lock();
            match devices
                .get_mut(&reference.peripheral)
                .and_then(|d| d.characteristic_mut(reference))
            {
                Some(c) if c.notifying => {
                    c.value = value.clone();
                    true
                }
                _ => false,
            }
        };
        if delivered {
            self.deliver(TransportEvent::ValueUpdated {
                characteristic: reference.clone(),
                value,
                error: None,
            });
        }
        delivered
    }

    /// 设备主动断开
    pub fn drop_connection(&self, id: &PeripheralId) {
        self.deliver(TransportEvent::Disconnected {
            peripheral: id.clone(),
            error: Some(TransportError::new(19, "remote user terminated connection")),
        });
    }

    fn deliver(&self, event: TransportEvent) {
        let Some(events) = self.events.clone() else {
            return;
        };
        if self.latency.is_zero() {
            let _ = events.send(event);
        } else {
            let latency = self.latency;
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let _ = events.send(event);
            });
        }
    }

    /// 按设备模型计算请求的回应
    fn respond(&self, request: &Request) -> Option<TransportEvent> {
        let mut devices = self.devices.lock();
        let device = devices.get_mut(request.peripheral())?;
        let event = match request {
            Request::Connect(peripheral) => TransportEvent::Connected(peripheral.clone()),
            Request::CancelConnect(_) => return None,
            Request::Disconnect(peripheral) => TransportEvent::Disconnected {
                peripheral: peripheral.clone(),
                error: None,
            },
            Request::DiscoverServices { peripheral, uuids } => TransportEvent::ServicesDiscovered {
                peripheral: peripheral.clone(),
                services: device
                    .services
                    .iter()
                    .map(|s| s.uuid)
                    .filter(|uuid| uuids.as_ref().is_none_or(|wanted| wanted.contains(uuid)))
                    .collect(),
                error: None,
            },
            Request::DiscoverCharacteristics { service, uuids } => {
                match device.services.iter().find(|s| s.uuid == service.uuid) {
                    Some(found) => TransportEvent::CharacteristicsDiscovered {
                        service: service.clone(),
                        characteristics: found
                            .characteristics
                            .iter()
                            .filter(|c| uuids.as_ref().is_none_or(|wanted| wanted.contains(&c.uuid)))
                            .map(|c| DiscoveredCharacteristic::new(c.uuid, c.properties))
                            .collect(),
                        error: None,
                    },
                    None => TransportEvent::CharacteristicsDiscovered {
                        service: service.clone(),
                        characteristics: Vec::new(),
                        error: Some(TransportError::new(10, "attribute not found")),
                    },
                }
            }
            Request::ReadValue(reference) => {
                let characteristic = device.characteristic_mut(reference)?;
                TransportEvent::ValueUpdated {
                    characteristic: reference.clone(),
                    value: characteristic.value.clone(),
                    error: None,
                }
            }
            Request::WriteValue {
                characteristic: reference,
                data,
                write_type,
            } => {
                let characteristic = device.characteristic_mut(reference)?;
                characteristic.value = data.clone();
                // 与真实硬件一致：无响应写入没有确认
                if *write_type == WriteType::WithoutResponse {
                    return None;
                }
                TransportEvent::ValueWritten {
                    characteristic: reference.clone(),
                    error: None,
                }
            }
            Request::SetNotify {
                characteristic: reference,
                enabled,
            } => {
                let characteristic = device.characteristic_mut(reference)?;
                characteristic.notifying = *enabled;
                TransportEvent::NotificationStateUpdated {
                    characteristic: reference.clone(),
                    enabled: *enabled,
                    error: None,
                }
            }
        };
        Some(event)
    }
}

impl Transport for SimTransport {
    fn submit(&self, request: Request) {
        debug!("sim: {} {}", request.kind(), request.peripheral());
        let response = if self.events.is_some() {
            self.respond(&request)
        } else {
            None
        };
        self.requests.lock().push(request);
        if let Some(event) = response {
            self.deliver(event);
        }
    }
}
