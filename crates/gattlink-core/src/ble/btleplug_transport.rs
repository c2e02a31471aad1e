//! 基于 btleplug 的真实 BLE 传输层
//!
//! 每个请求在独立任务中执行，结果通过事件通道送回 `Central`。
//! 断开事件统一来自适配器的 `CentralEvent::DeviceDisconnected`。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    Central as _, CentralEvent, Characteristic as BtCharacteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType as BtWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use super::transport::{
    DiscoveredCharacteristic, EventSender, Request, Transport, TransportError, TransportEvent,
};
use super::{CharacteristicRef, PeripheralId, Properties, ServiceRef, WriteType};

/// btleplug 传输层错误
#[derive(Debug, thiserror::Error)]
pub enum BtleplugTransportError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

/// 扫描到的设备
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub id: PeripheralId,
    pub name: String,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

pub struct BtleplugTransport {
    adapter: Adapter,
    events: EventSender,
    connecting: Arc<Mutex<HashMap<PeripheralId, JoinHandle<()>>>>,
    /// 每个外设至多一个通知转发任务
    notifications: Arc<Mutex<HashMap<PeripheralId, JoinHandle<()>>>>,
    watcher: JoinHandle<()>,
}

impl BtleplugTransport {
    /// 打开第一个适配器并开始监听断开事件
    pub async fn new(events: EventSender) -> Result<Self, BtleplugTransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(BtleplugTransportError::NoAdapter)?;

        let notifications: Arc<Mutex<HashMap<PeripheralId, JoinHandle<()>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut central_events = adapter.events().await?;
        let watcher = {
            let adapter = adapter.clone();
            let events = events.clone();
            let notifications = notifications.clone();
            tokio::spawn(async move {
                while let Some(event) = central_events.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        let Ok(peripheral) = adapter.peripheral(&id).await else {
                            continue;
                        };
                        let peripheral = PeripheralId::new(peripheral.address().to_string());
                        debug!("Adapter reports {} disconnected", peripheral);
                        if let Some(forwarder) = notifications.lock().remove(&peripheral) {
                            forwarder.abort();
                        }
                        let _ = events.send(TransportEvent::Disconnected {
                            peripheral,
                            error: None,
                        });
                    }
                }
            })
        };

        Ok(Self {
            adapter,
            events,
            connecting: Arc::new(Mutex::new(HashMap::new())),
            notifications,
            watcher,
        })
    }

    /// 扫描一段时间，返回广播了 `services` 中任一服务的设备（为空则全部）
    pub async fn scan(
        &self,
        duration: Duration,
        services: Vec<Uuid>,
    ) -> Result<Vec<ScannedDevice>, BtleplugTransportError> {
        self.adapter
            .start_scan(ScanFilter {
                services: services.clone(),
            })
            .await?;
        time::sleep(duration).await;

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Some(properties) = peripheral.properties().await? {
                if !services.is_empty() && !properties.services.iter().any(|s| services.contains(s)) {
                    continue;
                }
                found.push(ScannedDevice {
                    id: PeripheralId::new(properties.address.to_string()),
                    name: properties
                        .local_name
                        .unwrap_or_else(|| "Unknown".to_string()),
                    rssi: properties.rssi,
                    services: properties.services,
                });
            }
        }
        self.adapter.stop_scan().await?;
        Ok(found)
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.watcher.abort();
        for (_, forwarder) in self.notifications.lock().drain() {
            forwarder.abort();
        }
    }
}

async fn find_device(adapter: &Adapter, id: &PeripheralId) -> Result<PlatformPeripheral, TransportError> {
    let peripherals = adapter.peripherals().await.map_err(bluetooth_error)?;
    for peripheral in peripherals {
        if peripheral.address().to_string().to_uppercase() == id.as_str().to_uppercase() {
            return Ok(peripheral);
        }
    }
    Err(TransportError::new(2, format!("device {id} not found")))
}

fn find_characteristic(
    peripheral: &PlatformPeripheral,
    reference: &CharacteristicRef,
) -> Result<BtCharacteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == reference.uuid && c.service_uuid == reference.service)
        .ok_or_else(|| TransportError::new(10, format!("characteristic {} not found", reference.uuid)))
}

fn bluetooth_error(error: btleplug::Error) -> TransportError {
    TransportError::new(-1, error.to_string())
}

/// 把通知转发为值更新
async fn forward_notifications(peripheral: PlatformPeripheral, id: PeripheralId, events: EventSender) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot listen for notifications from {}: {}", id, e);
            return;
        }
    };
    while let Some(notification) = notifications.next().await {
        let service = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == notification.uuid)
            .map(|c| c.service_uuid);
        let Some(service) = service else {
            debug!("Notification for unknown characteristic {}", notification.uuid);
            continue;
        };
        let sent = events.send(TransportEvent::ValueUpdated {
            characteristic: ServiceRef::new(id.clone(), service).characteristic(notification.uuid),
            value: notification.value,
            error: None,
        });
        if sent.is_err() {
            break;
        }
    }
}

impl Transport for BtleplugTransport {
    fn submit(&self, request: Request) {
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        match request {
            Request::Connect(id) => {
                let connecting = self.connecting.clone();
                let notifications = self.notifications.clone();
                let key = id.clone();
                let handle = tokio::spawn(async move {
                    let result = async {
                        let peripheral = find_device(&adapter, &id).await?;
                        info!("Connecting to {}", id);
                        peripheral.connect().await.map_err(bluetooth_error)?;
                        Ok::<_, TransportError>(peripheral)
                    }
                    .await;
                    connecting.lock().remove(&id);
                    match result {
                        Ok(peripheral) => {
                            let forwarder = tokio::spawn(forward_notifications(
                                peripheral,
                                id.clone(),
                                events.clone(),
                            ));
                            if let Some(previous) = notifications.lock().insert(id.clone(), forwarder) {
                                previous.abort();
                            }
                            let _ = events.send(TransportEvent::Connected(id));
                        }
                        Err(error) => {
                            let _ = events.send(TransportEvent::FailedToConnect {
                                peripheral: id,
                                error: Some(error),
                            });
                        }
                    }
                });
                if let Some(previous) = self.connecting.lock().insert(key, handle) {
                    previous.abort();
                }
            }
            Request::CancelConnect(id) => {
                if let Some(pending) = self.connecting.lock().remove(&id) {
                    debug!("Aborting pending connection to {}", id);
                    pending.abort();
                }
            }
            Request::Disconnect(id) => {
                if let Some(forwarder) = self.notifications.lock().remove(&id) {
                    forwarder.abort();
                }
                tokio::spawn(async move {
                    let result = async {
                        let peripheral = find_device(&adapter, &id).await?;
                        peripheral.disconnect().await.map_err(bluetooth_error)
                    }
                    .await;
                    // 成功时由适配器的 DeviceDisconnected 报告
                    if let Err(error) = result {
                        warn!("Disconnect from {} failed: {}", id, error);
                        let _ = events.send(TransportEvent::Disconnected {
                            peripheral: id,
                            error: Some(error),
                        });
                    }
                });
            }
            Request::DiscoverServices { peripheral: id, uuids } => {
                tokio::spawn(async move {
                    let result = async {
                        let peripheral = find_device(&adapter, &id).await?;
                        peripheral.discover_services().await.map_err(bluetooth_error)?;
                        Ok::<_, TransportError>(
                            peripheral
                                .services()
                                .into_iter()
                                .map(|s| s.uuid)
                                .filter(|u| uuids.as_ref().is_none_or(|wanted| wanted.contains(u)))
                                .collect(),
                        )
                    }
                    .await;
                    let (services, error) = match result {
                        Ok(services) => (services, None),
                        Err(e) => (Vec::new(), Some(e)),
                    };
                    let _ = events.send(TransportEvent::ServicesDiscovered {
                        peripheral: id,
                        services,
                        error,
                    });
                });
            }
            Request::DiscoverCharacteristics { service, uuids } => {
                tokio::spawn(async move {
                    // btleplug 在发现服务时已经取得了全部特征
                    let result = async {
                        let peripheral = find_device(&adapter, &service.peripheral).await?;
                        let found = peripheral
                            .services()
                            .into_iter()
                            .find(|s| s.uuid == service.uuid)
                            .ok_or_else(|| TransportError::new(10, format!("service {} not found", service.uuid)))?;
                        Ok::<_, TransportError>(
                            found
                                .characteristics
                                .into_iter()
                                .filter(|c| uuids.as_ref().is_none_or(|wanted| wanted.contains(&c.uuid)))
                                .map(|c| {
                                    DiscoveredCharacteristic::new(
                                        c.uuid,
                                        Properties::from_bits(c.properties.bits()),
                                    )
                                })
                                .collect(),
                        )
                    }
                    .await;
                    let (characteristics, error) = match result {
                        Ok(found) => (found, None),
                        Err(e) => (Vec::new(), Some(e)),
                    };
                    let _ = events.send(TransportEvent::CharacteristicsDiscovered {
                        service,
                        characteristics,
                        error,
                    });
                });
            }
            Request::ReadValue(reference) => {
                tokio::spawn(async move {
                    let result = async {
                        let peripheral = find_device(&adapter, &reference.peripheral).await?;
                        let characteristic = find_characteristic(&peripheral, &reference)?;
                        peripheral.read(&characteristic).await.map_err(bluetooth_error)
                    }
                    .await;
                    let (value, error) = match result {
                        Ok(value) => (value, None),
                        Err(e) => (Vec::new(), Some(e)),
                    };
                    let _ = events.send(TransportEvent::ValueUpdated {
                        characteristic: reference,
                        value,
                        error,
                    });
                });
            }
            Request::WriteValue {
                characteristic: reference,
                data,
                write_type,
            } => {
                tokio::spawn(async move {
                    let bt_write_type = match write_type {
                        WriteType::WithResponse => BtWriteType::WithResponse,
                        WriteType::WithoutResponse => BtWriteType::WithoutResponse,
                    };
                    let result = async {
                        let peripheral = find_device(&adapter, &reference.peripheral).await?;
                        let characteristic = find_characteristic(&peripheral, &reference)?;
                        peripheral
                            .write(&characteristic, &data, bt_write_type)
                            .await
                            .map_err(bluetooth_error)
                    }
                    .await;
                    let _ = events.send(TransportEvent::ValueWritten {
                        characteristic: reference,
                        error: result.err(),
                    });
                });
            }
            Request::SetNotify {
                characteristic: reference,
                enabled,
            } => {
                tokio::spawn(async move {
                    let result = async {
                        let peripheral = find_device(&adapter, &reference.peripheral).await?;
                        let characteristic = find_characteristic(&peripheral, &reference)?;
                        let result = if enabled {
                            peripheral.subscribe(&characteristic).await
                        } else {
                            peripheral.unsubscribe(&characteristic).await
                        };
                        result.map_err(bluetooth_error)
                    }
                    .await;
                    let _ = events.send(TransportEvent::NotificationStateUpdated {
                        characteristic: reference,
                        enabled,
                        error: result.err(),
                    });
                });
            }
        }
    }
}
