//! 传输层抽象
//!
//! 底层蓝牙栈（btleplug、模拟器等）是外部协作者：核心通过 [`Transport::submit`]
//! 发出非阻塞请求，传输层稍后通过 [`TransportEvent`] 把回调送回
//! [`Central`](super::central::Central)。
//!
//! 实现不得在 `submit` 内同步回调 `Central`；回调应通过事件通道异步投递。

use tokio::sync::mpsc;
use uuid::Uuid;

use super::{CharacteristicRef, PeripheralId, Properties, ServiceRef, WriteType};

/// 底层蓝牙栈报告的错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct TransportError {
    pub code: i32,
    pub message: String,
}

impl TransportError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// 核心发给传输层的请求
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Connect(PeripheralId),
    /// 放弃尚未完成的连接；不会产生断开回调
    CancelConnect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices {
        peripheral: PeripheralId,
        uuids: Option<Vec<Uuid>>,
    },
    DiscoverCharacteristics {
        service: ServiceRef,
        uuids: Option<Vec<Uuid>>,
    },
    ReadValue(CharacteristicRef),
    WriteValue {
        characteristic: CharacteristicRef,
        data: Vec<u8>,
        write_type: WriteType,
    },
    SetNotify {
        characteristic: CharacteristicRef,
        enabled: bool,
    },
}

impl Request {
    pub fn peripheral(&self) -> &PeripheralId {
        match self {
            Request::Connect(p) | Request::CancelConnect(p) | Request::Disconnect(p) => p,
            Request::DiscoverServices { peripheral, .. } => peripheral,
            Request::DiscoverCharacteristics { service, .. } => &service.peripheral,
            Request::ReadValue(c) => &c.peripheral,
            Request::WriteValue { characteristic, .. } | Request::SetNotify { characteristic, .. } => {
                &characteristic.peripheral
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Connect(_) => "connect",
            Request::CancelConnect(_) => "cancel-connect",
            Request::Disconnect(_) => "disconnect",
            Request::DiscoverServices { .. } => "discover-services",
            Request::DiscoverCharacteristics { .. } => "discover-characteristics",
            Request::ReadValue(_) => "read",
            Request::WriteValue { .. } => "write",
            Request::SetNotify { .. } => "set-notify",
        }
    }
}

/// 特征发现结果中的单个特征
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub properties: Properties,
}

impl DiscoveredCharacteristic {
    pub fn new(uuid: Uuid, properties: Properties) -> Self {
        Self { uuid, properties }
    }
}

/// 传输层回调
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected(PeripheralId),
    FailedToConnect {
        peripheral: PeripheralId,
        error: Option<TransportError>,
    },
    Disconnected {
        peripheral: PeripheralId,
        error: Option<TransportError>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Vec<Uuid>,
        error: Option<TransportError>,
    },
    CharacteristicsDiscovered {
        service: ServiceRef,
        characteristics: Vec<DiscoveredCharacteristic>,
        error: Option<TransportError>,
    },
    /// 读响应或通知
    ValueUpdated {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
        error: Option<TransportError>,
    },
    ValueWritten {
        characteristic: CharacteristicRef,
        error: Option<TransportError>,
    },
    NotificationStateUpdated {
        characteristic: CharacteristicRef,
        enabled: bool,
        error: Option<TransportError>,
    },
}

/// 底层蓝牙栈
pub trait Transport: Send + Sync {
    fn submit(&self, request: Request);
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// 传输层事件通道
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
