//! BLE 中心设备 (Central) 核心
//!
//! - **peripheral**: 连接状态机（连接/断开/超时/重试）
//! - **characteristic**: 特征读/写/通知引擎
//! - **service**: 服务与特征发现
//! - **central**: 拥有所有外设的注册表，串行执行上下文
//! - **transport**: 底层蓝牙栈的抽象
//! - **simulated**: 进程内模拟传输层（测试用）

#[cfg(feature = "btleplug")]
pub mod btleplug_transport;
pub mod central;
pub mod characteristic;
pub mod codec;
pub mod peripheral;
pub mod sequence;
pub mod service;
pub mod simulated;
pub mod timer;
pub mod transport;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use transport::TransportError;

/// 外设标识符（通常为 MAC 地址字符串）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeripheralId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 服务的非拥有引用：外设 ID + 服务 UUID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub peripheral: PeripheralId,
    pub uuid: Uuid,
}

impl ServiceRef {
    pub fn new(peripheral: PeripheralId, uuid: Uuid) -> Self {
        Self { peripheral, uuid }
    }

    pub fn characteristic(&self, uuid: Uuid) -> CharacteristicRef {
        CharacteristicRef {
            peripheral: self.peripheral.clone(),
            service: self.uuid,
            uuid,
        }
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peripheral, self.uuid)
    }
}

/// 特征的非拥有引用：外设 ID + 服务 UUID + 特征 UUID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub peripheral: PeripheralId,
    pub service: Uuid,
    pub uuid: Uuid,
}

impl CharacteristicRef {
    pub fn service_ref(&self) -> ServiceRef {
        ServiceRef::new(self.peripheral.clone(), self.service)
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.peripheral, self.service, self.uuid)
    }
}

/// GATT 特征属性位
///
/// 位值与蓝牙规范中的 Characteristic Properties 字段一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Properties(u8);

impl Properties {
    pub const BROADCAST: Properties = Properties(0x01);
    pub const READ: Properties = Properties(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Properties = Properties(0x04);
    pub const WRITE: Properties = Properties(0x08);
    pub const NOTIFY: Properties = Properties(0x10);
    pub const INDICATE: Properties = Properties(0x20);

    pub const fn empty() -> Self {
        Properties(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Properties(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// 是否包含 `other` 中的任意一位
    pub const fn intersects(self, other: Properties) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn contains(self, other: Properties) -> bool {
        self.0 & other.0 == other.0
    }

    /// 可订阅（Notify 或 Indicate）
    pub const fn is_notifiable(self) -> bool {
        self.intersects(Properties(Self::NOTIFY.0 | Self::INDICATE.0))
    }
}

impl std::ops::BitOr for Properties {
    type Output = Properties;

    fn bitor(self, rhs: Properties) -> Properties {
        Properties(self.0 | rhs.0)
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Properties, &str); 6] = [
            (Properties::BROADCAST, "broadcast"),
            (Properties::READ, "read"),
            (Properties::WRITE_WITHOUT_RESPONSE, "write-without-response"),
            (Properties::WRITE, "write"),
            (Properties::NOTIFY, "notify"),
            (Properties::INDICATE, "indicate"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(p, _)| self.contains(*p))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// 写入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

impl WriteType {
    /// 该写入方式所需的特征属性
    pub fn required_property(self) -> Properties {
        match self {
            WriteType::WithResponse => Properties::WRITE,
            WriteType::WithoutResponse => Properties::WRITE_WITHOUT_RESPONSE,
        }
    }
}

/// BLE 错误
///
/// 需要 `Clone`，因为同一个结果会分发给多个观察者。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BleError {
    #[error("{operation} not supported by characteristic {uuid}")]
    CapabilityUnsupported {
        uuid: Uuid,
        operation: &'static str,
    },

    #[error("Unable to serialize value for {uuid}: {reason}")]
    SerializationFailed { uuid: Uuid, reason: String },

    #[error("Characteristic read timed out: {0}")]
    ReadTimeout(Uuid),

    #[error("Characteristic write timed out: {0}")]
    WriteTimeout(Uuid),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(TransportError),

    #[error("Gave up connecting to {0}")]
    ConnectionGiveUp(PeripheralId),

    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(PeripheralId),

    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Peripheral not connected: {0}")]
    NotConnected(PeripheralId),

    #[error("Operation cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_bits() {
        let props = Properties::READ | Properties::NOTIFY;
        assert!(props.contains(Properties::READ));
        assert!(!props.contains(Properties::WRITE));
        assert!(props.is_notifiable());
        assert!(!Properties::READ.is_notifiable());
        assert!(Properties::INDICATE.is_notifiable());
        assert_eq!(props.to_string(), "[read, notify]");
    }

    #[test]
    fn test_write_type_property() {
        assert_eq!(WriteType::WithResponse.required_property(), Properties::WRITE);
        assert_eq!(
            WriteType::WithoutResponse.required_property(),
            Properties::WRITE_WITHOUT_RESPONSE
        );
    }

    #[test]
    fn test_refs_display() {
        let service = ServiceRef::new(PeripheralId::from("AA:BB"), Uuid::nil());
        let characteristic = service.characteristic(Uuid::nil());
        assert_eq!(characteristic.service_ref(), service);
        assert!(characteristic.to_string().starts_with("AA:BB/"));
    }
}
