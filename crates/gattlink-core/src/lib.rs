//! Gattlink Core Library
//!
//! BLE 中心设备 (Central) 框架：连接状态机、特征读写通知引擎、服务发现，
//! 以及把它们串起来的 "外设就绪" 工作流。
//!
//! # 模块
//!
//! - **deferred**: 一次性结果 (`Deferred`) 与多次发射的结果流 (`ResultStream`)
//! - **ble**: 连接管理、特征引擎、服务发现、传输层抽象
//! - **workflow**: 连接 + 发现全部服务的高层流程
//! - **config**: 持久化设置
//!
//! # 使用示例
//!
//! ```ignore
//! use gattlink_core::{Central, CentralSettings, ConnectionEvent, SimTransport, event_channel};
//!
//! let (tx, rx) = event_channel();
//! let transport = Arc::new(SimTransport::with_events(tx));
//! let central = Central::new(transport, CentralSettings::load());
//! central.listen(rx);
//!
//! let peripheral = central.peripheral("AA:BB:CC:DD:EE:FF");
//! peripheral.connect().on_success(|event| {
//!     if event == ConnectionEvent::Connect {
//!         // ...
//!     }
//! });
//!
//! let value = characteristic.read().await?;
//! ```

pub mod ble;
pub mod config;
pub mod deferred;
pub mod workflow;

// BLE re-exports
pub use ble::central::Central;
pub use ble::characteristic::Characteristic;
pub use ble::codec::{
    CharacteristicProfile, CodecError, JsonCodec, ProfileRegistry, RawCodec, ServiceProfile,
    StringValues, Utf8Codec, ValueCodec,
};
pub use ble::peripheral::{ConnectOptions, ConnectionEvent, ConnectionState, Peripheral};
pub use ble::service::Service;
pub use ble::simulated::{SimCharacteristic, SimDevice, SimService, SimTransport};
pub use ble::transport::{
    DiscoveredCharacteristic, EventReceiver, EventSender, Request, Transport, TransportEvent,
    event_channel,
};
pub use ble::{
    BleError, CharacteristicRef, PeripheralId, Properties, ServiceRef, TransportError, WriteType,
};

#[cfg(feature = "btleplug")]
pub use ble::btleplug_transport::{BtleplugTransport, BtleplugTransportError, ScannedDevice};

// Config re-exports
pub use config::{CentralSettings, UpdateRouting, WriteWithoutResponsePolicy};

// Deferred re-exports
pub use deferred::{Deferred, Outcome, ResultStream, Subscription};

// Workflow re-exports
pub use workflow::{ReadyOptions, ReadyWorkflow, connect_and_discover};
