//! 模拟设备演示
//!
//! 一个带心率服务、设备信息服务和可写模式特征的模拟外设，
//! 走完整的 连接 → 发现 → 读 → 写 → 通知 → 断开 流程。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use gattlink_core::{
    Central, CentralSettings, CharacteristicProfile, ConnectionEvent, ProfileRegistry,
    Properties, ReadyOptions, ReadyWorkflow, ServiceProfile, SimCharacteristic, SimDevice,
    SimService, SimTransport, StringValues, Utf8Codec, WriteType, event_channel,
};
use tracing::info;
use uuid::Uuid;

use crate::bluetooth_uuid;

const ADDRESS: &str = "5A:11:CA:7E:00:01";
const MODE_SERVICE: Uuid = Uuid::from_u128(0x6a1e_0001_5eed_4c0d_9f2b_a1b2c3d4e5f6);
const MODE: Uuid = Uuid::from_u128(0x6a1e_0002_5eed_4c0d_9f2b_a1b2c3d4e5f6);

fn demo_device() -> SimDevice {
    SimDevice::new()
        .with_service(
            SimService::new(bluetooth_uuid(0x180d))
                .with_characteristic(SimCharacteristic::new(
                    bluetooth_uuid(0x2a37),
                    Properties::READ | Properties::NOTIFY,
                    [0x00, 72],
                ))
                .with_characteristic(SimCharacteristic::new(
                    bluetooth_uuid(0x2a38),
                    Properties::READ,
                    [0x01],
                )),
        )
        .with_service(
            SimService::new(bluetooth_uuid(0x180a)).with_characteristic(SimCharacteristic::new(
                bluetooth_uuid(0x2a29),
                Properties::READ,
                *b"Gattlink",
            )),
        )
        .with_service(SimService::new(MODE_SERVICE).with_characteristic(
            SimCharacteristic::new(MODE, Properties::READ | Properties::WRITE, *b"idle"),
        ))
}

fn demo_profiles() -> ProfileRegistry {
    ProfileRegistry::new()
        .with_service(
            ServiceProfile::new(bluetooth_uuid(0x180d), "Heart Rate")
                .with_characteristic(CharacteristicProfile::new(
                    bluetooth_uuid(0x2a37),
                    "Heart Rate Measurement",
                ))
                .with_characteristic(CharacteristicProfile::new(
                    bluetooth_uuid(0x2a38),
                    "Body Sensor Location",
                )),
        )
        .with_service(
            ServiceProfile::new(bluetooth_uuid(0x180a), "Device Information").with_characteristic(
                CharacteristicProfile::new(bluetooth_uuid(0x2a29), "Manufacturer Name")
                    .with_codec(Utf8Codec),
            ),
        )
        .with_service(
            ServiceProfile::new(MODE_SERVICE, "Mode").with_characteristic(
                CharacteristicProfile::new(MODE, "Operating Mode")
                    .with_codec(Utf8Codec)
                    .with_discrete_values(vec!["idle".into(), "active".into()])
                    .on_discovered(|c| info!("discovered {} ({})", c.name(), c.uuid())),
            ),
        )
}

pub async fn run(settings: CentralSettings, ticks: u8, latency: u64) -> Result<()> {
    let (tx, rx) = event_channel();
    let transport =
        Arc::new(SimTransport::with_events(tx).with_latency(Duration::from_millis(latency)));
    transport.add_device(ADDRESS, demo_device());

    let central = Central::with_profiles(transport.clone(), settings, demo_profiles());
    let _pump = central.listen(rx);

    println!("🔗 连接 {ADDRESS}");
    let peripheral = ReadyWorkflow::new(ReadyOptions::default())
        .ready(&central.peripheral(ADDRESS))
        .await?;

    for service in peripheral.services() {
        println!("📦 {} ({})", service.name(), service.uuid());
        for characteristic in service.characteristics() {
            println!(
                "   • {} ({}) {}",
                characteristic.name(),
                characteristic.uuid(),
                characteristic.properties()
            );
            if characteristic.property_enabled(Properties::READ) {
                let value = characteristic.read().await?;
                match characteristic.string_values() {
                    Some(values) => println!("     = {} {:?}", hex::encode(&value), values),
                    None => println!("     = {}", hex::encode(&value)),
                }
            }
        }
    }

    let mode = peripheral
        .service(MODE_SERVICE)
        .and_then(|s| s.characteristic(MODE))
        .context("mode characteristic missing")?;
    let values = StringValues::from([("value".to_string(), "active".to_string())]);
    mode.write_strings(&values, WriteType::WithResponse).await?;
    println!("✏️  {} → {:?}", mode.name(), mode.discrete_values());

    let measurement = peripheral
        .service(bluetooth_uuid(0x180d))
        .and_then(|s| s.characteristic(bluetooth_uuid(0x2a37)))
        .context("heart rate measurement missing")?;
    measurement.start_notifying().await?;
    let mut updates = measurement.start_updates()?.subscribe();
    for tick in 0..ticks {
        transport.notify(measurement.reference(), [0x00, 70u8.saturating_add(tick)]);
        if let Some(update) = updates.next().await {
            let value = update?;
            println!("💓 {} bpm", value.get(1).copied().unwrap_or_default());
        }
    }
    measurement.stop_updates();
    measurement.stop_notifying().await?;

    let mut connection = peripheral.connect().subscribe();
    peripheral.disconnect();
    while let Some(event) = connection.next().await {
        if event? == ConnectionEvent::ForceDisconnect {
            break;
        }
    }
    println!("👋 已断开");
    Ok(())
}
