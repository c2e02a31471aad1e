//! 真实硬件命令
//!
//! btleplug 只能访问扫描过的设备，所以每个命令都先短暂扫描。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use gattlink_core::{
    BtleplugTransport, Central, CentralSettings, Characteristic, ConnectOptions, PeripheralId,
    ReadyOptions, ReadyWorkflow, WriteType, event_channel,
};
use tracing::info;
use uuid::Uuid;

use crate::parse_uuid;

const DISCOVERY_SCAN: Duration = Duration::from_secs(3);

/// 命令行指定的特征
pub struct Target {
    peripheral: PeripheralId,
    service: Uuid,
    characteristic: Uuid,
}

impl Target {
    pub fn parse(address: &str, service: &str, characteristic: &str) -> Result<Self> {
        Ok(Self {
            peripheral: PeripheralId::new(address.to_uppercase()),
            service: parse_uuid(service)?,
            characteristic: parse_uuid(characteristic)?,
        })
    }
}

pub async fn scan(timeout: u64) -> Result<()> {
    let (tx, _rx) = event_channel();
    let transport = BtleplugTransport::new(tx).await?;
    println!("🔍 扫描设备 ({timeout}s)...");
    let devices = transport
        .scan(Duration::from_secs(timeout), Vec::new())
        .await?;
    if devices.is_empty() {
        println!("   未发现设备");
    }
    for (i, device) in devices.iter().enumerate() {
        let rssi = device
            .rssi
            .map_or_else(|| "?".to_string(), |r| r.to_string());
        println!("   [{}] {} ({}) RSSI {}", i, device.name, device.id, rssi);
    }
    Ok(())
}

/// 打开第一个适配器，扫描后返回中心设备
async fn central(settings: CentralSettings, services: Vec<Uuid>) -> Result<Central> {
    let (tx, rx) = event_channel();
    let transport = Arc::new(BtleplugTransport::new(tx).await?);
    transport.scan(DISCOVERY_SCAN, services).await?;
    let central = Central::new(transport, settings);
    central.listen(rx);
    Ok(central)
}

pub async fn connect(settings: CentralSettings, address: &str, services: Vec<Uuid>) -> Result<()> {
    let options = ReadyOptions {
        connect: ConnectOptions::from(&settings),
        services: (!services.is_empty()).then(|| services.clone()),
        reconnect_on_disconnect: false,
    };
    let central = central(settings, services).await?;
    let peripheral = central.peripheral(address.to_uppercase());
    println!("🔗 连接 {}", peripheral.id());
    let peripheral = ReadyWorkflow::new(options).ready(&peripheral).await?;
    for service in peripheral.services() {
        println!("📦 {} ({})", service.name(), service.uuid());
        for characteristic in service.characteristics() {
            println!(
                "   • {} ({}) {}",
                characteristic.name(),
                characteristic.uuid(),
                characteristic.properties()
            );
        }
    }
    peripheral.disconnect();
    Ok(())
}

/// 扫描、连接并发现目标特征
async fn open(settings: CentralSettings, target: &Target) -> Result<(Central, Characteristic)> {
    let options = ReadyOptions {
        connect: ConnectOptions::from(&settings),
        services: Some(vec![target.service]),
        reconnect_on_disconnect: false,
    };
    let central = central(settings, vec![target.service]).await?;

    info!("Connecting to {}", target.peripheral);
    let peripheral = ReadyWorkflow::new(options)
        .ready(&central.peripheral(target.peripheral.clone()))
        .await?;
    let characteristic = peripheral
        .service(target.service)
        .with_context(|| format!("service {} not found", target.service))?
        .characteristic(target.characteristic)
        .with_context(|| format!("characteristic {} not found", target.characteristic))?;
    Ok((central, characteristic))
}

fn close(central: &Central, target: &Target) {
    central.peripheral(target.peripheral.clone()).disconnect();
}

pub async fn read(settings: CentralSettings, target: Target) -> Result<()> {
    let (central, characteristic) = open(settings, &target).await?;
    let value = characteristic.read().await?;
    println!("{}", hex::encode(&value));
    close(&central, &target);
    Ok(())
}

pub async fn write(
    settings: CentralSettings,
    target: Target,
    data: Vec<u8>,
    no_response: bool,
) -> Result<()> {
    let (central, characteristic) = open(settings, &target).await?;
    let write_type = if no_response {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    };
    characteristic.write(data, write_type).await?;
    println!("✅ 已写入");
    close(&central, &target);
    Ok(())
}

pub async fn watch(settings: CentralSettings, target: Target, count: usize) -> Result<()> {
    let (central, characteristic) = open(settings, &target).await?;
    characteristic.start_notifying().await?;
    let mut updates = characteristic.start_updates()?.subscribe();
    for _ in 0..count {
        let Some(update) = updates.next().await else {
            break;
        };
        println!("{}", hex::encode(update?));
    }
    characteristic.stop_updates();
    close(&central, &target);
    Ok(())
}
