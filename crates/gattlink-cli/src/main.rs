//! Gattlink CLI
//!
//! 命令行工具：管理中心设备配置、运行模拟设备演示，
//! 启用 `hardware` 特性后可直接访问真实 BLE 外设。

#[cfg(feature = "hardware")]
mod hardware;
mod simulate;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gattlink_core::CentralSettings;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "gattlink", version, about = "BLE 中心设备工具")]
struct Cli {
    /// 配置文件路径 (默认: ~/.config/gattlink/settings.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 查看或初始化配置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// 连接一个模拟心率设备并演示读、写和通知
    Simulate {
        /// 接收的通知数量
        #[arg(short, long, default_value = "5")]
        ticks: u8,
        /// 模拟的传输延迟 (毫秒)
        #[arg(short, long, default_value = "20")]
        latency: u64,
    },
    /// 扫描附近设备
    #[cfg(feature = "hardware")]
    Scan {
        /// 扫描时间 (秒)
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
    /// 连接设备并列出服务和特征
    #[cfg(feature = "hardware")]
    Connect {
        address: String,
        /// 只发现这些服务
        #[arg(short, long)]
        service: Vec<String>,
    },
    /// 读取特征值
    #[cfg(feature = "hardware")]
    Read {
        address: String,
        service: String,
        characteristic: String,
    },
    /// 写入特征值 (十六进制)
    #[cfg(feature = "hardware")]
    Write {
        address: String,
        service: String,
        characteristic: String,
        value: String,
        /// 使用无响应写入
        #[arg(long)]
        no_response: bool,
    },
    /// 订阅特征通知
    #[cfg(feature = "hardware")]
    Watch {
        address: String,
        service: String,
        characteristic: String,
        /// 收到多少个通知后退出
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 打印当前配置
    Show,
    /// 写入默认配置
    Init {
        /// 覆盖已有的配置文件
        #[arg(long)]
        force: bool,
    },
    /// 打印配置文件路径
    Path,
}

fn init_logging(verbose: bool) {
    // 桥接 log crate（gattlink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,gattlink_core=debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// 解析 UUID，支持 16 位短格式 (如 `180d`)
pub(crate) fn parse_uuid(text: &str) -> Result<Uuid> {
    if text.len() == 4 {
        let short = u16::from_str_radix(text, 16).with_context(|| format!("invalid UUID: {text}"))?;
        return Ok(bluetooth_uuid(short));
    }
    Uuid::parse_str(text).with_context(|| format!("invalid UUID: {text}"))
}

/// 16 位 UUID 展开为蓝牙基础 UUID
pub(crate) fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128((u128::from(short) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(CentralSettings::config_path);
    let settings = CentralSettings::load_from(&config_path);
    init_logging(cli.verbose || settings.verbose);

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                print!("{}", toml::to_string_pretty(&settings)?);
            }
            ConfigAction::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists (use --force to overwrite)",
                        config_path.display()
                    );
                }
                CentralSettings::default().save_to(&config_path)?;
                println!("✅ 已写入 {}", config_path.display());
            }
            ConfigAction::Path => {
                println!("{}", config_path.display());
            }
        },
        Commands::Simulate { ticks, latency } => {
            simulate::run(settings, ticks, latency).await?;
        }
        #[cfg(feature = "hardware")]
        Commands::Scan { timeout } => {
            hardware::scan(timeout).await?;
        }
        #[cfg(feature = "hardware")]
        Commands::Connect { address, service } => {
            let services = service
                .iter()
                .map(|s| parse_uuid(s))
                .collect::<Result<Vec<_>>>()?;
            hardware::connect(settings, &address, services).await?;
        }
        #[cfg(feature = "hardware")]
        Commands::Read {
            address,
            service,
            characteristic,
        } => {
            let target = hardware::Target::parse(&address, &service, &characteristic)?;
            hardware::read(settings, target).await?;
        }
        #[cfg(feature = "hardware")]
        Commands::Write {
            address,
            service,
            characteristic,
            value,
            no_response,
        } => {
            let target = hardware::Target::parse(&address, &service, &characteristic)?;
            let data = hex::decode(value.trim_start_matches("0x")).context("value must be hex")?;
            hardware::write(settings, target, data, no_response).await?;
        }
        #[cfg(feature = "hardware")]
        Commands::Watch {
            address,
            service,
            characteristic,
            count,
        } => {
            let target = hardware::Target::parse(&address, &service, &characteristic)?;
            hardware::watch(settings, target, count).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_uuid() {
        let uuid = parse_uuid("180d").unwrap();
        assert_eq!(uuid.to_string(), "0000180d-0000-1000-8000-00805f9b34fb");
        assert_eq!(parse_uuid(&uuid.to_string()).unwrap(), uuid);
        assert!(parse_uuid("zzzz").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["gattlink", "-v", "simulate", "--ticks", "3"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Simulate { ticks: 3, latency: 20 }));
    }
}
