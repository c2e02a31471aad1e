//! 中心设备配置和持久化
//!
//! 提供连接超时、重试次数、特征超时等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONNECTION_TIMEOUT_SECS: f64 = 10.0;
const DEFAULT_CHARACTERISTIC_TIMEOUT_SECS: f64 = 10.0;

/// 读响应与通知更新的分发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateRouting {
    /// 进行中的读和更新订阅同时收到值
    #[default]
    Shared,
    /// 只有最近配置的一方（读或订阅）收到值
    Exclusive,
}

/// 无响应写入的完成策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteWithoutResponsePolicy {
    /// 与有响应写入相同：等待传输层确认，超时报告 `WriteTimeout`
    #[default]
    AwaitConfirmation,
    /// 请求交给传输层后立即成功，不安排超时
    ResolveOnSubmit,
}

/// 中心设备设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralSettings {
    /// 连接超时（秒）
    pub connection_timeout_secs: f64,
    /// 超时重试次数上限（不设置则无限重试）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_retries: Option<u32>,
    /// 意外断开重试次数上限（不设置则无限）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect_retries: Option<u32>,
    /// 特征读写超时（秒）
    pub characteristic_timeout_secs: f64,
    pub update_routing: UpdateRouting,
    pub write_without_response: WriteWithoutResponsePolicy,
    /// 详细日志模式
    pub verbose: bool,
}

impl Default for CentralSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            timeout_retries: None,
            disconnect_retries: None,
            characteristic_timeout_secs: DEFAULT_CHARACTERISTIC_TIMEOUT_SECS,
            update_routing: UpdateRouting::default(),
            write_without_response: WriteWithoutResponsePolicy::default(),
            verbose: false,
        }
    }
}

impl CentralSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gattlink");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        secs_or(self.connection_timeout_secs, DEFAULT_CONNECTION_TIMEOUT_SECS)
    }

    pub fn characteristic_timeout(&self) -> Duration {
        secs_or(
            self.characteristic_timeout_secs,
            DEFAULT_CHARACTERISTIC_TIMEOUT_SECS,
        )
    }
}

/// 非法（负数、NaN、溢出）时回退到默认值
fn secs_or(secs: f64, default: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| Duration::from_secs_f64(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = CentralSettings::default();
        assert_eq!(settings.connection_timeout(), Duration::from_secs(10));
        assert_eq!(settings.characteristic_timeout(), Duration::from_secs(10));
        // 默认无限重试
        assert_eq!(settings.timeout_retries, None);
        assert_eq!(settings.disconnect_retries, None);
        assert_eq!(settings.update_routing, UpdateRouting::Shared);
        assert_eq!(
            settings.write_without_response,
            WriteWithoutResponsePolicy::AwaitConfirmation
        );
    }

    #[test]
    fn test_partial_toml() {
        let settings: CentralSettings = toml::from_str(
            r#"
            connection_timeout_secs = 2.5
            timeout_retries = 3
            update_routing = "exclusive"
            write_without_response = "resolve_on_submit"
            "#,
        )
        .unwrap();
        assert_eq!(settings.connection_timeout(), Duration::from_millis(2500));
        assert_eq!(settings.timeout_retries, Some(3));
        assert_eq!(settings.disconnect_retries, None);
        assert_eq!(settings.update_routing, UpdateRouting::Exclusive);
        assert_eq!(
            settings.write_without_response,
            WriteWithoutResponsePolicy::ResolveOnSubmit
        );
        assert_eq!(settings.characteristic_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_timeout_falls_back() {
        let settings = CentralSettings {
            connection_timeout_secs: -1.0,
            characteristic_timeout_secs: f64::NAN,
            ..Default::default()
        };
        assert_eq!(settings.connection_timeout(), Duration::from_secs(10));
        assert_eq!(settings.characteristic_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let settings = CentralSettings {
            disconnect_retries: Some(2),
            verbose: true,
            ..Default::default()
        };
        settings.save_to(&path).unwrap();
        assert_eq!(CentralSettings::load_from(&path), settings);
    }

    #[test]
    fn test_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "connection_timeout_secs = \"soon\"").unwrap();
        assert_eq!(CentralSettings::load_from(&path), CentralSettings::default());
    }
}
