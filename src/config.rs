//! PluginHub 配置管理系统
//!
//! 支持YAML/TOML配置文件，控制历史容量、系统数据流初始值以及日志输出

use crate::core::EventBusConfig;
use crate::plugins::ServiceRegistryConfig;
use crate::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 通信中心配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// 事件总线
    pub event_bus: EventBusConfig,
    /// 服务注册表
    pub service_registry: ServiceRegistryConfig,
    /// 系统数据流
    pub system_streams: SystemStreamsConfig,
    /// 日志
    pub logging: LoggingConfig,
}

/// 系统数据流配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemStreamsConfig {
    /// `app-settings` 数据流的初始值
    pub app_settings: serde_json::Value,
}

impl Default for SystemStreamsConfig {
    fn default() -> Self {
        Self {
            app_settings: serde_json::json!({}),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别，`RUST_LOG` 环境变量优先
    pub level: String,
    /// 是否输出JSON格式
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// `.toml` 为TOML，其余按YAML处理
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            _ => Self::Yaml,
        }
    }
}

/// 配置管理器
#[derive(Debug, Default)]
pub struct ConfigManager {
    config: HubConfig,
}

impl ConfigManager {
    /// 从文件加载配置
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;

        let config: HubConfig = match ConfigFormat::from_path(path) {
            ConfigFormat::Toml => toml::from_str(&content)?,
            ConfigFormat::Yaml => serde_yaml::from_str(&content)?,
        };

        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(Self { config })
    }

    /// 创建默认配置
    pub fn new_default() -> Self {
        Self::default()
    }

    /// 使用已有配置
    pub fn from_config(config: HubConfig) -> Self {
        Self { config }
    }

    /// 保存配置到文件
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match ConfigFormat::from_path(path) {
            ConfigFormat::Toml => toml::to_string_pretty(&self.config)?,
            ConfigFormat::Yaml => serde_yaml::to_string(&self.config)?,
        };

        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// 获取配置
    pub fn get_config(&self) -> &HubConfig {
        &self.config
    }

    /// 获取可变配置
    pub fn get_config_mut(&mut self) -> &mut HubConfig {
        &mut self.config
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if self.config.event_bus.max_history == 0 {
            return Err(HubError::config("Event history capacity must be positive"));
        }

        if self.config.service_registry.max_call_history == 0 {
            return Err(HubError::config("Call history capacity must be positive"));
        }

        let level = self.config.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(HubError::config(&format!(
                "Unknown log level '{}', expected one of {:?}",
                self.config.logging.level, LOG_LEVELS
            )));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }
}

/// 生成默认配置文件
pub async fn generate_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    ConfigManager::new_default().save_to_file(path).await
}
