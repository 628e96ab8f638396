//! PluginHub - 插件宿主的进程内通信层
//!
//! 为插件化应用提供三种通信方式，并通过统一的通信中心为每个插件签发能力对象
//!
//! # 组件
//!
//! - **事件总线**: 同步发布/订阅，订阅者故障隔离，有界事件历史
//! - **服务注册表**: 带权限检查的进程内RPC，有界调用历史
//! - **数据流存储**: 命名的共享可变值，变更时通知订阅者
//! - **通信中心**: 组合以上三者，按插件ID签发 `PluginInterface`
//!
//! # 示例
//!
//! ```rust
//! use plugin_hub::{CommunicationHub, Event};
//! use serde_json::json;
//!
//! let hub = CommunicationHub::new();
//! let logger = hub.get_interface("logger");
//! let viewer = hub.get_interface("course-viewer");
//!
//! let handle = logger.events.subscribe("lesson.completed", |event: &Event| {
//!     println!("{} completed by {}", event.data, event.from_plugin);
//!     Ok(())
//! });
//! viewer.events.emit("lesson.completed", json!({"id": 1}));
//! handle.unsubscribe();
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod plugins;
pub mod types;

// 重新导出核心类型
pub use config::*;
pub use self::core::*;
pub use error::*;
pub use plugins::*;
pub use types::*;

use tracing_subscriber::EnvFilter;

/// 框架信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FRAMEWORK_NAME: &str = "PluginHub";

/// 初始化日志系统
///
/// `RUST_LOG` 环境变量优先于配置中的级别。重复调用不会报错。
pub fn initialize(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| HubError::config(&format!("Invalid log filter '{}': {}", logging.level, e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if logging.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        tracing::info!("Initializing {} v{}", FRAMEWORK_NAME, VERSION);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framework_info() {
        assert_eq!(FRAMEWORK_NAME, "PluginHub");
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let logging = LoggingConfig::default();
        assert!(initialize(&logging).is_ok());
        assert!(initialize(&logging).is_ok());
    }
}
