//! PluginHub 核心数据类型模块
//!
//! 插件标识、时间戳以及保留的插件ID

/// 纳秒时间戳
pub type TimestampNs = i64;

/// 插件唯一标识符
pub type PluginId = String;

/// 系统事件、系统数据流使用的保留插件ID
pub const SYSTEM_PLUGIN_ID: &str = "system";

/// 权限列表中的通配符，允许任意调用方
pub const WILDCARD_CALLER: &str = "*";

/// 当前时间（纳秒）
pub fn now_ns() -> TimestampNs {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}
