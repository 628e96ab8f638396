//! 核心基础层模块
//!
//! 事件总线以及事件总线和数据流共用的订阅句柄

pub mod event_bus;
pub mod subscription;

// 重新导出核心组件
pub use event_bus::*;
pub use subscription::*;
