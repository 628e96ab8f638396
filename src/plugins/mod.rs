//! 插件通信层模块
//!
//! 服务注册表、共享数据流以及把它们和事件总线组合在一起的通信中心

pub mod communication;
pub mod data_stream;
pub mod service_registry;

// 重新导出核心组件
pub use communication::*;
pub use data_stream::*;
pub use service_registry::*;
