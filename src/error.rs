//! PluginHub 错误处理系统
//!
//! 统一的错误类型：服务调用失败返回给调用方，订阅者失败仅被记录

use thiserror::Error;

/// 通信层统一错误类型
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Plugin {caller} is not allowed to call services on {target}")]
    PermissionDenied { caller: String, target: String },

    #[error("Service not found for plugin: {plugin}")]
    ServiceNotFound { plugin: String },

    #[error("Method {method} not found in service {plugin}")]
    MethodNotFound { plugin: String, method: String },

    #[error("Service call {plugin}.{method} failed: {message}")]
    ServiceInvocation {
        plugin: String,
        method: String,
        message: String,
    },

    #[error("Subscriber error: {message}")]
    Subscriber { message: String },

    #[error("Stream already exists: {id}")]
    StreamAlreadyExists { id: String },

    #[error("Stream not found: {id}")]
    StreamNotFound { id: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Generic error: {message}")]
    Generic { message: String },
}

impl HubError {
    /// 创建订阅者回调错误
    pub fn subscriber(message: &str) -> Self {
        Self::Subscriber {
            message: message.to_string(),
        }
    }

    /// 创建配置相关错误
    pub fn config(message: &str) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    /// 创建通用错误
    pub fn generic(message: &str) -> Self {
        Self::Generic {
            message: message.to_string(),
        }
    }

    /// 是否为调用前被拒绝的服务调用（权限、服务或方法缺失）
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::ServiceNotFound { .. } | Self::MethodNotFound { .. }
        )
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_message() {
        let error = HubError::PermissionDenied {
            caller: "other".to_string(),
            target: "chat".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Plugin other is not allowed to call services on chat"
        );
        assert!(error.is_rejection());
    }

    #[test]
    fn test_error_creation() {
        let error = HubError::subscriber("handler exploded");
        assert!(matches!(error, HubError::Subscriber { .. }));
        assert_eq!(error.to_string(), "Subscriber error: handler exploded");
        assert!(!error.is_rejection());
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let hub_error = HubError::from(io_error);
        assert!(matches!(hub_error, HubError::Io(_)));
    }
}
