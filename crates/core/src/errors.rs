use thiserror::Error;

/// 对等网络错误类型定义
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("传输层错误: {0}")]
    Transport(String),

    #[error("消息解码错误: {0}")]
    Decode(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("无效的对等节点地址: {0}")]
    InvalidAddress(String),

    #[error("能力未注册: {name}")]
    AbilityNotFound { name: String },

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type MeshResult<T> = std::result::Result<T, MeshError>;
