//! 顶层错误枚举
//!
//! 聚合配置、协议与 IO 错误，供服务器启动与运行期使用

use super::ConfigError;
use sqrl_protocol::SqrlError;
use thiserror::Error;

/// 顶层错误枚举
#[derive(Error, Debug)]
pub enum BaseError {
    // ========== 协议错误 ==========
    #[error("SQRL protocol error: {0}")]
    Protocol(#[from] SqrlError),

    // ========== 基础设施错误 ==========
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ========== 通用错误 ==========
    #[error("General error: {message}")]
    General { message: String },

    /// 内部错误（通常表示编程错误）
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BaseError {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, BaseError>;
