//! SQRL 协议错误定义
//!
//! 区分客户端可归因的错误（返回带失败 TIF 位的应答）与服务端错误。

use crate::tif::TifFlag;
use thiserror::Error;

/// SQRL 协议错误类型
#[derive(Error, Debug)]
pub enum SqrlError {
    /// 参数超长、缺失或不是 base64url 字符集
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// 协议语义错误（签名失败、Nut 无效、版本不匹配等）
    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        /// 额外附加到应答上的 TIF 位
        tif: u32,
    },

    /// 不支持的命令
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    /// Nut 令牌重放
    #[error("Nut token replayed: {0}")]
    NutTokenReplayed(String),

    /// 关联器不存在或已过期
    #[error("Correlator not found: {0}")]
    CorrelatorNotFound(String),

    /// 存储层错误（写入后回读不一致、数据损坏等）
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// 数据库错误
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// 非法状态（配置缺失、状态机违规）
    #[error("Illegal state: {0}")]
    IllegalState(String),
}

impl SqrlError {
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            tif: 0,
        }
    }

    /// 带额外 TIF 位的请求错误，例如版本协商失败时的 FUNCTION_NOT_SUPPORTED
    pub fn invalid_request_with(message: impl Into<String>, flag: TifFlag) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            tif: flag.bits(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceFailure(message.into())
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// 是否可归因于客户端
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidData(_)
                | Self::InvalidRequest { .. }
                | Self::UnsupportedCommand(_)
                | Self::NutTokenReplayed(_)
                | Self::CorrelatorNotFound(_)
        )
    }

    /// 失败应答需要携带的 TIF 位
    pub fn tif_flags(&self) -> u32 {
        match self {
            Self::InvalidData(_) | Self::NutTokenReplayed(_) | Self::CorrelatorNotFound(_) => {
                TifFlag::ClientFailure.bits() | TifFlag::CommandFailed.bits()
            }
            Self::InvalidRequest { tif, .. } => {
                TifFlag::ClientFailure.bits() | TifFlag::CommandFailed.bits() | tif
            }
            Self::UnsupportedCommand(_) => {
                TifFlag::FunctionNotSupported.bits() | TifFlag::CommandFailed.bits()
            }
            Self::PersistenceFailure(_) | Self::Database(_) | Self::IllegalState(_) => {
                TifFlag::CommandFailed.bits()
            }
        }
    }

    /// 对应的 HTTP 状态码（仅在无法构造协议应答时使用）
    pub fn http_status(&self) -> u16 {
        if self.is_client_error() { 400 } else { 500 }
    }
}

/// SQRL 结果类型别名
pub type SqrlResult<T> = Result<T, SqrlError>;
