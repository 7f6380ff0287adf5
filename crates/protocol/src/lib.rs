//! SQRL 协议引擎
//!
//! 实现 SQRL (Secure, Quick, Reliable Login) 协议的服务端：
//!
//! - **Nut**：加密的一次性挑战令牌（[`nut`]）
//! - **关联器**：把浏览器会话与客户端带外回调串联起来的状态机（[`correlator`]）
//! - **请求校验与命令分发**：签名校验、重放防护、版本协商（[`request`], [`dispatcher`]）
//! - **应答构建**：签发新 Nut 并附带 TIF 状态位（[`reply`], [`tif`]）
//!
//! 存储通过 [`storage::SqrlPersistence`] 抽象，HTTP 传输由调用方负责。

pub mod config;
pub mod correlator;
pub mod crypto;
pub mod dispatcher;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod identity;
pub mod nut;
pub mod reply;
pub mod request;
pub mod storage;
pub mod tif;
pub mod version;

pub use config::ProtocolConfig;
pub use correlator::{Correlator, CorrelatorStatus};
pub use crypto::{NutCipher, NutKeySource};
pub use engine::{AuthenticationPage, CorrelatorSnapshot, SqrlEngine};
pub use error::{SqrlError, SqrlResult};
pub use nut::{NutContext, NutToken};
pub use reply::SqrlReply;
pub use request::{RawSqrlRequest, SqrlCommand, SqrlOption};
pub use storage::{CleanupStats, SqrlPersistence, SqrlTransaction, StorageBackend, StorageConfig};
pub use tif::{Tif, TifBuilder, TifFlag};

use std::time::{SystemTime, UNIX_EPOCH};

/// 当前 Unix 时间（秒）
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
