//! SQRL 服务器基础设施库
//!
//! 为 SQRL 服务器提供配置加载、错误类型和本地缓存等通用组件

pub mod cache;
pub mod config;
pub mod error;

pub use cache::ExpiringCache;
pub use config::{HttpBindConfig, LogConfig, ObservabilityConfig, SqrlServerConfig};
pub use error::{BaseError, ConfigError, Result};
