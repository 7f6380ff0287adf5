//! SQRL 存储模块
//!
//! 提供两种存储后端：SQLite（生产）和内存（测试/演示）
//!
//! # 设计
//!
//! - `SqrlPersistence` trait 是事务工厂
//! - `SqrlTransaction` trait 定义单个事务内的全部身份、关联器和 Nut 操作
//! - 通过 `StorageConfig` 配置选择和初始化后端

use std::path::Path;
use std::sync::Arc;

pub mod backend;
pub mod config;
pub mod memory;
pub mod sqlite;

use crate::error::SqrlResult;

pub use backend::{CleanupStats, SqrlPersistence, SqrlTransaction};
pub use config::{SqliteConfig, StorageBackend, StorageConfig};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// 从配置创建存储实例
///
/// # Arguments
/// * `config` - 存储配置
/// * `db_path` - 数据库文件存储目录路径（当 backend = "sqlite" 时使用，来自 SqrlServerConfig.sqlite_path）
pub async fn from_config<P: AsRef<Path>>(
    config: &StorageConfig,
    db_path: P,
) -> SqrlResult<Arc<dyn SqrlPersistence>> {
    match config.backend {
        StorageBackend::Sqlite => {
            let sqlite = config.sqlite.clone().unwrap_or_default();
            let backend = SqliteBackend::new(&sqlite, db_path.as_ref()).await?;
            Ok(Arc::new(backend))
        }
        StorageBackend::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}
