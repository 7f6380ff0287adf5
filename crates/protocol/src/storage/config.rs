//! 存储后端配置

use serde::{Deserialize, Serialize};

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// 存储后端类型
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite 配置（当 backend = "sqlite" 时使用）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite: Option<SqliteConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite: Some(SqliteConfig::default()),
        }
    }
}

/// 存储后端类型枚举
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite 数据库
    #[default]
    Sqlite,
    /// 进程内存（仅用于测试和单机演示，重启后数据丢失）
    Memory,
}

/// SQLite 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SqliteConfig {
    /// 数据库文件名，相对于 sqlite_path 目录
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "sqrl.db".to_string(),
        }
    }
}
