//! 统一配置管理
//!
//! SQRL 服务器的全部配置项、默认值与校验规则都在这里定义。
//! 配置文件使用 TOML 格式，启动时加载一次。

pub mod bind;

pub use crate::config::bind::{BindConfig, HttpBindConfig};
use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqrl_protocol::{ProtocolConfig, StorageBackend};
use std::path::{Path, PathBuf};

/// SQRL 服务器主配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SqrlServerConfig {
    /// 服务器实例名称
    ///
    /// 在日志和 `/health` 中用于区分不同节点
    #[serde(default = "default_name")]
    pub name: String,

    /// 运行环境标识
    ///
    /// - "dev": 开发环境
    /// - "prod": 生产环境，额外检查日志与 IP 策略
    /// - "test": 测试环境
    #[serde(default = "default_env")]
    pub env: String,

    /// PID 文件路径（可选）
    pub pid: Option<String>,

    /// SQLite 数据库文件存储目录
    ///
    /// 数据库文件为 `{sqlite_path}/{protocol.storage.sqlite.path}`
    #[serde(
        default = "default_sqlite_path",
        serialize_with = "serialize_pathbuf",
        deserialize_with = "deserialize_pathbuf"
    )]
    pub sqlite_path: PathBuf,

    /// 过期关联器与 Nut 记录的清理周期（秒）
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// 网络绑定配置
    #[serde(default)]
    pub bind: BindConfig,

    /// SQRL 协议配置（含存储后端）
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// 可观测性配置
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// 可观测性配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    /// 过滤级别
    ///
    /// 支持 EnvFilter 语法（如 "info,sqlx=warn"）。默认值 "info"。
    #[serde(default = "default_filter_level")]
    pub filter_level: String,

    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// 日志输出目标："console"（默认）或 "file"
    #[serde(default = "default_log_output")]
    pub output: String,

    /// 按天轮转日志文件，仅在 output = "file" 时有效
    #[serde(default)]
    pub rotate: bool,

    /// 日志目录，仅在 output = "file" 时有效
    #[serde(default = "default_log_path")]
    pub path: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            filter_level: default_filter_level(),
            log: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: default_log_output(),
            rotate: false,
            path: default_log_path(),
        }
    }
}

fn default_name() -> String {
    "sqrl-default".to_string()
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("database")
}

fn default_cleanup_interval_secs() -> u64 {
    600
}

fn default_log_output() -> String {
    "console".to_string()
}

fn default_log_path() -> String {
    "logs/".to_string()
}

fn default_filter_level() -> String {
    "info".to_string()
}

fn serialize_pathbuf<S>(path: &Path, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    path.display().to_string().serialize(serializer)
}

fn deserialize_pathbuf<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(PathBuf::from(s))
}

impl Default for SqrlServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            env: default_env(),
            pid: Some("logs/sqrl-server.pid".to_string()),
            sqlite_path: default_sqlite_path(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            bind: BindConfig::default(),
            protocol: ProtocolConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl SqrlServerConfig {
    /// 返回日志配置引用
    pub fn log_config(&self) -> &LogConfig {
        &self.observability.log
    }

    /// 检查是否使用控制台日志输出
    pub fn is_console_logging(&self) -> bool {
        self.observability.log.output == "console"
    }

    /// 检查是否应该轮转日志
    pub fn should_rotate_logs(&self) -> bool {
        self.observability.log.output == "file" && self.observability.log.rotate
    }

    /// 获取日志过滤级别，优先使用 RUST_LOG
    pub fn get_filter_level(&self) -> String {
        std::env::var("RUST_LOG")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.observability.filter_level.clone())
    }

    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(ConfigError::FileNotFound {
                path: path_ref.display().to_string(),
            });
        }

        if !path_ref.is_file() {
            return Err(ConfigError::NotAFile {
                path: path_ref.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;

        Self::from_toml(&content)
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// 将配置序列化为 TOML 字符串
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// 验证配置有效性
    ///
    /// 返回发现的全部问题。以 "Warning:" 开头的条目不阻止启动。
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("Instance name cannot be empty".to_string());
        }

        if !["dev", "prod", "test"].contains(&self.env.as_str()) {
            errors.push(format!(
                "Invalid environment '{}', must be one of: dev, prod, test",
                self.env
            ));
        }

        let main_level = self
            .observability
            .filter_level
            .split(',')
            .next()
            .unwrap_or("")
            .trim();
        if !["trace", "debug", "info", "warn", "error"].contains(&main_level) {
            errors.push(format!(
                "Invalid filter level '{}', must start with one of: trace, debug, info, warn, error",
                self.observability.filter_level
            ));
        }

        if !["console", "file"].contains(&self.observability.log.output.as_str()) {
            errors.push(format!(
                "Invalid log output '{}' (observability.log.output), must be 'console' or 'file'",
                self.observability.log.output
            ));
        }

        if let Err(e) = self.bind.http.socket_addr() {
            errors.push(format!(
                "Invalid bind.http address '{}:{}': {e}",
                self.bind.http.ip, self.bind.http.port
            ));
        }

        if self.cleanup_interval_secs == 0 {
            errors.push("cleanup_interval_secs must be greater than 0".to_string());
        }

        if self.protocol.storage.backend == StorageBackend::Sqlite
            && self
                .sqlite_path
                .to_str()
                .map(|s| s.trim().is_empty())
                .unwrap_or(true)
        {
            errors.push("SQLite database path cannot be empty".to_string());
        }

        errors.extend(self.protocol.validate());

        if self.env == "prod" {
            if self.protocol.nut_key.is_some()
                && self.protocol.nut_key_env.is_none()
                && self.protocol.nut_key_file.is_none()
            {
                errors.push("Warning: Production environment should load the nut key from nut_key_env or nut_key_file".to_string());
            }

            if self.protocol.storage.backend == StorageBackend::Memory {
                errors.push("Warning: Memory storage loses all identities on restart".to_string());
            }

            if self.observability.log.output == "console" {
                errors.push("Warning: Production environment should use file logging (observability.log.output = \"file\")".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl SqrlServerConfig {
    /// 加载并校验配置
    ///
    /// 存在致命问题时返回 `ConfigError::Invalid`（包含全部问题），否则返回配置和警告列表
    pub fn load<P: AsRef<Path>>(path: P) -> crate::error::Result<(Self, Vec<String>)> {
        let config = Self::from_file(path)?;
        match config.validate() {
            Ok(()) => Ok((config, Vec::new())),
            Err(problems) if fatal_errors(&problems).is_empty() => Ok((config, problems)),
            Err(problems) => Err(ConfigError::Invalid(problems).into()),
        }
    }
}

/// 过滤出致命错误（非 "Warning:" 条目）
pub fn fatal_errors(errors: &[String]) -> Vec<&String> {
    errors.iter().filter(|e| !e.starts_with("Warning:")).collect()
}
