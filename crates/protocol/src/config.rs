//! SQRL 协议配置
//!
//! 启动时加载一次，运行期间不可变

use crate::crypto::NutKeySource;
use crate::storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use url::Url;

/// SQRL 协议配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Nut 加密密钥 - 直接配置
    ///
    /// 支持两种格式：
    /// - 32 字符的十六进制字符串（16 字节）
    /// - 24 字符的 Base64 字符串（16 字节）
    ///
    /// 注意：生产环境建议使用 nut_key_env 或 nut_key_file
    #[serde(default)]
    pub nut_key: Option<String>,

    /// Nut 密钥环境变量名称
    #[serde(default)]
    pub nut_key_env: Option<String>,

    /// Nut 密钥文件路径，文件权限应设置为 600
    #[serde(default)]
    pub nut_key_file: Option<String>,

    /// Nut 有效期（秒）
    #[serde(default = "default_nut_validity_secs")]
    pub nut_validity_secs: u64,

    /// 关联器有效期（秒），从登录页面渲染开始计算
    #[serde(default = "default_correlator_ttl_secs")]
    pub correlator_ttl_secs: u64,

    /// 服务端支持的协议版本
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<u32>,

    /// 客户端回调地址，例如 `sqrl://example.com/sqrl`
    #[serde(default = "default_backchannel_url")]
    pub backchannel_url: String,

    /// CPS 完成后客户端跳转的地址
    #[serde(default)]
    pub cps_url: Option<String>,

    /// 是否对非 query 命令强制 IP 匹配（客户端声明 noiptest 时跳过）
    #[serde(default)]
    pub enforce_ip_match: bool,

    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            nut_key: None,
            nut_key_env: None,
            nut_key_file: None,
            nut_validity_secs: default_nut_validity_secs(),
            correlator_ttl_secs: default_correlator_ttl_secs(),
            supported_versions: default_supported_versions(),
            backchannel_url: default_backchannel_url(),
            cps_url: None,
            enforce_ip_match: false,
            storage: StorageConfig::default(),
        }
    }
}

fn default_nut_validity_secs() -> u64 {
    900
}

fn default_correlator_ttl_secs() -> u64 {
    1800
}

fn default_supported_versions() -> Vec<u32> {
    vec![1]
}

fn default_backchannel_url() -> String {
    "sqrl://localhost:8080/sqrl".to_string()
}

impl ProtocolConfig {
    /// 获取 Nut 密钥来源
    ///
    /// 优先级: nut_key_file > nut_key_env > nut_key
    pub fn get_nut_key_source(&self) -> Option<NutKeySource> {
        if let Some(path) = &self.nut_key_file {
            return Some(NutKeySource::File(path.clone()));
        }

        if let Some(env_var) = &self.nut_key_env {
            return Some(NutKeySource::Environment(env_var.clone()));
        }

        if let Some(key) = &self.nut_key {
            return Some(NutKeySource::Direct(key.clone()));
        }

        None
    }

    pub fn server_versions(&self) -> BTreeSet<u32> {
        self.supported_versions.iter().copied().collect()
    }

    /// 校验配置，返回全部错误信息
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.get_nut_key_source().is_none() {
            errors.push(
                "protocol: one of nut_key, nut_key_env or nut_key_file must be set".to_string(),
            );
        }

        if self.nut_validity_secs == 0 {
            errors.push("protocol: nut_validity_secs must be greater than 0".to_string());
        }

        if self.correlator_ttl_secs < self.nut_validity_secs {
            errors.push(
                "protocol: correlator_ttl_secs must not be shorter than nut_validity_secs"
                    .to_string(),
            );
        }

        if self.supported_versions.is_empty() {
            errors.push("protocol: supported_versions must not be empty".to_string());
        }

        match Url::parse(&self.backchannel_url) {
            Ok(url) if matches!(url.scheme(), "sqrl" | "qrl") && url.host_str().is_some() => {}
            Ok(_) => errors.push(format!(
                "protocol: backchannel_url must be a sqrl:// or qrl:// URL with a host: {}",
                self.backchannel_url
            )),
            Err(e) => errors.push(format!(
                "protocol: invalid backchannel_url {}: {e}",
                self.backchannel_url
            )),
        }

        if let Some(cps_url) = &self.cps_url
            && let Err(e) = Url::parse(cps_url)
        {
            errors.push(format!("protocol: invalid cps_url {cps_url}: {e}"));
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: ProtocolConfig = toml::from_str("").unwrap();
        assert_eq!(config, ProtocolConfig::default());
        assert_eq!(config.nut_validity_secs, 900);
        assert_eq!(config.correlator_ttl_secs, 1800);
        assert_eq!(config.server_versions().into_iter().collect::<Vec<_>>(), vec![1]);
        assert!(!config.enforce_ip_match);
    }

    #[test]
    fn test_nut_key_source_priority() {
        let config = ProtocolConfig::default();
        assert!(config.get_nut_key_source().is_none());

        let config = ProtocolConfig {
            nut_key: Some("direct".into()),
            ..Default::default()
        };
        assert_eq!(
            config.get_nut_key_source(),
            Some(NutKeySource::Direct("direct".into()))
        );

        let config = ProtocolConfig {
            nut_key: Some("direct".into()),
            nut_key_env: Some("ENV".into()),
            ..Default::default()
        };
        assert_eq!(
            config.get_nut_key_source(),
            Some(NutKeySource::Environment("ENV".into()))
        );

        let config = ProtocolConfig {
            nut_key: Some("direct".into()),
            nut_key_env: Some("ENV".into()),
            nut_key_file: Some("/etc/sqrl/nut.key".into()),
            ..Default::default()
        };
        assert_eq!(
            config.get_nut_key_source(),
            Some(NutKeySource::File("/etc/sqrl/nut.key".into()))
        );
    }

    #[test]
    fn test_validate() {
        let config = ProtocolConfig {
            nut_key: Some("00112233445566778899aabbccddeeff".into()),
            ..Default::default()
        };
        assert!(config.validate().is_empty());

        let config = ProtocolConfig {
            backchannel_url: "https://example.com/sqrl".into(),
            supported_versions: vec![],
            ..Default::default()
        };
        let errors = config.validate();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("nut_key")));
        assert!(errors.iter().any(|e| e.contains("backchannel_url")));
    }
}
