pub mod http;

pub use crate::config::bind::http::HttpBindConfig;
use serde::{Deserialize, Serialize};

/// 网络绑定配置
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct BindConfig {
    /// HTTP 服务绑定配置
    ///
    /// SQRL 客户端回调与浏览器轮询共用同一个监听端口。
    /// 生产环境通常部署在 TLS 反向代理之后。
    #[serde(default)]
    pub http: HttpBindConfig,
}
