use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// HTTP 服务绑定配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpBindConfig {
    /// 绑定 IP 地址
    ///
    /// 通常使用 "0.0.0.0" 监听所有接口。
    #[serde(default = "default_ip")]
    pub ip: String,

    /// 绑定端口，0 表示由系统分配
    #[serde(default = "default_port")]
    pub port: u16,

    /// 读取客户端真实 IP 的转发头，按顺序取第一个存在的
    ///
    /// 仅在服务位于可信反向代理之后时配置，例如 `["X-Forwarded-For"]`。
    /// 为空时使用 TCP 对端地址。
    #[serde(default)]
    pub ip_forwarding_headers: Vec<String>,
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for HttpBindConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            ip_forwarding_headers: Vec::new(),
        }
    }
}

impl HttpBindConfig {
    /// 解析监听地址
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip: IpAddr = self.ip.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}
