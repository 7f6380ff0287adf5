//! 服务端应答构建
//!
//! 应答是 `name=value\r\n` 文本块的 base64url 编码。字段顺序固定：
//! `ver`, `nut`, `tif`, `qry`, `cor`，随后是选项字段（`suk`, `vuk`），最后是扩展字段（`url`）。
//! 客户端遇到未知字段即停止解析，所以已定义字段必须排在扩展字段之前。

use crate::encoding::base64url_encode;
use crate::nut::NutContext;
use crate::tif::Tif;
use std::fmt::Write;
use std::net::IpAddr;

/// 已构建的应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqrlReply {
    /// HTTP 响应体
    pub encoded: String,
    /// 本次应答签发的新 Nut
    pub nut: String,
    pub tif: Tif,
}

/// 应答构建器
pub struct ReplyBuilder<'a> {
    nut_context: &'a NutContext,
    version: String,
    path: &'a str,
    correlator_id: &'a str,
    tif: Tif,
    option_fields: Vec<(&'static str, String)>,
    extension_fields: Vec<(&'static str, String)>,
}

impl<'a> ReplyBuilder<'a> {
    /// # Arguments
    /// * `version` - 服务端支持的版本列表（`ver=` 字段）
    /// * `path` - 下一次请求的路径，例如 `/sqrl`
    pub fn new(
        nut_context: &'a NutContext,
        version: String,
        path: &'a str,
        correlator_id: &'a str,
        tif: Tif,
    ) -> Self {
        Self {
            nut_context,
            version,
            path,
            correlator_id,
            tif,
            option_fields: Vec::new(),
            extension_fields: Vec::new(),
        }
    }

    /// 选项驱动的字段（suk / vuk）
    pub fn option_field(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.option_fields.push((name, value.into()));
        self
    }

    /// 扩展字段，总在最后
    pub fn extension_field(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.extension_fields.push((name, value.into()));
        self
    }

    /// 签发新 Nut 并序列化
    pub fn build(self, client_ip: &IpAddr) -> SqrlReply {
        let (_, nut) = self.nut_context.mint(client_ip);

        let mut text = String::new();
        let mut field = |name: &str, value: &str| {
            // 写入 String 不会失败
            let _ = write!(text, "{name}={value}\r\n");
        };

        field("ver", &self.version);
        field("nut", &nut);
        field("tif", &self.tif.to_string());
        field(
            "qry",
            &format!("{}?nut={}&cor={}", self.path, nut, self.correlator_id),
        );
        field("cor", self.correlator_id);
        for (name, value) in self.option_fields.iter().chain(&self.extension_fields) {
            field(name, value);
        }

        SqrlReply {
            encoded: base64url_encode(text),
            nut,
            tif: self.tif,
        }
    }
}
