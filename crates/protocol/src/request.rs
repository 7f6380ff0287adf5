//! 客户端请求解析与校验
//!
//! 分两个阶段：
//!
//! 1. `RawSqrlRequest::sanitize` - 纯语法检查（长度、字符集、必填参数、client 块解码），
//!    不访问存储，失败即返回 `InvalidData`
//! 2. `RequestValidator::validate` - 在事务内校验 Nut（新鲜度、重放）、版本、命令、签名和 server 回显

use crate::config::ProtocolConfig;
use crate::correlator::{Correlator, TRANSIENT_ISSUED_NUT, TRANSIENT_SERVER_REPLY};
use crate::crypto::verify_signature;
use crate::encoding::{base64url_decode_string, validate_token};
use crate::error::{SqrlError, SqrlResult};
use crate::identity::PERSISTED_KEYS;
use crate::nut::{NutContext, NutToken};
use crate::storage::SqrlTransaction;
use crate::tif::TifFlag;
use crate::version::{highest_common, parse_version_list};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};
use url::Url;

/// client 块中以公钥形式出现、必须是 base64url 的字段
const KEY_FIELDS: [&str; 4] = ["idk", "pidk", "suk", "vuk"];

/// SQRL 命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum SqrlCommand {
    Query,
    Ident,
    Disable,
    Enable,
    Remove,
}

/// 客户端声明的选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum SqrlOption {
    /// 请求服务端返回已存储的 suk / vuk
    Suk,
    #[strum(serialize = "sqrlonly")]
    SqrlOnly,
    Hardlock,
    /// Client Provided Session
    Cps,
    #[strum(serialize = "noiptest")]
    NoIpTest,
}

/// 解析 `opt=` 字段，支持 `~` 和 `,` 分隔，未知选项忽略
pub fn parse_options(opt: &str) -> BTreeSet<SqrlOption> {
    opt.split(['~', ','])
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| match SqrlOption::from_str(o) {
            Ok(option) => Some(option),
            Err(_) => {
                debug!("Ignoring unknown SQRL option: {}", o);
                None
            }
        })
        .collect()
}

/// 传输层原始参数
///
/// `nut` / `cor` 来自查询串，其余来自表单
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSqrlRequest {
    pub nut: Option<String>,
    pub cor: Option<String>,
    pub client: Option<String>,
    pub server: Option<String>,
    pub ids: Option<String>,
    pub pids: Option<String>,
    pub urs: Option<String>,
}

/// 通过语法检查的请求
#[derive(Debug, Clone)]
pub struct SanitizedRequest {
    pub nut: String,
    pub cor: String,
    pub client: String,
    pub server: String,
    pub ids: String,
    pub pids: Option<String>,
    pub urs: Option<String>,
    /// 解码后的 client 块
    pub client_params: BTreeMap<String, String>,
}

fn required(name: &str, value: Option<String>) -> SqrlResult<String> {
    let value = value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SqrlError::invalid_data(format!("Missing parameter {name}")))?;
    validate_token(name, &value)?;
    Ok(value)
}

fn optional(name: &str, value: Option<String>) -> SqrlResult<Option<String>> {
    match value.filter(|v| !v.is_empty()) {
        Some(v) => {
            validate_token(name, &v)?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

/// ver / cmd / opt 只允许的字符
fn is_plain_field(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b',' | b'~'))
}

/// 解析 `name=value\r\n` 文本块
pub fn parse_name_values(text: &str) -> SqrlResult<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    for line in text.split('\n').map(|l| l.trim_end_matches('\r')) {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once('=')
            .ok_or_else(|| SqrlError::invalid_data("Malformed client parameter line"))?;
        params.insert(name.to_string(), value.to_string());
    }
    Ok(params)
}

impl RawSqrlRequest {
    /// 语法检查
    ///
    /// 任何失败都在访问存储之前返回 `InvalidData`
    pub fn sanitize(self) -> SqrlResult<SanitizedRequest> {
        let nut = required("nut", self.nut)?;
        let cor = required("cor", self.cor)?;
        let client = required("client", self.client)?;
        let server = required("server", self.server)?;
        let ids = required("ids", self.ids)?;
        let pids = optional("pids", self.pids)?;
        let urs = optional("urs", self.urs)?;

        let client_params = parse_name_values(&base64url_decode_string(&client)?)?;
        for (name, value) in &client_params {
            if KEY_FIELDS.contains(&name.as_str()) {
                validate_token(name, value)?;
            } else if value.len() > crate::encoding::MAX_TOKEN_SIZE || !is_plain_field(value) {
                return Err(SqrlError::invalid_data(format!(
                    "Client parameter {name} contains illegal characters"
                )));
            }
        }

        Ok(SanitizedRequest {
            nut,
            cor,
            client,
            server,
            ids,
            pids,
            urs,
            client_params,
        })
    }
}

/// 通过全部校验的客户端请求
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// 协商后的协议版本
    pub version: u32,
    pub command: SqrlCommand,
    pub options: BTreeSet<SqrlOption>,
    pub idk: String,
    pub pidk: Option<String>,
    pub nut: NutToken,
    pub nut_string: String,
    pub correlator_id: String,
    /// 需要持久化的客户端数据（仅 suk / vuk）
    pub client_data: BTreeMap<String, String>,
    pub urs: Option<String>,
    /// 签名覆盖的原始内容：client || server
    pub signed_message: Vec<u8>,
    pub ips_matched: bool,
}

impl ClientRequest {
    pub fn has_option(&self, option: SqrlOption) -> bool {
        self.options.contains(&option)
    }
}

/// 请求校验器
pub struct RequestValidator<'a> {
    config: &'a ProtocolConfig,
    nut_context: &'a NutContext,
    server_versions: &'a BTreeSet<u32>,
}

impl<'a> RequestValidator<'a> {
    pub fn new(
        config: &'a ProtocolConfig,
        nut_context: &'a NutContext,
        server_versions: &'a BTreeSet<u32>,
    ) -> Self {
        Self {
            config,
            nut_context,
            server_versions,
        }
    }

    /// 解码并检查 Nut 新鲜度
    ///
    /// 过期与无法解码使用同一条错误信息和日志，避免成为探测依据
    pub fn check_nut(&self, encoded: &str, now: u64) -> SqrlResult<NutToken> {
        let nut = self
            .nut_context
            .parse(encoded)
            .ok()
            .filter(|nut| !nut.is_expired(now, self.config.nut_validity_secs));

        nut.ok_or_else(|| {
            warn!("Rejected invalid or expired nut");
            SqrlError::invalid_request("Invalid or expired nut")
        })
    }

    /// 完整校验，会在事务内记录 Nut 已使用
    pub async fn validate(
        &self,
        request: &SanitizedRequest,
        correlator: &Correlator,
        client_ip: &IpAddr,
        tx: &mut dyn SqrlTransaction,
        now: u64,
    ) -> SqrlResult<ClientRequest> {
        let nut = self.check_nut(&request.nut, now)?;

        if tx.has_token_been_used(&request.nut).await? {
            warn!("Nut replay detected for correlator {}", correlator.id());
            return Err(SqrlError::NutTokenReplayed(request.nut.clone()));
        }
        tx.mark_token_used(
            correlator.id(),
            &request.nut,
            nut.issued_at + self.config.nut_validity_secs,
        )
        .await?;

        let params = &request.client_params;

        let client_versions = parse_version_list(params.get("ver").map(String::as_str).unwrap_or(""));
        let version = highest_common(self.server_versions, &client_versions).ok_or_else(|| {
            SqrlError::invalid_request_with(
                "No mutually supported protocol version",
                TifFlag::FunctionNotSupported,
            )
        })?;

        let cmd = params
            .get("cmd")
            .ok_or_else(|| SqrlError::invalid_request("Missing cmd"))?;
        let command = SqrlCommand::from_str(cmd)
            .map_err(|_| SqrlError::UnsupportedCommand(cmd.clone()))?;

        let idk = params
            .get("idk")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| SqrlError::invalid_request("Missing idk"))?;
        let pidk = params.get("pidk").filter(|v| !v.is_empty()).cloned();

        let mut signed_message = Vec::with_capacity(request.client.len() + request.server.len());
        signed_message.extend_from_slice(request.client.as_bytes());
        signed_message.extend_from_slice(request.server.as_bytes());

        verify_signature(&idk, &signed_message, &request.ids)?;
        if let Some(pidk) = &pidk {
            let pids = request
                .pids
                .as_deref()
                .ok_or_else(|| SqrlError::invalid_request("pidk supplied without pids"))?;
            verify_signature(pidk, &signed_message, pids)?;
        }

        self.check_server_echo(request, correlator)?;

        let options = parse_options(params.get("opt").map(String::as_str).unwrap_or(""));

        let client_data = params
            .iter()
            .filter(|(k, _)| PERSISTED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let ips_matched = nut.ip_matches(client_ip);
        if !ips_matched {
            debug!("Client IP does not match nut for correlator {}", correlator.id());
        }

        Ok(ClientRequest {
            version,
            command,
            options,
            idk,
            pidk,
            nut,
            nut_string: request.nut.clone(),
            correlator_id: correlator.id().to_string(),
            client_data,
            urs: request.urs.clone(),
            signed_message,
            ips_matched,
        })
    }

    /// 校验客户端回传的 server 参数与 Nut
    ///
    /// 首次请求回传的是 SQRL URL，之后回传的是上一次服务端应答，且必须使用该应答签发的 Nut
    fn check_server_echo(&self, request: &SanitizedRequest, correlator: &Correlator) -> SqrlResult<()> {
        match correlator.transient(TRANSIENT_SERVER_REPLY) {
            Some(previous) => {
                if previous != request.server {
                    return Err(SqrlError::invalid_request(
                        "Server parameter does not match previous reply",
                    ));
                }
                if correlator.transient(TRANSIENT_ISSUED_NUT) != Some(request.nut.as_str()) {
                    warn!("Nut not issued for correlator {}", correlator.id());
                    return Err(SqrlError::invalid_request(
                        "Nut was not issued by the previous reply",
                    ));
                }
            }
            None => {
                let text = base64url_decode_string(&request.server)
                    .map_err(|_| SqrlError::invalid_request("Server parameter is not text"))?;
                let url = Url::parse(&text)
                    .map_err(|_| SqrlError::invalid_request("Server parameter is not a SQRL URL"))?;

                let pairs: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
                if pairs.get("nut") != Some(&request.nut) || pairs.get("cor") != Some(&request.cor) {
                    return Err(SqrlError::invalid_request(
                        "Server parameter does not match the issued SQRL URL",
                    ));
                }
            }
        }
        Ok(())
    }
}
