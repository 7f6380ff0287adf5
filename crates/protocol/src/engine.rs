//! SQRL 协议引擎
//!
//! 每个客户端请求的处理流程：
//!
//! 1. 语法检查（失败直接返回 `InvalidData`，不访问存储）
//! 2. 开启事务，读取关联器（不存在或已过期时无法构造应答）
//! 3. 校验 -> 分发 -> 构建应答 -> 更新关联器 -> 提交
//! 4. 任何失败都回滚，再用新事务记录失败状态并返回带失败 TIF 位的应答

use crate::config::ProtocolConfig;
use crate::correlator::{
    Correlator, CorrelatorStatus, TRANSIENT_CPS_NONCE, TRANSIENT_ISSUED_NUT, TRANSIENT_SERVER_REPLY,
    correlator_id_for,
};
use crate::crypto::NutCipher;
use crate::dispatcher::CommandDispatcher;
use crate::error::{SqrlError, SqrlResult};
use crate::identity::{SUK, VUK};
use crate::nut::NutContext;
use crate::reply::{ReplyBuilder, SqrlReply};
use crate::request::{RawSqrlRequest, RequestValidator, SanitizedRequest, SqrlOption};
use crate::storage::{CleanupStats, SqrlPersistence, SqrlTransaction};
use crate::tif::{TifBuilder, TifFlag};
use crate::unix_timestamp;
use crate::version::format_version_list;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

/// 登录页面需要的数据
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticationPage {
    /// 放进二维码/链接的完整 SQRL URL
    pub sqrl_url: String,
    pub nut: String,
    pub correlator_id: String,
    pub expires_at: u64,
}

/// 浏览器轮询时看到的关联器状态
#[derive(Debug, Clone, Serialize)]
pub struct CorrelatorSnapshot {
    pub correlator_id: String,
    pub status: CorrelatorStatus,
    pub expires_at: u64,
    pub authenticated: bool,
    pub complete: bool,
}

/// SQRL 协议引擎
pub struct SqrlEngine {
    config: ProtocolConfig,
    nut_context: NutContext,
    persistence: Arc<dyn SqrlPersistence>,
    server_versions: BTreeSet<u32>,
    backchannel: Url,
}

impl std::fmt::Debug for SqrlEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqrlEngine")
            .field("backend", &self.persistence.backend_name())
            .field("backchannel", &self.backchannel.as_str())
            .finish_non_exhaustive()
    }
}

impl SqrlEngine {
    /// 从配置创建引擎
    ///
    /// 缺少 Nut 密钥或回调地址非法时返回 `IllegalState`
    pub fn new(config: ProtocolConfig, persistence: Arc<dyn SqrlPersistence>) -> SqrlResult<Self> {
        let source = config
            .get_nut_key_source()
            .ok_or_else(|| SqrlError::illegal_state("No nut key configured"))?;
        let cipher = NutCipher::from_key_source(&source)?;
        Self::with_cipher(config, cipher, persistence)
    }

    pub fn with_cipher(
        config: ProtocolConfig,
        cipher: NutCipher,
        persistence: Arc<dyn SqrlPersistence>,
    ) -> SqrlResult<Self> {
        let errors = config.validate();
        let fatal: Vec<_> = errors.into_iter().filter(|e| !e.contains("nut_key")).collect();
        if !fatal.is_empty() {
            return Err(SqrlError::illegal_state(fatal.join("; ")));
        }

        let backchannel = Url::parse(&config.backchannel_url)
            .map_err(|e| SqrlError::illegal_state(format!("Invalid backchannel url: {e}")))?;
        let server_versions = config.server_versions();

        info!(
            "SQRL engine initialized (backend: {}, versions: {})",
            persistence.backend_name(),
            format_version_list(&server_versions)
        );

        Ok(Self {
            config,
            nut_context: NutContext::new(cipher),
            persistence,
            server_versions,
            backchannel,
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn nut_context(&self) -> &NutContext {
        &self.nut_context
    }

    pub fn persistence(&self) -> &Arc<dyn SqrlPersistence> {
        &self.persistence
    }

    /// 构造带 nut / cor 参数的 SQRL URL
    pub fn sqrl_url(&self, nut: &str, correlator_id: &str) -> String {
        let mut url = self.backchannel.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("nut", nut)
            .append_pair("cor", correlator_id);
        url.to_string()
    }

    /// 渲染登录页面：签发页面 Nut 并创建关联器
    pub async fn begin_authentication(&self, client_ip: &IpAddr) -> SqrlResult<AuthenticationPage> {
        let (_, nut) = self.nut_context.mint(client_ip);
        let correlator_id = correlator_id_for(&nut);
        let expires_at = unix_timestamp() + self.config.correlator_ttl_secs;

        let mut tx = self.persistence.begin().await?;
        tx.correlator_create(&correlator_id, expires_at).await?;
        tx.commit().await?;

        debug!("Issued correlator {}", correlator_id);
        Ok(AuthenticationPage {
            sqrl_url: self.sqrl_url(&nut, &correlator_id),
            nut,
            correlator_id,
            expires_at,
        })
    }

    /// 处理 SQRL 客户端回调
    ///
    /// 返回 `Err` 表示无法构造协议应答，调用方应回复裸 HTTP 错误
    pub async fn handle_request(
        &self,
        raw: RawSqrlRequest,
        client_ip: &IpAddr,
    ) -> SqrlResult<SqrlReply> {
        let request = match raw.sanitize() {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejected malformed SQRL request: {}", e);
                return Err(e);
            }
        };
        let now = unix_timestamp();

        let mut tx = self.persistence.begin().await?;
        let mut correlator = match tx.correlator_fetch_required(&request.cor).await {
            Ok(c) if !c.is_expired(now) => c,
            Ok(_) => {
                tx.rollback().await?;
                warn!("SQRL request for expired correlator {}", request.cor);
                return Err(SqrlError::CorrelatorNotFound(request.cor));
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!("Rollback failed: {}", rollback_err);
                }
                warn!("SQRL request for unknown correlator: {}", e);
                return Err(e);
            }
        };

        if correlator.status().is_updates_complete() {
            tx.rollback().await?;
            warn!(
                "SQRL request for completed correlator {} ({})",
                correlator.id(),
                correlator.status()
            );
            let mut tif = TifBuilder::new(self.ips_matched(&request.nut, client_ip));
            tif.add_flag(TifFlag::CommandFailed)
                .add_flag(TifFlag::ClientFailure);
            return Ok(self
                .reply_builder(correlator.id(), tif)
                .build(client_ip));
        }

        let result = self
            .process(&request, &mut correlator, client_ip, now, tx.as_mut())
            .await;

        match result {
            Ok(reply) => match tx.commit().await {
                Ok(()) => Ok(reply),
                Err(e) => {
                    error!("Failed to commit SQRL transaction: {}", e);
                    self.record_failure(&request, client_ip, e).await
                }
            },
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!("Rollback failed: {}", rollback_err);
                }
                self.record_failure(&request, client_ip, e).await
            }
        }
    }

    async fn process(
        &self,
        request: &SanitizedRequest,
        correlator: &mut Correlator,
        client_ip: &IpAddr,
        now: u64,
        tx: &mut dyn SqrlTransaction,
    ) -> SqrlResult<SqrlReply> {
        if correlator.status() == CorrelatorStatus::CorrelatorIssued {
            correlator.transition(CorrelatorStatus::Communicating)?;
        }

        let validator = RequestValidator::new(&self.config, &self.nut_context, &self.server_versions);
        let client_request = validator
            .validate(request, correlator, client_ip, tx, now)
            .await?;

        let dispatcher = CommandDispatcher::new(self.config.enforce_ip_match);
        let outcome = dispatcher.dispatch(&client_request, correlator, tx).await?;

        let mut builder = self.reply_builder(correlator.id(), outcome.tif.clone());

        if client_request.has_option(SqrlOption::Suk)
            && let Some(idk) = &outcome.identity
        {
            for key in [SUK, VUK] {
                if let Some(value) = tx.fetch_identity_data(idk, key).await? {
                    builder = builder.option_field(key, value);
                }
            }
        }

        if let (Some(nonce), Some(cps_url)) = (&outcome.cps_nonce, &self.config.cps_url) {
            builder = builder.extension_field("url", self.cps_redirect(cps_url, correlator.id(), nonce)?);
        }

        let reply = builder.build(client_ip);
        correlator.set_transient(TRANSIENT_SERVER_REPLY, reply.encoded.clone());
        correlator.set_transient(TRANSIENT_ISSUED_NUT, reply.nut.clone());
        tx.correlator_update(correlator).await?;

        debug!(
            "Processed {} for correlator {} (tif={})",
            client_request.command,
            correlator.id(),
            reply.tif
        );
        Ok(reply)
    }

    fn cps_redirect(&self, cps_url: &str, correlator_id: &str, nonce: &str) -> SqrlResult<String> {
        let mut url = Url::parse(cps_url)
            .map_err(|e| SqrlError::illegal_state(format!("Invalid cps url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("cor", correlator_id)
            .append_pair("token", nonce);
        Ok(url.to_string())
    }

    fn reply_builder<'a>(&'a self, correlator_id: &'a str, tif: TifBuilder) -> ReplyBuilder<'a> {
        ReplyBuilder::new(
            &self.nut_context,
            format_version_list(&self.server_versions),
            self.backchannel.path(),
            correlator_id,
            tif.create_response(),
        )
    }

    fn ips_matched(&self, nut: &str, client_ip: &IpAddr) -> bool {
        self.nut_context
            .parse(nut)
            .map(|token| token.ip_matches(client_ip))
            .unwrap_or(false)
    }

    /// 在新事务中记录失败并构造失败应答
    ///
    /// 客户端错误：消耗 Nut，关联器进入 ERROR_BAD_REQUEST。
    /// 服务端错误：关联器进入 ERROR_SQRL_INTERNAL。
    /// 如果连失败状态都无法写入，返回原始错误。
    async fn record_failure(
        &self,
        request: &SanitizedRequest,
        client_ip: &IpAddr,
        err: SqrlError,
    ) -> SqrlResult<SqrlReply> {
        if err.is_client_error() {
            warn!("SQRL client error on correlator {}: {}", request.cor, err);
        } else {
            error!("SQRL server error on correlator {}: {}", request.cor, err);
        }

        match self.try_record_failure(request, client_ip, &err).await {
            Ok(reply) => Ok(reply),
            Err(record_err) => {
                error!(
                    "Failed to record SQRL failure for correlator {}: {}",
                    request.cor, record_err
                );
                Err(err)
            }
        }
    }

    async fn try_record_failure(
        &self,
        request: &SanitizedRequest,
        client_ip: &IpAddr,
        err: &SqrlError,
    ) -> SqrlResult<SqrlReply> {
        let mut tx = self.persistence.begin().await?;
        let mut correlator = tx.correlator_fetch_required(&request.cor).await?;

        if err.is_client_error()
            && let Ok(nut) = self.nut_context.parse(&request.nut)
            && !tx.has_token_been_used(&request.nut).await?
        {
            tx.mark_token_used(
                correlator.id(),
                &request.nut,
                nut.issued_at + self.config.nut_validity_secs,
            )
            .await?;
        }

        if !correlator.status().is_updates_complete() {
            if correlator.status() == CorrelatorStatus::CorrelatorIssued {
                correlator.transition(CorrelatorStatus::Communicating)?;
            }
            let status = if err.is_client_error() {
                CorrelatorStatus::ErrorBadRequest
            } else {
                CorrelatorStatus::ErrorSqrlInternal
            };
            correlator.transition(status)?;
        }

        let mut tif = TifBuilder::new(self.ips_matched(&request.nut, client_ip));
        tif.add_bits(err.tif_flags());
        let reply = self.reply_builder(correlator.id(), tif).build(client_ip);

        correlator.set_transient(TRANSIENT_SERVER_REPLY, reply.encoded.clone());
        correlator.set_transient(TRANSIENT_ISSUED_NUT, reply.nut.clone());
        tx.correlator_update(&correlator).await?;
        tx.commit().await?;
        Ok(reply)
    }

    /// 浏览器轮询关联器状态
    pub async fn correlator_status(&self, correlator_id: &str) -> SqrlResult<CorrelatorSnapshot> {
        let mut tx = self.persistence.begin().await?;
        let result = tx.correlator_fetch_required(correlator_id).await;
        tx.rollback().await?;

        let correlator = result?;
        if correlator.is_expired(unix_timestamp()) {
            return Err(SqrlError::CorrelatorNotFound(correlator_id.to_string()));
        }

        Ok(CorrelatorSnapshot {
            correlator_id: correlator.id().to_string(),
            status: correlator.status(),
            expires_at: correlator.expires_at(),
            authenticated: correlator.status().is_auth_complete(),
            complete: correlator.status().is_updates_complete(),
        })
    }

    /// 读取已完成认证的身份（宿主应用建立会话时调用）
    pub async fn authenticated_identity(&self, correlator_id: &str) -> SqrlResult<String> {
        let mut tx = self.persistence.begin().await?;
        let result = tx.correlator_fetch_required(correlator_id).await;
        tx.rollback().await?;

        result?.authenticated_identity().map(str::to_string)
    }

    /// 兑换 CPS 一次性令牌，返回已认证的 idk
    pub async fn redeem_cps_token(&self, correlator_id: &str, token: &str) -> SqrlResult<String> {
        let mut tx = self.persistence.begin().await?;
        let mut correlator = match tx.correlator_fetch_required(correlator_id).await {
            Ok(c) => c,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        let valid = correlator.status() == CorrelatorStatus::AuthenticatedCps
            && !correlator.is_expired(unix_timestamp())
            && correlator
                .transient(TRANSIENT_CPS_NONCE)
                .is_some_and(|nonce| tokens_match(nonce, token));
        if !valid {
            tx.rollback().await?;
            warn!("Rejected CPS token for correlator {}", correlator_id);
            return Err(SqrlError::invalid_request("Invalid CPS token"));
        }

        let idk = correlator.authenticated_identity()?.to_string();
        correlator.remove_transient(TRANSIENT_CPS_NONCE);
        tx.correlator_update(&correlator).await?;
        tx.commit().await?;

        info!("CPS token redeemed for correlator {}", correlator_id);
        Ok(idk)
    }

    /// 清理过期的关联器与 Nut 记录
    pub async fn cleanup_expired(&self) -> SqrlResult<CleanupStats> {
        let mut tx = self.persistence.begin().await?;
        let stats = tx.cleanup_expired(unix_timestamp()).await?;
        tx.commit().await?;
        Ok(stats)
    }
}

/// 比较摘要而非原文，比较耗时与令牌内容无关
fn tokens_match(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("Zm9vYmFy", "Zm9vYmFy"));
        assert!(!tokens_match("Zm9vYmFy", "Zm9vYmFz"));
        assert!(!tokens_match("Zm9vYmFy", ""));
    }
}
