//! 关联器状态机
//!
//! 关联器把浏览器轮询会话与 SQRL 客户端的带外回调串联起来，跨越多次 HTTP 往返。
//!
//! ```text
//! CORRELATOR_ISSUED -> COMMUNICATING -> AUTHENTICATED_BROWSER | AUTHENTICATED_CPS
//!                                    -> ERROR_BAD_REQUEST | ERROR_SQRL_INTERNAL | SQRL_USER_DISABLED
//! ```

use crate::encoding::base64url_encode;
use crate::error::{SqrlError, SqrlResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use strum::{AsRefStr, Display, EnumString};

/// 瞬态数据键：上一次服务端应答（用于校验客户端回传的 server 参数）
pub const TRANSIENT_SERVER_REPLY: &str = "server_reply";
/// 瞬态数据键：上一次应答签发的 Nut，后续请求必须使用它
pub const TRANSIENT_ISSUED_NUT: &str = "issued_nut";
/// 瞬态数据键：CPS 一次性令牌
pub const TRANSIENT_CPS_NONCE: &str = "cps_nonce";

/// 关联器状态
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrelatorStatus {
    CorrelatorIssued,
    Communicating,
    AuthenticatedBrowser,
    AuthenticatedCps,
    ErrorBadRequest,
    ErrorSqrlInternal,
    SqrlUserDisabled,
}

impl CorrelatorStatus {
    /// 终止状态（成功或失败）
    pub fn is_updates_complete(&self) -> bool {
        !matches!(self, Self::CorrelatorIssued | Self::Communicating)
    }

    /// 成功终止状态
    pub fn is_auth_complete(&self) -> bool {
        matches!(self, Self::AuthenticatedBrowser | Self::AuthenticatedCps)
    }

    pub fn can_transition_to(&self, next: CorrelatorStatus) -> bool {
        match self {
            Self::CorrelatorIssued => next == Self::Communicating,
            Self::Communicating => next != Self::CorrelatorIssued,
            _ => false,
        }
    }
}

/// 由页面 Nut 派生关联器 ID，防止被猜测
pub fn correlator_id_for(page_nut: &str) -> String {
    base64url_encode(Sha256::digest(page_nut.as_bytes()))
}

/// 关联器记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlator {
    id: String,
    status: CorrelatorStatus,
    created_at: u64,
    expires_at: u64,
    transient_auth_data: BTreeMap<String, String>,
    authenticated_idk: Option<String>,
}

impl Correlator {
    pub fn new(id: impl Into<String>, created_at: u64, expires_at: u64) -> Self {
        Self {
            id: id.into(),
            status: CorrelatorStatus::CorrelatorIssued,
            created_at,
            expires_at,
            transient_auth_data: BTreeMap::new(),
            authenticated_idk: None,
        }
    }

    /// 从存储记录恢复
    pub fn restore(
        id: String,
        status: CorrelatorStatus,
        created_at: u64,
        expires_at: u64,
        transient_auth_data: BTreeMap<String, String>,
        authenticated_idk: Option<String>,
    ) -> Self {
        Self {
            id,
            status,
            created_at,
            expires_at,
            transient_auth_data,
            authenticated_idk,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> CorrelatorStatus {
        self.status
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// 过期时间之后（不含）视为过期
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    pub fn transient_auth_data(&self) -> &BTreeMap<String, String> {
        &self.transient_auth_data
    }

    pub fn transient(&self, key: &str) -> Option<&str> {
        self.transient_auth_data.get(key).map(String::as_str)
    }

    pub fn set_transient(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.transient_auth_data.insert(key.into(), value.into());
    }

    pub fn remove_transient(&mut self, key: &str) -> Option<String> {
        self.transient_auth_data.remove(key)
    }

    /// 状态迁移，非法迁移返回 `IllegalState`
    pub fn transition(&mut self, next: CorrelatorStatus) -> SqrlResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SqrlError::illegal_state(format!(
                "Correlator {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// 绑定已认证身份，必须在迁移到成功终止状态之后调用
    pub fn bind_identity(&mut self, idk: impl Into<String>) -> SqrlResult<()> {
        if !self.status.is_auth_complete() {
            return Err(SqrlError::illegal_state(format!(
                "Cannot bind identity while correlator is {}",
                self.status
            )));
        }
        self.authenticated_idk = Some(idk.into());
        Ok(())
    }

    /// 已认证身份，仅在成功终止状态下可读
    pub fn authenticated_identity(&self) -> SqrlResult<&str> {
        if !self.status.is_auth_complete() {
            return Err(SqrlError::illegal_state(format!(
                "Authenticated identity is not available while correlator is {}",
                self.status
            )));
        }
        self.authenticated_idk
            .as_deref()
            .ok_or_else(|| SqrlError::illegal_state("Authenticated correlator has no identity"))
    }

    /// 原始字段，供存储层序列化
    pub fn authenticated_idk_raw(&self) -> Option<&str> {
        self.authenticated_idk.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_strings() {
        assert_eq!(CorrelatorStatus::CorrelatorIssued.to_string(), "CORRELATOR_ISSUED");
        assert_eq!(
            CorrelatorStatus::from_str("AUTHENTICATED_CPS").unwrap(),
            CorrelatorStatus::AuthenticatedCps
        );
        assert_eq!(
            serde_json::to_string(&CorrelatorStatus::SqrlUserDisabled).unwrap(),
            "\"SQRL_USER_DISABLED\""
        );
    }

    #[test]
    fn test_completion_predicates() {
        use CorrelatorStatus::*;
        for status in [AuthenticatedBrowser, AuthenticatedCps] {
            assert!(status.is_updates_complete());
            assert!(status.is_auth_complete());
        }
        for status in [ErrorBadRequest, ErrorSqrlInternal, SqrlUserDisabled] {
            assert!(status.is_updates_complete());
            assert!(!status.is_auth_complete());
        }
        for status in [CorrelatorIssued, Communicating] {
            assert!(!status.is_updates_complete());
        }
    }

    #[test]
    fn test_transitions() {
        let mut cor = Correlator::new("cor1", 0, 100);
        assert_eq!(cor.status(), CorrelatorStatus::CorrelatorIssued);

        // 不能跳过 COMMUNICATING
        assert!(cor.transition(CorrelatorStatus::AuthenticatedBrowser).is_err());

        cor.transition(CorrelatorStatus::Communicating).unwrap();
        cor.transition(CorrelatorStatus::Communicating).unwrap();
        cor.transition(CorrelatorStatus::AuthenticatedCps).unwrap();

        // 终止状态不可再变
        assert!(matches!(
            cor.transition(CorrelatorStatus::Communicating),
            Err(SqrlError::IllegalState(_))
        ));
    }

    #[test]
    fn test_authenticated_identity_guard() {
        let mut cor = Correlator::new("cor1", 0, 100);
        cor.transition(CorrelatorStatus::Communicating).unwrap();
        assert!(cor.bind_identity("ABC").is_err());
        assert!(matches!(
            cor.authenticated_identity(),
            Err(SqrlError::IllegalState(_))
        ));

        cor.transition(CorrelatorStatus::AuthenticatedBrowser).unwrap();
        cor.bind_identity("ABC").unwrap();
        assert_eq!(cor.authenticated_identity().unwrap(), "ABC");
    }

    #[test]
    fn test_correlator_id_derivation() {
        let a = correlator_id_for("nut-a");
        assert_eq!(a, correlator_id_for("nut-a"));
        assert_ne!(a, correlator_id_for("nut-b"));
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn test_transient_data() {
        let mut cor = Correlator::new("cor1", 0, 100);
        cor.set_transient(TRANSIENT_SERVER_REPLY, "abc");
        assert_eq!(cor.transient(TRANSIENT_SERVER_REPLY), Some("abc"));
        assert_eq!(cor.remove_transient(TRANSIENT_SERVER_REPLY), Some("abc".into()));
        assert!(cor.transient(TRANSIENT_SERVER_REPLY).is_none());
        assert!(cor.is_expired(101));
        assert!(!cor.is_expired(100));
    }
}
