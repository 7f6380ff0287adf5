//! 命令分发
//!
//! 把已校验的请求映射到存储操作与关联器状态迁移。
//! 每个命令先完成全部可归因于客户端的检查，再执行任何写操作。

use crate::correlator::{Correlator, CorrelatorStatus, TRANSIENT_CPS_NONCE};
use crate::crypto::verify_signature;
use crate::encoding::base64url_encode;
use crate::error::{SqrlError, SqrlResult};
use crate::identity::{IdentityFlag, SUK, VUK};
use crate::request::{ClientRequest, SqrlCommand, SqrlOption};
use crate::storage::SqrlTransaction;
use crate::tif::{TifBuilder, TifFlag};
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{debug, info, warn};

/// 分发结果
#[derive(Debug)]
pub struct DispatchOutcome {
    pub tif: TifBuilder,
    /// 本次请求结束后身份所在的 idk（身份已删除或不存在时为 None）
    pub identity: Option<String>,
    /// CPS 一次性令牌
    pub cps_nonce: Option<String>,
}

/// 身份解析结果
enum Resolved {
    Current,
    Previous(String),
    Unknown,
}

/// 命令分发器
pub struct CommandDispatcher {
    enforce_ip_match: bool,
}

impl CommandDispatcher {
    pub fn new(enforce_ip_match: bool) -> Self {
        Self { enforce_ip_match }
    }

    pub async fn dispatch(
        &self,
        request: &ClientRequest,
        correlator: &mut Correlator,
        tx: &mut dyn SqrlTransaction,
    ) -> SqrlResult<DispatchOutcome> {
        let mut tif = TifBuilder::new(request.ips_matched);

        if self.enforce_ip_match
            && !request.ips_matched
            && request.command != SqrlCommand::Query
            && !request.has_option(SqrlOption::NoIpTest)
        {
            warn!(
                "Rejecting {} on correlator {}: client IP mismatch",
                request.command, request.correlator_id
            );
            tif.add_flag(TifFlag::CommandFailed);
            return Ok(DispatchOutcome {
                tif,
                identity: None,
                cps_nonce: None,
            });
        }

        debug!(
            "Dispatching {} for correlator {}",
            request.command, request.correlator_id
        );

        match request.command {
            SqrlCommand::Query => self.query(request, tx, tif).await,
            SqrlCommand::Ident => self.ident(request, correlator, tx, tif).await,
            SqrlCommand::Disable => self.disable(request, correlator, tx, tif).await,
            SqrlCommand::Enable => self.enable(request, tx, tif).await,
            SqrlCommand::Remove => self.remove(request, tx, tif).await,
        }
    }

    async fn resolve(
        &self,
        request: &ClientRequest,
        tx: &mut dyn SqrlTransaction,
    ) -> SqrlResult<Resolved> {
        if tx.identity_exists_by_idk(&request.idk).await? {
            return Ok(Resolved::Current);
        }
        if let Some(pidk) = &request.pidk
            && tx.identity_exists_by_idk(pidk).await?
        {
            return Ok(Resolved::Previous(pidk.clone()));
        }
        Ok(Resolved::Unknown)
    }

    /// 执行密钥轮换（如需要）并设置对应的 TIF 位，返回身份是否存在
    async fn apply_resolution(
        &self,
        resolved: &Resolved,
        request: &ClientRequest,
        tx: &mut dyn SqrlTransaction,
        tif: &mut TifBuilder,
    ) -> SqrlResult<bool> {
        match resolved {
            Resolved::Current => {
                tif.add_flag(TifFlag::IdMatch);
                Ok(true)
            }
            Resolved::Previous(pidk) => {
                info!("Rotating SQRL identity key for correlator {}", request.correlator_id);
                tx.rotate_idk(pidk, &request.idk).await?;
                tif.add_flag(TifFlag::PreviousIdMatch);
                Ok(true)
            }
            Resolved::Unknown => Ok(false),
        }
    }

    async fn is_disabled(&self, idk: &str, tx: &mut dyn SqrlTransaction) -> SqrlResult<bool> {
        Ok(tx.get_flag(idk, IdentityFlag::SqrlAuthEnabled).await? == Some(false))
    }

    /// 选项只对 query / remove 以外的命令生效
    async fn apply_options(
        &self,
        request: &ClientRequest,
        tx: &mut dyn SqrlTransaction,
    ) -> SqrlResult<()> {
        tx.set_flag(
            &request.idk,
            IdentityFlag::SqrlOnly,
            request.has_option(SqrlOption::SqrlOnly),
        )
        .await?;
        tx.set_flag(
            &request.idk,
            IdentityFlag::Hardlock,
            request.has_option(SqrlOption::Hardlock),
        )
        .await
    }

    /// 用已存储的 vuk 校验 urs
    async fn verify_unlock_signature(
        &self,
        request: &ClientRequest,
        tx: &mut dyn SqrlTransaction,
    ) -> SqrlResult<()> {
        let urs = request
            .urs
            .as_deref()
            .ok_or_else(|| SqrlError::invalid_request(format!("{} requires urs", request.command)))?;
        let vuk = tx
            .fetch_identity_data(&request.idk, VUK)
            .await?
            .ok_or_else(|| SqrlError::invalid_request("Identity has no stored vuk"))?;
        verify_signature(&vuk, &request.signed_message, urs)
    }

    async fn require_identity(
        &self,
        request: &ClientRequest,
        tx: &mut dyn SqrlTransaction,
    ) -> SqrlResult<()> {
        if !tx.identity_exists_by_idk(&request.idk).await? {
            return Err(SqrlError::invalid_request(format!(
                "{} on unknown identity",
                request.command
            )));
        }
        Ok(())
    }

    async fn query(
        &self,
        request: &ClientRequest,
        tx: &mut dyn SqrlTransaction,
        mut tif: TifBuilder,
    ) -> SqrlResult<DispatchOutcome> {
        let resolved = self.resolve(request, tx).await?;
        let exists = self.apply_resolution(&resolved, request, tx, &mut tif).await?;

        if exists && self.is_disabled(&request.idk, tx).await? {
            tif.add_flag(TifFlag::SqrlDisabled);
        }

        Ok(DispatchOutcome {
            tif,
            identity: exists.then(|| request.idk.clone()),
            cps_nonce: None,
        })
    }

    async fn ident(
        &self,
        request: &ClientRequest,
        correlator: &mut Correlator,
        tx: &mut dyn SqrlTransaction,
        mut tif: TifBuilder,
    ) -> SqrlResult<DispatchOutcome> {
        let resolved = self.resolve(request, tx).await?;

        // 检查阶段
        let disabled = match &resolved {
            Resolved::Current => self.is_disabled(&request.idk, tx).await?,
            Resolved::Previous(pidk) => self.is_disabled(pidk, tx).await?,
            Resolved::Unknown => false,
        };
        let is_new = matches!(resolved, Resolved::Unknown);
        if is_new && !(request.client_data.contains_key(SUK) && request.client_data.contains_key(VUK)) {
            return Err(SqrlError::invalid_request(
                "ident for a new identity requires suk and vuk",
            ));
        }

        if disabled {
            warn!("ident rejected for disabled identity on correlator {}", correlator.id());
            self.apply_resolution(&resolved, request, tx, &mut tif).await?;
            tif.add_flag(TifFlag::SqrlDisabled)
                .add_flag(TifFlag::CommandFailed);
            correlator.transition(CorrelatorStatus::SqrlUserDisabled)?;
            return Ok(DispatchOutcome {
                tif,
                identity: Some(request.idk.clone()),
                cps_nonce: None,
            });
        }

        // 写入阶段
        self.apply_resolution(&resolved, request, tx, &mut tif).await?;

        if !request.client_data.is_empty() {
            tx.store_identity_data(&request.idk, &request.client_data)
                .await?;
            for (key, expected) in &request.client_data {
                let stored = tx.fetch_identity_data(&request.idk, key).await?;
                if stored.as_deref() != Some(expected.as_str()) {
                    return Err(SqrlError::persistence(format!(
                        "Identity data {key} did not persist correctly"
                    )));
                }
            }
        }

        if is_new {
            info!("Enrolling new SQRL identity on correlator {}", correlator.id());
            tx.set_flag(&request.idk, IdentityFlag::SqrlAuthEnabled, true)
                .await?;
        }
        self.apply_options(request, tx).await?;
        tx.mark_authenticated(&request.idk, correlator.id()).await?;

        let cps = request.has_option(SqrlOption::Cps);
        let status = if cps {
            CorrelatorStatus::AuthenticatedCps
        } else {
            CorrelatorStatus::AuthenticatedBrowser
        };
        correlator.transition(status)?;
        correlator.bind_identity(request.idk.clone())?;

        let cps_nonce = cps.then(|| {
            let mut nonce = [0u8; 32];
            OsRng.fill_bytes(&mut nonce);
            let nonce = base64url_encode(nonce);
            correlator.set_transient(TRANSIENT_CPS_NONCE, nonce.clone());
            nonce
        });

        tif.add_flag(TifFlag::IdMatch);
        info!("Correlator {} authenticated ({})", correlator.id(), status);

        Ok(DispatchOutcome {
            tif,
            identity: Some(request.idk.clone()),
            cps_nonce,
        })
    }

    async fn disable(
        &self,
        request: &ClientRequest,
        correlator: &mut Correlator,
        tx: &mut dyn SqrlTransaction,
        mut tif: TifBuilder,
    ) -> SqrlResult<DispatchOutcome> {
        self.require_identity(request, tx).await?;

        tx.set_flag(&request.idk, IdentityFlag::SqrlAuthEnabled, false)
            .await?;
        self.apply_options(request, tx).await?;
        correlator.transition(CorrelatorStatus::SqrlUserDisabled)?;
        tif.add_flag(TifFlag::IdMatch).add_flag(TifFlag::SqrlDisabled);
        info!("SQRL identity disabled via correlator {}", correlator.id());

        Ok(DispatchOutcome {
            tif,
            identity: Some(request.idk.clone()),
            cps_nonce: None,
        })
    }

    async fn enable(
        &self,
        request: &ClientRequest,
        tx: &mut dyn SqrlTransaction,
        mut tif: TifBuilder,
    ) -> SqrlResult<DispatchOutcome> {
        self.require_identity(request, tx).await?;
        self.verify_unlock_signature(request, tx).await?;

        tx.set_flag(&request.idk, IdentityFlag::SqrlAuthEnabled, true)
            .await?;
        self.apply_options(request, tx).await?;
        tif.add_flag(TifFlag::IdMatch);
        info!("SQRL identity re-enabled via correlator {}", request.correlator_id);

        Ok(DispatchOutcome {
            tif,
            identity: Some(request.idk.clone()),
            cps_nonce: None,
        })
    }

    async fn remove(
        &self,
        request: &ClientRequest,
        tx: &mut dyn SqrlTransaction,
        tif: TifBuilder,
    ) -> SqrlResult<DispatchOutcome> {
        self.require_identity(request, tx).await?;
        self.verify_unlock_signature(request, tx).await?;

        tx.delete_identity(&request.idk).await?;
        info!("SQRL identity removed via correlator {}", request.correlator_id);

        Ok(DispatchOutcome {
            tif,
            identity: None,
            cps_nonce: None,
        })
    }
}
