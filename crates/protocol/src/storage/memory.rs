//! 内存存储后端
//!
//! 事务持有整个状态的锁并在副本上修改，提交时写回，回滚时直接丢弃副本。

use super::backend::{CleanupStats, SqrlPersistence, SqrlTransaction};
use crate::correlator::Correlator;
use crate::error::{SqrlError, SqrlResult};
use crate::identity::IdentityFlag;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct IdentityRecord {
    data: BTreeMap<String, String>,
    flags: HashMap<IdentityFlag, bool>,
    native_user_xref: Option<String>,
    last_correlator: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    identities: HashMap<String, IdentityRecord>,
    correlators: HashMap<String, Correlator>,
    /// 已使用的 Nut -> 过期时间
    used_nuts: HashMap<String, u64>,
}

/// 内存存储后端
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SqrlPersistence for MemoryBackend {
    async fn begin(&self) -> SqrlResult<Box<dyn SqrlTransaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl MemoryTransaction {
    fn identity_mut(&mut self, idk: &str) -> SqrlResult<&mut IdentityRecord> {
        self.working
            .identities
            .get_mut(idk)
            .ok_or_else(|| SqrlError::persistence(format!("Identity not found: {idk}")))
    }
}

#[async_trait]
impl SqrlTransaction for MemoryTransaction {
    async fn identity_exists_by_idk(&mut self, idk: &str) -> SqrlResult<bool> {
        Ok(self.working.identities.contains_key(idk))
    }

    async fn rotate_idk(&mut self, old_idk: &str, new_idk: &str) -> SqrlResult<()> {
        if self.working.identities.contains_key(new_idk) {
            return Err(SqrlError::persistence(format!(
                "Cannot rotate to existing idk: {new_idk}"
            )));
        }
        let record = self
            .working
            .identities
            .remove(old_idk)
            .ok_or_else(|| SqrlError::persistence(format!("Identity not found: {old_idk}")))?;
        self.working.identities.insert(new_idk.to_string(), record);
        Ok(())
    }

    async fn store_identity_data(
        &mut self,
        idk: &str,
        data: &BTreeMap<String, String>,
    ) -> SqrlResult<()> {
        let record = self.working.identities.entry(idk.to_string()).or_default();
        record
            .data
            .extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn fetch_identity_data(&mut self, idk: &str, key: &str) -> SqrlResult<Option<String>> {
        Ok(self
            .working
            .identities
            .get(idk)
            .and_then(|r| r.data.get(key).cloned()))
    }

    async fn set_flag(&mut self, idk: &str, flag: IdentityFlag, value: bool) -> SqrlResult<()> {
        self.identity_mut(idk)?.flags.insert(flag, value);
        Ok(())
    }

    async fn get_flag(&mut self, idk: &str, flag: IdentityFlag) -> SqrlResult<Option<bool>> {
        Ok(self
            .working
            .identities
            .get(idk)
            .and_then(|r| r.flags.get(&flag).copied()))
    }

    async fn delete_identity(&mut self, idk: &str) -> SqrlResult<()> {
        self.working.identities.remove(idk);
        Ok(())
    }

    async fn native_user_xref(&mut self, idk: &str) -> SqrlResult<Option<String>> {
        Ok(self
            .working
            .identities
            .get(idk)
            .and_then(|r| r.native_user_xref.clone()))
    }

    async fn set_native_user_xref(&mut self, idk: &str, xref: &str) -> SqrlResult<()> {
        self.identity_mut(idk)?.native_user_xref = Some(xref.to_string());
        Ok(())
    }

    async fn mark_authenticated(&mut self, idk: &str, correlator_id: &str) -> SqrlResult<()> {
        self.identity_mut(idk)?.last_correlator = Some(correlator_id.to_string());
        Ok(())
    }

    async fn correlator_fetch_required(&mut self, id: &str) -> SqrlResult<Correlator> {
        self.working
            .correlators
            .get(id)
            .cloned()
            .ok_or_else(|| SqrlError::CorrelatorNotFound(id.to_string()))
    }

    async fn correlator_create(&mut self, id: &str, expires_at: u64) -> SqrlResult<Correlator> {
        if self.working.correlators.contains_key(id) {
            return Err(SqrlError::persistence(format!(
                "Correlator already exists: {id}"
            )));
        }
        let correlator = Correlator::new(id, crate::unix_timestamp(), expires_at);
        self.working
            .correlators
            .insert(id.to_string(), correlator.clone());
        Ok(correlator)
    }

    async fn correlator_update(&mut self, correlator: &Correlator) -> SqrlResult<()> {
        match self.working.correlators.get_mut(correlator.id()) {
            Some(existing) => {
                *existing = correlator.clone();
                Ok(())
            }
            None => Err(SqrlError::CorrelatorNotFound(correlator.id().to_string())),
        }
    }

    async fn transient_data_fetch(
        &mut self,
        correlator_id: &str,
        key: &str,
    ) -> SqrlResult<Option<String>> {
        Ok(self
            .working
            .correlators
            .get(correlator_id)
            .and_then(|c| c.transient(key).map(str::to_string)))
    }

    async fn has_token_been_used(&mut self, token: &str) -> SqrlResult<bool> {
        Ok(self.working.used_nuts.contains_key(token))
    }

    async fn mark_token_used(
        &mut self,
        _correlator_id: &str,
        token: &str,
        expires_at: u64,
    ) -> SqrlResult<()> {
        if self.working.used_nuts.contains_key(token) {
            return Err(SqrlError::NutTokenReplayed(token.to_string()));
        }
        self.working.used_nuts.insert(token.to_string(), expires_at);
        Ok(())
    }

    async fn cleanup_expired(&mut self, now: u64) -> SqrlResult<CleanupStats> {
        let correlators_before = self.working.correlators.len();
        self.working.correlators.retain(|_, c| !c.is_expired(now));
        let used_before = self.working.used_nuts.len();
        self.working.used_nuts.retain(|_, expires_at| *expires_at >= now);

        let stats = CleanupStats {
            correlators: (correlators_before - self.working.correlators.len()) as u64,
            used_nuts: (used_before - self.working.used_nuts.len()) as u64,
        };
        debug!("Memory backend cleanup removed {:?}", stats);
        Ok(stats)
    }

    async fn commit(self: Box<Self>) -> SqrlResult<()> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> SqrlResult<()> {
        Ok(())
    }
}
