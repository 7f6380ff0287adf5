//! SQRL 持久化抽象接口
//!
//! 协议引擎只通过这里定义的两个 trait 访问存储：
//!
//! - `SqrlPersistence`：事务工厂
//! - `SqrlTransaction`：单个请求内的全部读写，必须以 `commit` 或 `rollback` 结束

use crate::correlator::Correlator;
use crate::error::SqrlResult;
use crate::identity::IdentityFlag;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// 一次清理的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub correlators: u64,
    pub used_nuts: u64,
}

impl CleanupStats {
    pub fn total(&self) -> u64 {
        self.correlators + self.used_nuts
    }
}

/// 事务工厂
#[async_trait]
pub trait SqrlPersistence: Send + Sync {
    /// 开启新事务
    ///
    /// 同一时刻对同一关联器的读改写由事务隔离保证串行
    async fn begin(&self) -> SqrlResult<Box<dyn SqrlTransaction>>;

    /// 后端名称，用于日志
    fn backend_name(&self) -> &'static str;
}

/// 单个事务内可执行的操作
///
/// 未提交即被丢弃的事务等同于回滚
#[async_trait]
pub trait SqrlTransaction: Send {
    // ---- 身份 ----

    async fn identity_exists_by_idk(&mut self, idk: &str) -> SqrlResult<bool>;

    /// 用新 idk 原子替换旧 idk
    async fn rotate_idk(&mut self, old_idk: &str, new_idk: &str) -> SqrlResult<()>;

    /// 写入身份数据，身份不存在时创建
    async fn store_identity_data(
        &mut self,
        idk: &str,
        data: &BTreeMap<String, String>,
    ) -> SqrlResult<()>;

    async fn fetch_identity_data(&mut self, idk: &str, key: &str) -> SqrlResult<Option<String>>;

    async fn set_flag(&mut self, idk: &str, flag: IdentityFlag, value: bool) -> SqrlResult<()>;

    async fn get_flag(&mut self, idk: &str, flag: IdentityFlag) -> SqrlResult<Option<bool>>;

    async fn delete_identity(&mut self, idk: &str) -> SqrlResult<()>;

    /// 宿主应用用户关联
    async fn native_user_xref(&mut self, idk: &str) -> SqrlResult<Option<String>>;

    async fn set_native_user_xref(&mut self, idk: &str, xref: &str) -> SqrlResult<()>;

    /// 记录身份在某个关联器上完成认证
    async fn mark_authenticated(&mut self, idk: &str, correlator_id: &str) -> SqrlResult<()>;

    // ---- 关联器 ----

    /// 读取关联器，不存在时返回 `CorrelatorNotFound`
    async fn correlator_fetch_required(&mut self, id: &str) -> SqrlResult<Correlator>;

    async fn correlator_create(&mut self, id: &str, expires_at: u64) -> SqrlResult<Correlator>;

    async fn correlator_update(&mut self, correlator: &Correlator) -> SqrlResult<()>;

    async fn transient_data_fetch(
        &mut self,
        correlator_id: &str,
        key: &str,
    ) -> SqrlResult<Option<String>>;

    // ---- 已使用的 Nut ----

    /// 记录存在即返回 true，直到过期并被清理
    async fn has_token_been_used(&mut self, token: &str) -> SqrlResult<bool>;

    async fn mark_token_used(
        &mut self,
        correlator_id: &str,
        token: &str,
        expires_at: u64,
    ) -> SqrlResult<()>;

    // ---- 维护 ----

    /// 删除 `now` 之前过期的关联器和 Nut 记录
    async fn cleanup_expired(&mut self, now: u64) -> SqrlResult<CleanupStats>;

    async fn commit(self: Box<Self>) -> SqrlResult<()>;

    async fn rollback(self: Box<Self>) -> SqrlResult<()>;
}
