//! SQLite 存储后端实现
//!
//! 使用 sqlx 异步接口。SQRL 事务在进程内通过写锁串行化，
//! 避免 WAL 模式下延迟事务升级为写事务时出现 SQLITE_BUSY。

use super::backend::{CleanupStats, SqrlPersistence, SqrlTransaction};
use super::config::SqliteConfig;
use crate::correlator::{Correlator, CorrelatorStatus};
use crate::error::{SqrlError, SqrlResult};
use crate::identity::IdentityFlag;
use crate::unix_timestamp;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// SQLite 存储后端
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteBackend {
    /// 创建新的 SQLite 后端实例
    ///
    /// # Arguments
    /// * `config` - SQLite 配置
    /// * `db_path` - 数据库文件存储目录路径
    pub async fn new(config: &SqliteConfig, db_path: &Path) -> SqrlResult<Self> {
        let db_file = db_path.join(&config.path);
        info!("Initializing SQRL SQLite storage at: {}", db_file.display());

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_file.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let backend = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        backend.init().await?;
        Ok(backend)
    }

    /// 初始化数据库表
    async fn init(&self) -> SqrlResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sqrl_identity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                idk TEXT NOT NULL UNIQUE,
                native_user_xref TEXT,
                last_correlator TEXT,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sqrl_identity_data (
                identity_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (identity_id, name)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sqrl_identity_flag (
                identity_id INTEGER NOT NULL,
                flag TEXT NOT NULL,
                value INTEGER NOT NULL,
                PRIMARY KEY (identity_id, flag)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sqrl_correlator (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                transient_data TEXT NOT NULL,
                authenticated_idk TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sqrl_used_nut (
                token TEXT PRIMARY KEY,
                correlator_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sqrl_correlator_expires ON sqrl_correlator(expires_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sqrl_used_nut_expires ON sqrl_used_nut(expires_at)",
        )
        .execute(&self.pool)
        .await?;

        debug!("SQRL SQLite tables initialized");
        Ok(())
    }
}

#[async_trait]
impl SqrlPersistence for SqliteBackend {
    async fn begin(&self) -> SqrlResult<Box<dyn SqrlTransaction>> {
        let guard = Arc::clone(&self.write_lock).lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx, _guard: guard }))
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

impl SqliteTransaction {
    async fn identity_id(&mut self, idk: &str) -> SqrlResult<Option<i64>> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT id FROM sqrl_identity WHERE idk = ?")
            .bind(idk)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn identity_id_required(&mut self, idk: &str) -> SqrlResult<i64> {
        self.identity_id(idk)
            .await?
            .ok_or_else(|| SqrlError::persistence(format!("Identity not found: {idk}")))
    }
}

fn encode_transient(correlator: &Correlator) -> SqrlResult<String> {
    serde_json::to_string(correlator.transient_auth_data())
        .map_err(|e| SqrlError::persistence(format!("Failed to encode transient data: {e}")))
}

#[async_trait]
impl SqrlTransaction for SqliteTransaction {
    async fn identity_exists_by_idk(&mut self, idk: &str) -> SqrlResult<bool> {
        Ok(self.identity_id(idk).await?.is_some())
    }

    async fn rotate_idk(&mut self, old_idk: &str, new_idk: &str) -> SqrlResult<()> {
        let result = sqlx::query("UPDATE sqrl_identity SET idk = ? WHERE idk = ?")
            .bind(new_idk)
            .bind(old_idk)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() != 1 {
            return Err(SqrlError::persistence(format!(
                "Identity rotation affected {} rows",
                result.rows_affected()
            )));
        }
        Ok(())
    }

    async fn store_identity_data(
        &mut self,
        idk: &str,
        data: &BTreeMap<String, String>,
    ) -> SqrlResult<()> {
        sqlx::query("INSERT OR IGNORE INTO sqrl_identity (idk, created_at) VALUES (?, ?)")
            .bind(idk)
            .bind(unix_timestamp() as i64)
            .execute(&mut *self.tx)
            .await?;
        let identity_id = self.identity_id_required(idk).await?;

        for (name, value) in data {
            sqlx::query(
                "INSERT INTO sqrl_identity_data (identity_id, name, value) VALUES (?, ?, ?)
                 ON CONFLICT(identity_id, name) DO UPDATE SET value = excluded.value",
            )
            .bind(identity_id)
            .bind(name)
            .bind(value)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn fetch_identity_data(&mut self, idk: &str, key: &str) -> SqrlResult<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT d.value FROM sqrl_identity_data d
             JOIN sqrl_identity i ON i.id = d.identity_id
             WHERE i.idk = ? AND d.name = ?",
        )
        .bind(idk)
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_flag(&mut self, idk: &str, flag: IdentityFlag, value: bool) -> SqrlResult<()> {
        let identity_id = self.identity_id_required(idk).await?;
        sqlx::query(
            "INSERT INTO sqrl_identity_flag (identity_id, flag, value) VALUES (?, ?, ?)
             ON CONFLICT(identity_id, flag) DO UPDATE SET value = excluded.value",
        )
        .bind(identity_id)
        .bind(flag.as_ref())
        .bind(value)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_flag(&mut self, idk: &str, flag: IdentityFlag) -> SqrlResult<Option<bool>> {
        let row = sqlx::query_as::<_, (bool,)>(
            "SELECT f.value FROM sqrl_identity_flag f
             JOIN sqrl_identity i ON i.id = f.identity_id
             WHERE i.idk = ? AND f.flag = ?",
        )
        .bind(idk)
        .bind(flag.as_ref())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn delete_identity(&mut self, idk: &str) -> SqrlResult<()> {
        let Some(identity_id) = self.identity_id(idk).await? else {
            return Ok(());
        };

        sqlx::query("DELETE FROM sqrl_identity_data WHERE identity_id = ?")
            .bind(identity_id)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM sqrl_identity_flag WHERE identity_id = ?")
            .bind(identity_id)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM sqrl_identity WHERE id = ?")
            .bind(identity_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn native_user_xref(&mut self, idk: &str) -> SqrlResult<Option<String>> {
        let row = sqlx::query_as::<_, (Option<String>,)>(
            "SELECT native_user_xref FROM sqrl_identity WHERE idk = ?",
        )
        .bind(idk)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.and_then(|(xref,)| xref))
    }

    async fn set_native_user_xref(&mut self, idk: &str, xref: &str) -> SqrlResult<()> {
        let result = sqlx::query("UPDATE sqrl_identity SET native_user_xref = ? WHERE idk = ?")
            .bind(xref)
            .bind(idk)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SqrlError::persistence(format!("Identity not found: {idk}")));
        }
        Ok(())
    }

    async fn mark_authenticated(&mut self, idk: &str, correlator_id: &str) -> SqrlResult<()> {
        let result = sqlx::query("UPDATE sqrl_identity SET last_correlator = ? WHERE idk = ?")
            .bind(correlator_id)
            .bind(idk)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SqrlError::persistence(format!("Identity not found: {idk}")));
        }
        Ok(())
    }

    async fn correlator_fetch_required(&mut self, id: &str) -> SqrlResult<Correlator> {
        let row = sqlx::query_as::<_, (String, String, i64, i64, String, Option<String>)>(
            "SELECT id, status, created_at, expires_at, transient_data, authenticated_idk
             FROM sqrl_correlator WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some((id, status, created_at, expires_at, transient, idk)) = row else {
            return Err(SqrlError::CorrelatorNotFound(id.to_string()));
        };

        let status = CorrelatorStatus::from_str(&status)
            .map_err(|_| SqrlError::persistence(format!("Corrupt correlator status: {status}")))?;
        let transient: BTreeMap<String, String> = serde_json::from_str(&transient)
            .map_err(|e| SqrlError::persistence(format!("Corrupt transient data: {e}")))?;

        Ok(Correlator::restore(
            id,
            status,
            created_at as u64,
            expires_at as u64,
            transient,
            idk,
        ))
    }

    async fn correlator_create(&mut self, id: &str, expires_at: u64) -> SqrlResult<Correlator> {
        let correlator = Correlator::new(id, unix_timestamp(), expires_at);
        sqlx::query(
            "INSERT INTO sqrl_correlator (id, status, created_at, expires_at, transient_data)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(correlator.id())
        .bind(correlator.status().as_ref())
        .bind(correlator.created_at() as i64)
        .bind(correlator.expires_at() as i64)
        .bind(encode_transient(&correlator)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(correlator)
    }

    async fn correlator_update(&mut self, correlator: &Correlator) -> SqrlResult<()> {
        let result = sqlx::query(
            "UPDATE sqrl_correlator
             SET status = ?, expires_at = ?, transient_data = ?, authenticated_idk = ?
             WHERE id = ?",
        )
        .bind(correlator.status().as_ref())
        .bind(correlator.expires_at() as i64)
        .bind(encode_transient(correlator)?)
        .bind(correlator.authenticated_idk_raw())
        .bind(correlator.id())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SqrlError::CorrelatorNotFound(correlator.id().to_string()));
        }
        Ok(())
    }

    async fn transient_data_fetch(
        &mut self,
        correlator_id: &str,
        key: &str,
    ) -> SqrlResult<Option<String>> {
        match self.correlator_fetch_required(correlator_id).await {
            Ok(correlator) => Ok(correlator.transient(key).map(str::to_string)),
            Err(SqrlError::CorrelatorNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn has_token_been_used(&mut self, token: &str) -> SqrlResult<bool> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT 1 FROM sqrl_used_nut WHERE token = ?")
            .bind(token)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.is_some())
    }

    async fn mark_token_used(
        &mut self,
        correlator_id: &str,
        token: &str,
        expires_at: u64,
    ) -> SqrlResult<()> {
        let result = sqlx::query(
            "INSERT INTO sqrl_used_nut (token, correlator_id, expires_at) VALUES (?, ?, ?)",
        )
        .bind(token)
        .bind(correlator_id)
        .bind(expires_at as i64)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.message().contains("UNIQUE") => {
                Err(SqrlError::NutTokenReplayed(token.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup_expired(&mut self, now: u64) -> SqrlResult<CleanupStats> {
        let correlators = sqlx::query("DELETE FROM sqrl_correlator WHERE expires_at < ?")
            .bind(now as i64)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

        let used_nuts = sqlx::query("DELETE FROM sqrl_used_nut WHERE expires_at < ?")
            .bind(now as i64)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

        Ok(CleanupStats {
            correlators,
            used_nuts,
        })
    }

    async fn commit(self: Box<Self>) -> SqrlResult<()> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> SqrlResult<()> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}
