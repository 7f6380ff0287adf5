//! 过期数据清理任务
//!
//! 定期删除过期关联器和已使用 Nut 记录

use crate::metrics::CLEANUP_REMOVED;
use sqrl_protocol::{CleanupStats, SqrlEngine, SqrlResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info};

/// 执行一次清理并记录指标
pub async fn run_cleanup_once(engine: &SqrlEngine) -> SqrlResult<CleanupStats> {
    let stats = engine.cleanup_expired().await?;
    CLEANUP_REMOVED
        .with_label_values(&["correlator"])
        .inc_by(stats.correlators);
    CLEANUP_REMOVED
        .with_label_values(&["used_nut"])
        .inc_by(stats.used_nuts);

    if stats.total() > 0 {
        info!(
            "Cleanup removed {} correlators and {} used nuts",
            stats.correlators, stats.used_nuts
        );
    } else {
        debug!("Cleanup found nothing to remove");
    }
    Ok(stats)
}

/// 启动后台清理循环，第一次清理在一个周期之后
pub fn spawn_cleanup_task(
    engine: Arc<SqrlEngine>,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
) -> JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Cleanup task started (interval: {:?})", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = run_cleanup_once(&engine).await {
                        error!("Cleanup failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Cleanup task received shutdown signal");
                    break;
                }
            }
        }
    })
}
