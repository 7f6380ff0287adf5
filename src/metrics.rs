//! Prometheus 监控指标
//!
//! 提供全局指标收集和导出功能

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

static METRICS_INIT: Once = Once::new();

lazy_static! {
    /// 全局 Prometheus Registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ========== 协议指标 ==========

    /// SQRL 客户端回调次数（按命令结果分组）
    pub static ref SQRL_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("requests_total", "Total number of SQRL client requests")
            .namespace("sqrl"),
        &["outcome"]
    ).unwrap();

    /// 签发的登录页面（关联器）数
    pub static ref PAGES_ISSUED: IntCounter = IntCounter::new(
        "sqrl_pages_issued_total",
        "Total number of login pages issued"
    ).unwrap();

    /// CPS 令牌兑换次数
    pub static ref CPS_REDEMPTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("cps_redemptions_total", "Total number of CPS token redemptions")
            .namespace("sqrl"),
        &["status"]
    ).unwrap();

    /// 清理任务删除的记录数
    pub static ref CLEANUP_REMOVED: IntCounterVec = IntCounterVec::new(
        Opts::new("cleanup_removed_total", "Total number of expired records removed")
            .namespace("sqrl"),
        &["kind"]
    ).unwrap();

    // ========== HTTP 指标 ==========

    /// HTTP 请求延迟（秒）
    pub static ref REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("request_duration_seconds", "HTTP request duration in seconds")
            .namespace("sqrl")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["method", "path", "status"]
    ).unwrap();

    /// 状态轮询缓存命中
    pub static ref STATUS_CACHE: IntCounterVec = IntCounterVec::new(
        Opts::new("status_cache_total", "Status poll cache lookups")
            .namespace("sqrl"),
        &["result"]
    ).unwrap();
}

/// 注册所有指标到全局 Registry
///
/// 可重复调用，只有第一次真正注册
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let mut result = Ok(());

    METRICS_INIT.call_once(|| {
        let register_result = (|| {
            REGISTRY.register(Box::new(SQRL_REQUESTS.clone()))?;
            REGISTRY.register(Box::new(PAGES_ISSUED.clone()))?;
            REGISTRY.register(Box::new(CPS_REDEMPTIONS.clone()))?;
            REGISTRY.register(Box::new(CLEANUP_REMOVED.clone()))?;
            REGISTRY.register(Box::new(REQUEST_DURATION.clone()))?;
            REGISTRY.register(Box::new(STATUS_CACHE.clone()))?;
            Ok::<(), prometheus::Error>(())
        })();

        if let Err(e) = register_result {
            result = Err(e);
        }
    });

    result
}

/// HTTP 请求计时器
pub struct RequestTimer {
    start: Instant,
    method: &'static str,
    path: &'static str,
}

impl RequestTimer {
    pub fn new(method: &'static str, path: &'static str) -> Self {
        Self {
            start: Instant::now(),
            method,
            path,
        }
    }

    /// 完成计时并记录指标
    pub fn observe(self, status: u16) {
        REQUEST_DURATION
            .with_label_values(&[self.method, self.path, &status.to_string()])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

/// 导出 Prometheus 文本格式的指标
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}
