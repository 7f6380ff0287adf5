//! 日志初始化
//!
//! 控制台或文件输出，文件模式可按天轮转

use crate::error::Result;
use sqrl_common::{LogConfig, SqrlServerConfig};
use std::fs;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

const LOG_FILE_NAME: &str = "sqrl-server.log";

/// 持有日志写入线程，drop 时刷新缓冲
#[derive(Default)]
pub struct ObservabilityGuard {
    _log_guard: Option<WorkerGuard>,
}

/// Initialize logging based on configuration
pub fn init_observability(config: &SqrlServerConfig) -> Result<ObservabilityGuard> {
    let mut guard = ObservabilityGuard::default();
    let log_config = config.log_config();

    if config.is_console_logging() {
        init_subscriber_with_writer(std::io::stdout, true, config);
    } else {
        fs::create_dir_all(&log_config.path)?;
        let (non_blocking, worker_guard) =
            build_file_writer(log_config, config.should_rotate_logs())?;
        guard._log_guard = Some(worker_guard);
        init_subscriber_with_writer(non_blocking, false, config);
    }

    Ok(guard)
}

/// Create an EnvFilter from config, with RUST_LOG taking precedence
fn create_env_filter(config: &SqrlServerConfig) -> EnvFilter {
    let directive = config.get_filter_level();

    EnvFilter::try_new(&directive).unwrap_or_else(|_| {
        println!("Failed to parse filter directive: {directive}. Falling back to default: info");
        EnvFilter::new("info")
    })
}

fn init_subscriber_with_writer<W>(writer: W, use_ansi: bool, config: &SqrlServerConfig)
where
    W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(use_ansi)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(create_env_filter(config))
        .with(fmt_layer)
        .try_init()
        .ok();
}

fn build_file_writer(log_config: &LogConfig, rotate: bool) -> Result<(NonBlocking, WorkerGuard)> {
    println!("日志写入模式: 文件");
    println!("  - 路径: {}", log_config.path);
    println!("  - 轮转: {}", if rotate { "开启（按天）" } else { "关闭" });

    if rotate {
        let file_appender = tracing_appender::rolling::daily(&log_config.path, LOG_FILE_NAME);
        Ok(tracing_appender::non_blocking(file_appender))
    } else {
        let log_file_path = std::path::Path::new(&log_config.path).join(LOG_FILE_NAME);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file_path)?;
        Ok(tracing_appender::non_blocking(file))
    }
}
