//! SQRL 认证服务器主程序
//!
//! 加载配置、初始化存储与协议引擎，启动 HTTP 服务和过期数据清理任务

mod cli;
mod error;
mod observability;
mod process;

use anyhow::Context;
use clap::Parser;
use observability::init_observability;
use sqrl_common::error::{BaseError, ConfigError};
use sqrl_common::SqrlServerConfig;
use sqrl_protocol::{SqrlEngine, storage};
use sqrl_server::metrics::register_metrics;
use sqrl_server::service::{SqrlHttpState, create_router, serve, spawn_cleanup_task};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

macro_rules! bootstrap_info {
    ($($arg:tt)*) => {
        println!($($arg)*);
    };
}

macro_rules! bootstrap_error {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

use cli::{Cli, Commands};
use error::{Error, Result};

/// Application launcher utilities
struct ApplicationLauncher;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Test { config_file }) => {
            let config_path =
                ApplicationLauncher::find_config_file(config_file.as_ref().unwrap_or(&cli.config))?;
            ApplicationLauncher::test_config_file(&config_path)
        }
        None => {
            let config_path = ApplicationLauncher::find_config_file(&cli.config)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;

            runtime.block_on(ApplicationLauncher::run_application(&config_path))
        }
    }
}

impl ApplicationLauncher {
    /// Find config file with fallback locations
    fn find_config_file(provided_path: &PathBuf) -> Result<PathBuf> {
        // An explicit path must exist, no fallback
        if provided_path != Path::new("config.toml") {
            if provided_path.exists() {
                bootstrap_info!("Using provided config file: {:?}", provided_path);
                return Ok(provided_path.clone());
            }
            bootstrap_error!("Provided config file not found: {:?}", provided_path);
            return Err(Error::custom(format!(
                "Config file not found: {provided_path:?}"
            )));
        }

        let fallback_paths = [
            PathBuf::from("config.toml"),
            PathBuf::from("/etc/sqrl-server/config.toml"),
        ];

        bootstrap_info!("Searching for config file in default locations...");

        for path in &fallback_paths {
            if path.exists() {
                bootstrap_info!("Found config file: {:?}", path);
                return Ok(path.clone());
            }
            bootstrap_info!("Config not found at: {:?}", path);
        }

        bootstrap_error!("No configuration file found!");
        bootstrap_error!("Please create a config file in one of these locations:");
        for (i, path) in fallback_paths.iter().enumerate() {
            bootstrap_error!("  {}. {:?}", i + 1, path);
        }
        bootstrap_error!("Or specify a custom path with: sqrl-server --config <path>");

        Err(Error::custom(
            "No configuration file found. Please create one or specify path with --config",
        ))
    }

    /// 测试配置文件是否有效
    fn test_config_file(config_path: &Path) -> Result<()> {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();

        let config = match SqrlServerConfig::from_file(config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("❌ 配置文件解析失败: {}", e);
                return Err(Error::service_validation(format!("配置解析失败: {e}")));
            }
        };
        info!("✅ 配置文件解析成功: {:?}", config_path);

        if let Err(errors) = config.validate() {
            error!("❌ 配置验证发现问题:");
            Self::report_problems(&errors, |line| info!("{}", line), |line| error!("{}", line));
            if !sqrl_common::config::fatal_errors(&errors).is_empty() {
                return Err(Error::service_validation("配置验证失败"));
            }
        }

        info!("✅ 完整配置验证通过");
        Ok(())
    }

    /// 逐条输出校验结果，警告与错误分开打印
    fn report_problems(
        errors: &[String],
        warn_sink: impl Fn(String),
        error_sink: impl Fn(String),
    ) {
        for (i, err) in errors.iter().enumerate() {
            if err.starts_with("Warning:") {
                warn_sink(format!("  {}. ⚠️  {}", i + 1, err));
            } else {
                error_sink(format!("  {}. ❌ {}", i + 1, err));
            }
        }
    }

    /// 运行应用程序的主入口
    async fn run_application(config_path: &Path) -> Result<()> {
        bootstrap_info!("📄 加载配置文件: {:?}", config_path);

        let config = match SqrlServerConfig::load(config_path) {
            Ok((config, warnings)) => {
                bootstrap_info!("✅ 配置加载成功");
                Self::report_problems(
                    &warnings,
                    |line| println!("{line}"),
                    |line| eprintln!("{line}"),
                );
                config
            }
            Err(BaseError::Config(ConfigError::Invalid(problems))) => {
                bootstrap_error!("❌ 配置验证发现问题:");
                Self::report_problems(
                    &problems,
                    |line| println!("{line}"),
                    |line| eprintln!("{line}"),
                );
                return Err(Error::custom("配置验证失败，请修复上述错误"));
            }
            Err(e) => {
                bootstrap_error!("❌ 配置加载失败: {}", e);
                return Err(Error::custom(format!("配置加载失败: {e}")));
            }
        };

        if !config.sqlite_path.exists() {
            std::fs::create_dir_all(&config.sqlite_path).with_context(|| {
                format!(
                    "Failed to create SQLite data directory: {}",
                    config.sqlite_path.display()
                )
            })?;
        }

        let _observability_guard = init_observability(&config)?;

        let pid_path = process::ProcessManager::write_pid_file(config.pid.as_deref())?;
        let _pid_guard = process::PidFileGuard::new(pid_path);

        Self::run_services(config).await
    }

    /// 初始化引擎并运行 HTTP 服务与清理任务，直到收到关闭信号
    async fn run_services(config: SqrlServerConfig) -> Result<()> {
        info!("🚀 启动 SQRL 认证服务器 ({})", config.name);

        if let Err(e) = register_metrics() {
            warn!(
                "Prometheus metrics registration warning (may already be registered): {}",
                e
            );
        }

        let persistence = storage::from_config(&config.protocol.storage, &config.sqlite_path)
            .await
            .map_err(|e| Error::service_startup(format!("存储初始化失败: {e}")))?;
        info!("✅ 存储初始化完成 ({})", persistence.backend_name());

        let engine = Arc::new(SqrlEngine::new(config.protocol.clone(), persistence)?);

        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(10);
        setup_ctrl_c_handler(shutdown_tx.clone()).await;

        let addr = config
            .bind
            .http
            .socket_addr()
            .map_err(|e| Error::service_startup(format!("Invalid bind address: {e}")))?;
        let state = SqrlHttpState::new(engine.clone(), &config.bind.http, &config.name);
        let (local_addr, http_handle) = serve(create_router(state), addr, shutdown_tx.clone())
            .await
            .map_err(|e| Error::service_startup(format!("HTTP 服务启动失败: {e}")))?;

        let cleanup_handle = spawn_cleanup_task(
            engine,
            Duration::from_secs(config.cleanup_interval_secs),
            shutdown_tx.clone(),
        );

        Self::display_service_info(&config, &local_addr.to_string());

        for handle in [http_handle, cleanup_handle] {
            if let Err(e) = handle.await {
                error!("Service task terminated unexpectedly: {}", e);
                let _ = shutdown_tx.send(());
            }
        }

        info!("🛑 所有服务已安全关闭");
        Ok(())
    }

    /// 显示服务信息
    fn display_service_info(config: &SqrlServerConfig, local_addr: &str) {
        let base = format!("http://{local_addr}");

        info!("✅ 所有服务已启动");
        info!("📡 HTTP 服务器监听在: {}", base);
        info!("🔧 可用的API端点:");
        info!("  - {}/login", base);
        info!("  - {}/sqrl (POST, SQRL client)", base);
        info!("  - {}/status/{{correlator}}", base);
        info!("  - {}/cps/{{correlator}}?token=", base);
        info!("  - {}/health", base);
        info!("  - {}/metrics", base);
        info!("🔗 SQRL 回调地址: {}", config.protocol.backchannel_url);
        if let Some(cps_url) = &config.protocol.cps_url {
            info!("🔗 CPS 跳转地址: {}", cps_url);
        }
    }
}

/// 设置Ctrl-C信号处理程序
async fn setup_ctrl_c_handler(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("无法监听Ctrl-C信号: {}", e);
            return;
        }
        info!("收到Ctrl-C信号，开始优雅关闭...");
        let _ = shutdown_tx.send(());
    });
}
