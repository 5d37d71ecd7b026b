use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use conveyor::{AppConfig, AppMode, Application, HandlerRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("conveyor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("数据库支撑的作业队列引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .default_value("config/conveyor.toml"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["supervisor", "worker", "dispatcher", "scheduler"])
                .default_value("supervisor"),
        )
        .arg(
            Arg::new("supervisor-id")
                .long("supervisor-id")
                .value_name("ID")
                .help("监管进程的行ID（fork 模式下由 supervisor 传入）"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").cloned();
    let mode_str = matches.get_one::<String>("mode").expect("has default");
    let log_level = matches.get_one::<String>("log-level").expect("has default");
    let log_format = matches.get_one::<String>("log-format").expect("has default");
    let supervisor_id = matches
        .get_one::<String>("supervisor-id")
        .map(|raw| raw.parse::<i64>())
        .transpose()
        .context("supervisor-id 必须是整数")?;

    init_logging(log_level, log_format)?;

    info!("启动作业队列引擎，模式: {mode_str}");

    let config = AppConfig::load(config_path.as_deref())
        .with_context(|| format!("加载配置失败: {config_path:?}"))?;
    let mode = AppMode::parse(mode_str)?;

    // 独立运行的二进制没有注册任何处理器，worker 会把所有作业落为
    // HandlerNotFound 失败；嵌入方应通过库入口注入自己的注册表
    let registry = HandlerRegistry::new();

    let application = Arc::new(
        Application::new(config, config_path, registry, supervisor_id).await?,
    );

    // supervisor 模式自带信号处理；其余模式把 TERM/Ctrl+C 转成关闭广播
    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    if mode != AppMode::Supervisor {
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            let _ = shutdown_tx.send(());
        });
    }

    if let Err(e) = application.run(mode, shutdown_rx).await {
        error!("运行失败: {e}");
        return Err(e.into());
    }

    info!("作业队列引擎已退出");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("安装Ctrl+C信号处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("安装SIGTERM信号处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
