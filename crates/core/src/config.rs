//! 应用配置
//!
//! TOML 文件加载 + 少量环境变量覆盖，启动时统一校验；
//! 校验失败的进程不会进入任何轮询循环。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{QueueError, Result};
use crate::polling::PollerConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub supervisor: SupervisorConfig,
    pub worker: WorkerConfig,
    pub dispatcher: DispatcherConfig,
    pub polling: PollerConfig,
    /// 静态周期任务定义，scheduler 启动时对账进数据库
    pub recurring: Vec<RecurringTaskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/conveyor".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_seconds: 30,
        }
    }
}

/// 监管模式：fork 为独立 OS 进程（崩溃隔离），async 为进程内线程
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SupervisionMode {
    #[serde(rename = "fork")]
    Fork,
    #[serde(rename = "async")]
    Async,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub mode: SupervisionMode,
    pub worker_count: usize,
    pub dispatcher_count: usize,
    pub scheduler_count: usize,
    pub heartbeat_interval_seconds: u64,
    /// 心跳超过该时长未更新的进程行会被清理
    pub prune_after_seconds: i64,
    /// 优雅关闭时等待子进程退出的上限
    pub shutdown_timeout_seconds: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            mode: SupervisionMode::Async,
            worker_count: 1,
            dispatcher_count: 1,
            scheduler_count: 1,
            heartbeat_interval_seconds: 60,
            prune_after_seconds: 300,
            shutdown_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 轮询的队列模式：精确名、`foo*` 前缀或 `*`
    pub queues: Vec<String>,
    /// 本地执行池大小，也是单次认领数的上限
    pub pool_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec!["*".to_string()],
            pool_size: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 单次晋升的定时作业批大小
    pub batch_size: i64,
    pub poll_interval_ms: u64,
    /// 并发维护（批量解阻塞、信号量过期）的执行周期
    pub maintenance_interval_seconds: u64,
    pub maintenance_batch_size: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            poll_interval_ms: 1_000,
            maintenance_interval_seconds: 600,
            maintenance_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringTaskConfig {
    pub key: String,
    pub schedule: String,
    pub class: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub priority: i32,
}

fn default_queue() -> String {
    "default".to_string()
}

impl AppConfig {
    /// 加载配置：文件（存在时）叠加环境变量覆盖，随后整体校验
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) if Path::new(p).exists() => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    QueueError::Configuration(format!("读取配置文件 {p} 失败: {e}"))
                })?;
                toml::from_str(&content).map_err(|e| {
                    QueueError::Configuration(format!("解析配置文件 {p} 失败: {e}"))
                })?
            }
            _ => AppConfig::default(),
        };

        if let Ok(url) = std::env::var("CONVEYOR_DATABASE_URL") {
            config.database.url = url;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(QueueError::Configuration(
                "database.url 不能为空".to_string(),
            ));
        }
        if self.database.max_connections == 0
            || self.database.min_connections > self.database.max_connections
        {
            return Err(QueueError::Configuration(format!(
                "数据库连接池配置无效: min={}, max={}",
                self.database.min_connections, self.database.max_connections
            )));
        }
        if self.worker.pool_size == 0 {
            return Err(QueueError::Configuration(
                "worker.pool_size 必须大于 0".to_string(),
            ));
        }
        if self.dispatcher.batch_size <= 0 || self.dispatcher.maintenance_batch_size <= 0 {
            return Err(QueueError::Configuration(
                "dispatcher 批大小必须大于 0".to_string(),
            ));
        }
        if self.supervisor.prune_after_seconds
            <= self.supervisor.heartbeat_interval_seconds as i64
        {
            return Err(QueueError::Configuration(format!(
                "supervisor.prune_after_seconds ({}) 必须大于心跳间隔 ({})",
                self.supervisor.prune_after_seconds, self.supervisor.heartbeat_interval_seconds
            )));
        }
        for task in &self.recurring {
            if task.key.is_empty() || task.schedule.is_empty() || task.class.is_empty() {
                return Err(QueueError::Configuration(format!(
                    "周期任务配置不完整: {task:?}"
                )));
            }
        }
        self.polling.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load(Some("/nonexistent/conveyor.toml")).unwrap();
        assert_eq!(config.worker.pool_size, 5);
        assert_eq!(config.supervisor.mode, SupervisionMode::Async);
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[database]
url = "postgres://db.internal/queue"

[supervisor]
mode = "fork"
worker_count = 3

[worker]
queues = ["mailers", "background*"]
pool_size = 8

[[recurring]]
key = "cleanup"
schedule = "@hourly"
class = "Cleanup"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.database.url, "postgres://db.internal/queue");
        assert_eq!(config.supervisor.mode, SupervisionMode::Fork);
        assert_eq!(config.supervisor.worker_count, 3);
        assert_eq!(config.worker.queues, vec!["mailers", "background*"]);
        assert_eq!(config.worker.pool_size, 8);
        assert_eq!(config.recurring.len(), 1);
        assert_eq!(config.recurring[0].queue, "default");
    }

    #[test]
    fn test_invalid_config_rejected_at_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[worker]
pool_size = 0
"#
        )
        .unwrap();

        let result = AppConfig::load(Some(file.path().to_str().unwrap()));
        assert!(matches!(result, Err(QueueError::Configuration(_))));
    }

    #[test]
    fn test_prune_threshold_must_exceed_heartbeat() {
        let mut config = AppConfig::default();
        config.supervisor.heartbeat_interval_seconds = 300;
        config.supervisor.prune_after_seconds = 300;
        assert!(config.validate().is_err());
    }
}
