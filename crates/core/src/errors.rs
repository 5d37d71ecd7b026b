use std::sync::Arc;

use thiserror::Error;

/// 作业队列错误类型定义
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("作业未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("进程未找到: {id}")]
    ProcessNotFound { id: i64 },

    #[error("未注册的作业处理器: {class_name}")]
    HandlerNotFound { class_name: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("作业执行失败: {0}")]
    ExecutionFailed(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, QueueError>;

/// 基础设施错误上报回调
///
/// 服务主循环因存储层故障退出前调用一次，之后错误继续上抛，
/// 是否重启由监管方决定。未设置时只走结构化日志。
pub type ErrorCallback = Arc<dyn Fn(&QueueError) + Send + Sync>;
