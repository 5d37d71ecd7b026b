use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::Job;

/// 作业的执行状态机
///
/// 任意时刻一个作业至多持有 {Ready, Claimed, Scheduled, Blocked} 中的一个执行行，
/// 该互斥性由各执行表上 job_id 的唯一索引在存储层保证。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionState {
    /// 等待指定时间到达
    Scheduled,
    /// 等待并发槽位
    Blocked,
    /// 可被立即认领
    Ready,
    /// 已被某个进程认领
    Claimed,
    /// 终态；failed 为 true 表示留有失败记录，可重试回 Ready
    Finished { failed: bool },
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Finished { .. })
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self, ExecutionState::Ready | ExecutionState::Claimed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyExecution {
    pub id: i64,
    pub job_id: i64,
    pub queue_name: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedExecution {
    pub id: i64,
    pub job_id: i64,
    pub process_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledExecution {
    pub id: i64,
    pub job_id: i64,
    pub queue_name: String,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedExecution {
    pub id: i64,
    pub job_id: i64,
    pub queue_name: String,
    pub priority: i32,
    pub concurrency_key: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedExecution {
    pub id: i64,
    pub job_id: i64,
    pub error_class: String,
    pub error_message: String,
    pub backtrace: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 执行失败的异常信息，写入 failed_executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub class: String,
    pub message: String,
    pub backtrace: Option<String>,
}

impl ExecutionError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            backtrace: None,
        }
    }

    /// 认领进程已不存在（被清理或崩溃）时的合成错误
    pub fn process_missing(process_name: &str) -> Self {
        Self::new(
            "ProcessMissingError",
            format!("认领进程 {process_name} 已不存在，作业被孤儿回收"),
        )
    }

    /// fork 模式下子进程异常退出时的合成错误
    pub fn process_exited(process_name: &str, status: &str) -> Self {
        Self::new(
            "ProcessExitError",
            format!("子进程 {process_name} 异常退出 ({status})，作业被回收"),
        )
    }
}

/// 认领协议的返回单元：作业本体加上认领行ID
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub claim_id: i64,
    pub job: Job,
}
