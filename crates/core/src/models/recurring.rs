use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 周期任务定义：按 CRON 表达式反复入队某个作业
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringTask {
    pub id: i64,
    /// 任务键，全局唯一，幂等触发的账本以其为前半键
    pub key: String,
    /// 归一化前的调度表达式（5/6 字段 CRON 或速记短语）
    pub schedule: String,
    pub class_name: String,
    pub arguments: serde_json::Value,
    pub queue_name: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringTask {
    pub fn new(key: impl Into<String>, schedule: impl Into<String>, class_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 由数据库生成
            key: key.into(),
            schedule: schedule.into(),
            class_name: class_name.into(),
            arguments: serde_json::json!({}),
            queue_name: "default".to_string(),
            priority: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn entity_description(&self) -> String {
        format!("周期任务 '{}' ({})", self.key, self.schedule)
    }
}

/// 幂等触发账本：(task_key, run_at) 唯一，
/// 多个 scheduler 同时触发同一刻度时只有一条插入成功
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringExecution {
    pub id: i64,
    pub job_id: Option<i64>,
    pub task_key: String,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
