use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 并发冲突处理策略：无可用槽位时阻塞等待还是直接丢弃
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OnConflict {
    #[serde(rename = "block")]
    Block,
    #[serde(rename = "discard")]
    Discard,
}

impl Default for OnConflict {
    fn default() -> Self {
        OnConflict::Block
    }
}

impl sqlx::Type<sqlx::Postgres> for OnConflict {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for OnConflict {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        match s {
            "block" => Ok(OnConflict::Block),
            "discard" => Ok(OnConflict::Discard),
            _ => Err(format!("Invalid on_conflict value: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for OnConflict {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        let s = match self {
            OnConflict::Block => "block",
            OnConflict::Discard => "discard",
        };
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(s, buf)
    }
}

/// 按键限流策略：同一 key 下最多 limit 个作业并发执行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyPolicy {
    pub key: String,
    pub limit: i32,
    /// 信号量槽位的保活时长，崩溃进程占用的槽位到期后被回收
    pub duration_seconds: i64,
    pub on_conflict: OnConflict,
}

impl ConcurrencyPolicy {
    pub fn new(key: impl Into<String>, limit: i32) -> Self {
        Self {
            key: key.into(),
            limit,
            duration_seconds: 180,
            on_conflict: OnConflict::Block,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_seconds)
    }

    pub fn is_limited(&self) -> bool {
        self.limit > 0
    }
}

/// 作业实体：队列中一个待执行的工作单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub queue_name: String,
    /// 处理器标识，启动时在 HandlerRegistry 中静态注册
    pub class_name: String,
    /// 序列化后的作业参数，引擎视为不透明负载
    pub arguments: serde_json::Value,
    /// 数值越小优先级越高
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub concurrency: Option<ConcurrencyPolicy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn entity_description(&self) -> String {
        format!(
            "作业 '{}' (ID: {}, 队列: {})",
            self.class_name, self.id, self.queue_name
        )
    }
}

/// 待入队的作业定义
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue_name: String,
    pub class_name: String,
    pub arguments: serde_json::Value,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub concurrency: Option<ConcurrencyPolicy>,
}

impl NewJob {
    pub fn new(class_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            queue_name: "default".to_string(),
            class_name: class_name.into(),
            arguments,
            priority: 0,
            scheduled_at: None,
            concurrency: None,
        }
    }

    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = Some(policy);
        self
    }
}

/// 作业创建时的落位方式，决定初始执行行
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ready,
    Scheduled(DateTime<Utc>),
    Blocked {
        key: String,
        expires_at: DateTime<Utc>,
    },
    /// 冲突丢弃：直接标记完成，不产生任何执行行
    Finished,
}

/// 并发准入结果
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Ready,
    Blocked {
        key: String,
        expires_at: DateTime<Utc>,
    },
    Discarded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_job_builder_defaults() {
        let job = NewJob::new("SendEmail", json!({"to": "a@b.c"}));
        assert_eq!(job.queue_name, "default");
        assert_eq!(job.priority, 0);
        assert!(job.scheduled_at.is_none());
        assert!(job.concurrency.is_none());
    }

    #[test]
    fn test_new_job_builder_chaining() {
        let at = Utc::now();
        let job = NewJob::new("Resize", json!({}))
            .queue("images")
            .priority(5)
            .scheduled_at(at)
            .concurrency(ConcurrencyPolicy::new("tenant-1", 2));

        assert_eq!(job.queue_name, "images");
        assert_eq!(job.priority, 5);
        assert_eq!(job.scheduled_at, Some(at));
        let policy = job.concurrency.unwrap();
        assert_eq!(policy.key, "tenant-1");
        assert_eq!(policy.limit, 2);
        assert_eq!(policy.on_conflict, OnConflict::Block);
    }

    #[test]
    fn test_concurrency_policy_limited() {
        assert!(ConcurrencyPolicy::new("k", 1).is_limited());
        assert!(!ConcurrencyPolicy::new("k", 0).is_limited());
    }
}
