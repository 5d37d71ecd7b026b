use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 进程角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    #[serde(rename = "supervisor")]
    Supervisor,
    #[serde(rename = "worker")]
    Worker,
    #[serde(rename = "dispatcher")]
    Dispatcher,
    #[serde(rename = "scheduler")]
    Scheduler,
}

impl ProcessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessKind::Supervisor => "supervisor",
            ProcessKind::Worker => "worker",
            ProcessKind::Dispatcher => "dispatcher",
            ProcessKind::Scheduler => "scheduler",
        }
    }
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supervisor" => Ok(ProcessKind::Supervisor),
            "worker" => Ok(ProcessKind::Worker),
            "dispatcher" => Ok(ProcessKind::Dispatcher),
            "scheduler" => Ok(ProcessKind::Scheduler),
            _ => Err(format!("Invalid process kind: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for ProcessKind {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for ProcessKind {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for ProcessKind {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 已注册的进程实例（worker/dispatcher/scheduler/supervisor）
///
/// supervisor_id 自引用同一张表，在内存中仅以 ID 形式持有，
/// 不构造指针环。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: i64,
    pub kind: ProcessKind,
    /// 全局唯一进程名：{kind}-{hostname}-{pid}-{nonce}
    pub name: String,
    pub pid: i32,
    pub hostname: String,
    pub supervisor_id: Option<i64>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Process {
    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, threshold_seconds: i64) -> bool {
        (now - self.last_heartbeat_at).num_seconds() > threshold_seconds
    }
}

/// 进程注册信息
#[derive(Debug, Clone)]
pub struct ProcessRegistration {
    pub kind: ProcessKind,
    pub name: String,
    pub pid: i32,
    pub hostname: String,
    pub supervisor_id: Option<i64>,
    pub metadata: serde_json::Value,
}

impl ProcessRegistration {
    /// 生成全局唯一进程名并构造注册信息
    pub fn generate(kind: ProcessKind) -> Self {
        let name = format!(
            "{}-{}-{}-{:04x}",
            kind,
            hostname_string(),
            std::process::id(),
            rand::random::<u16>()
        );
        Self::new(kind, name)
    }

    pub fn new(kind: ProcessKind, name: String) -> Self {
        Self {
            kind,
            name,
            pid: std::process::id() as i32,
            hostname: hostname_string(),
            supervisor_id: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn supervised_by(mut self, supervisor_id: i64) -> Self {
        self.supervisor_id = Some(supervisor_id);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

fn hostname_string() -> String {
    hostname::get()
        .unwrap_or_else(|_| "unknown".into())
        .to_string_lossy()
        .to_string()
}
