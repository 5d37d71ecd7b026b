use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 计数信号量行：value 为剩余槽位，始终落在 [0, limit] 内，
/// 只通过条件更新修改，从不做应用侧读-改-写
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Semaphore {
    pub id: i64,
    pub key: String,
    pub value: i32,
    /// 看门狗：崩溃进程未归还的槽位到期后由维护任务整行回收
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Semaphore {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn has_available_slot(&self) -> bool {
        self.value > 0
    }
}
