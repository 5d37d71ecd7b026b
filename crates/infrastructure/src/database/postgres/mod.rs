//! PostgreSQL 仓储实现
//!
//! 跨进程正确性完全由这里的 SQL 承担：行锁（FOR UPDATE SKIP LOCKED）、
//! 唯一约束与条件更新，不存在任何进程内协调。

mod execution_repository;
mod job_repository;
mod process_repository;
mod queue_repository;
mod recurring_repository;
mod semaphore_repository;

pub use execution_repository::PostgresExecutionRepository;
pub use job_repository::PostgresJobRepository;
pub use process_repository::PostgresProcessRepository;
pub use queue_repository::PostgresQueueRepository;
pub use recurring_repository::PostgresRecurringRepository;
pub use semaphore_repository::PostgresSemaphoreRepository;

use sqlx::postgres::PgRow;
use sqlx::Row;

use conveyor_core::errors::Result;
use conveyor_core::models::{ConcurrencyPolicy, Job, Process};

pub(crate) fn row_to_job(row: &PgRow) -> Result<Job> {
    let concurrency_key: Option<String> = row.try_get("concurrency_key")?;
    let concurrency = match concurrency_key {
        Some(key) => Some(ConcurrencyPolicy {
            key,
            limit: row.try_get("concurrency_limit")?,
            duration_seconds: row.try_get("concurrency_duration_seconds")?,
            on_conflict: row.try_get("on_conflict")?,
        }),
        None => None,
    };

    Ok(Job {
        id: row.try_get("id")?,
        queue_name: row.try_get("queue_name")?,
        class_name: row.try_get("class_name")?,
        arguments: row.try_get("arguments")?,
        priority: row.try_get("priority")?,
        scheduled_at: row.try_get("scheduled_at")?,
        finished_at: row.try_get("finished_at")?,
        concurrency,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn row_to_process(row: &PgRow) -> Result<Process> {
    Ok(Process {
        id: row.try_get("id")?,
        kind: row.try_get("kind")?,
        name: row.try_get("name")?,
        pid: row.try_get("pid")?,
        hostname: row.try_get("hostname")?,
        supervisor_id: row.try_get("supervisor_id")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}
