use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use conveyor_core::errors::{QueueError, Result};
use conveyor_core::models::{ClaimedExecution, ClaimedJob, Disposition, ExecutionError};
use conveyor_core::traits::{DueExecution, ExecutionRepository};

use super::row_to_job;
use super::semaphore_repository::acquire_slot;

pub struct PostgresExecutionRepository {
    pool: PgPool,
}

impl PostgresExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionRepository for PostgresExecutionRepository {
    /// 认领协议
    ///
    /// 每个队列一个事务：SKIP LOCKED 选取就绪行，并发事务跳过
    /// 已被他人锁定的行而不是等待，因此 N 个并发调用者的认领
    /// 集合两两不相交。插入认领行、删除就绪行与选取在同一事务内。
    #[instrument(skip(self, queue_names), fields(queues = queue_names.len(), max_count))]
    async fn claim(
        &self,
        queue_names: &[String],
        max_count: i64,
        process_id: i64,
    ) -> Result<Vec<ClaimedJob>> {
        let mut claimed = Vec::new();
        let mut remaining = max_count;

        for queue in queue_names {
            if remaining <= 0 {
                break;
            }

            let mut tx = self.pool.begin().await?;
            let candidates = sqlx::query(
                r#"
                SELECT id, job_id FROM ready_executions
                WHERE queue_name = $1
                ORDER BY priority ASC, job_id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(queue)
            .bind(remaining)
            .fetch_all(&mut *tx)
            .await?;

            if candidates.is_empty() {
                tx.commit().await?;
                continue;
            }

            let mut ready_ids = Vec::with_capacity(candidates.len());
            let mut job_ids = Vec::with_capacity(candidates.len());
            for row in &candidates {
                ready_ids.push(row.try_get::<i64, _>("id")?);
                job_ids.push(row.try_get::<i64, _>("job_id")?);
            }

            let claim_rows = sqlx::query(
                r#"
                INSERT INTO claimed_executions (job_id, process_id)
                SELECT t.job_id, $1 FROM UNNEST($2::BIGINT[]) AS t(job_id)
                RETURNING id, job_id
                "#,
            )
            .bind(process_id)
            .bind(&job_ids)
            .fetch_all(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM ready_executions WHERE id = ANY($1)")
                .bind(&ready_ids)
                .execute(&mut *tx)
                .await?;

            let job_rows = sqlx::query(
                "SELECT * FROM jobs WHERE id = ANY($1) ORDER BY priority ASC, id ASC",
            )
            .bind(&job_ids)
            .fetch_all(&mut *tx)
            .await?;
            tx.commit().await?;

            let mut claim_ids: HashMap<i64, i64> = HashMap::with_capacity(claim_rows.len());
            for row in &claim_rows {
                claim_ids.insert(row.try_get("job_id")?, row.try_get("id")?);
            }

            for row in &job_rows {
                let job = row_to_job(row)?;
                let claim_id = *claim_ids.get(&job.id).ok_or_else(|| {
                    QueueError::DatabaseOperation(format!("作业 {} 缺少认领行", job.id))
                })?;
                claimed.push(ClaimedJob { claim_id, job });
            }
            remaining = max_count - claimed.len() as i64;

            debug!("队列 {} 认领了 {} 个作业", queue, job_rows.len());
        }

        Ok(claimed)
    }

    async fn claimed_by_process(&self, process_id: i64) -> Result<Vec<ClaimedExecution>> {
        let rows = sqlx::query(
            "SELECT id, job_id, process_id, created_at FROM claimed_executions WHERE process_id = $1 ORDER BY id",
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ClaimedExecution {
                    id: row.try_get("id")?,
                    job_id: row.try_get("job_id")?,
                    process_id: row.try_get("process_id")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// 孤儿回收：死进程认领中的执行统一转为失败记录（可重试）
    #[instrument(skip(self, error), fields(error_class = %error.class))]
    async fn fail_claimed_by_process(
        &self,
        process_id: i64,
        error: &ExecutionError,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let orphaned = sqlx::query(
            "DELETE FROM claimed_executions WHERE process_id = $1 RETURNING job_id",
        )
        .bind(process_id)
        .fetch_all(&mut *tx)
        .await?;

        if orphaned.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let job_ids: Vec<i64> = orphaned
            .iter()
            .map(|row| row.try_get::<i64, _>("job_id"))
            .collect::<std::result::Result<_, _>>()?;

        sqlx::query(
            r#"
            INSERT INTO failed_executions (job_id, error_class, error_message, backtrace)
            SELECT t.job_id, $2, $3, $4 FROM UNNEST($1::BIGINT[]) AS t(job_id)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(&job_ids)
        .bind(&error.class)
        .bind(&error.message)
        .bind(&error.backtrace)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(job_ids.len() as u64)
    }

    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        excluded_queues: &[String],
        limit: i64,
    ) -> Result<Vec<DueExecution>> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, queue_name, priority, scheduled_at
            FROM scheduled_executions
            WHERE scheduled_at <= $1 AND queue_name <> ALL($2)
            ORDER BY scheduled_at ASC, priority ASC, job_id ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(excluded_queues)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DueExecution {
                    job_id: row.try_get("job_id")?,
                    queue_name: row.try_get("queue_name")?,
                    priority: row.try_get("priority")?,
                    scheduled_at: row.try_get("scheduled_at")?,
                })
            })
            .collect()
    }

    /// 晋升是幂等的：scheduled 行已被其他 dispatcher 消费时直接返回 false，
    /// 执行表的 job_id 唯一索引兜底防止双重晋升。
    #[instrument(skip(self, disposition))]
    async fn promote_scheduled(&self, job_id: i64, disposition: Disposition) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(
            "DELETE FROM scheduled_executions WHERE job_id = $1 RETURNING queue_name, priority",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match removed {
            Some(row) => row,
            None => {
                tx.commit().await?;
                return Ok(false);
            }
        };
        let queue_name: String = row.try_get("queue_name")?;
        let priority: i32 = row.try_get("priority")?;

        match &disposition {
            Disposition::Ready => {
                sqlx::query(
                    "INSERT INTO ready_executions (job_id, queue_name, priority) VALUES ($1, $2, $3)",
                )
                .bind(job_id)
                .bind(&queue_name)
                .bind(priority)
                .execute(&mut *tx)
                .await?;
            }
            Disposition::Blocked { key, expires_at } => {
                sqlx::query(
                    "INSERT INTO blocked_executions (job_id, queue_name, priority, concurrency_key, expires_at) VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(job_id)
                .bind(&queue_name)
                .bind(priority)
                .bind(key)
                .bind(expires_at)
                .execute(&mut *tx)
                .await?;
            }
            Disposition::Finished => {
                sqlx::query("UPDATE jobs SET finished_at = now(), updated_at = now() WHERE id = $1")
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await?;
            }
            Disposition::Scheduled(_) => {
                return Err(QueueError::Internal(
                    "晋升目标不能仍是 Scheduled".to_string(),
                ));
            }
        }
        tx.commit().await?;
        Ok(true)
    }

    /// 释放一个等待者
    ///
    /// SKIP LOCKED 锁定该键优先级最高的阻塞行，并发信号方不会
    /// 争抢同一等待者；拿到行后在同一事务内条件扣减槽位，
    /// 确认确实有空位才迁移为 Ready。
    #[instrument(skip(self))]
    async fn release_one_blocked(&self, concurrency_key: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let candidate = sqlx::query(
            r#"
            SELECT b.id, b.job_id, b.queue_name, b.priority,
                   j.concurrency_limit, j.concurrency_duration_seconds
            FROM blocked_executions b
            JOIN jobs j ON j.id = b.job_id
            WHERE b.concurrency_key = $1
            ORDER BY b.priority ASC, b.job_id ASC
            LIMIT 1
            FOR UPDATE OF b SKIP LOCKED
            "#,
        )
        .bind(concurrency_key)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match candidate {
            Some(row) => row,
            None => {
                tx.commit().await?;
                return Ok(false);
            }
        };
        let blocked_id: i64 = row.try_get("id")?;
        let job_id: i64 = row.try_get("job_id")?;
        let queue_name: String = row.try_get("queue_name")?;
        let priority: i32 = row.try_get("priority")?;
        let limit: i32 = row.try_get("concurrency_limit")?;
        let duration_seconds: i64 = row.try_get("concurrency_duration_seconds")?;

        if !acquire_slot(&mut *tx, concurrency_key, limit, duration_seconds).await? {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM blocked_executions WHERE id = $1")
            .bind(blocked_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO ready_executions (job_id, queue_name, priority) VALUES ($1, $2, $3)",
        )
        .bind(job_id)
        .bind(&queue_name)
        .bind(priority)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("并发键 {} 的作业 {} 已解除阻塞", concurrency_key, job_id);
        Ok(true)
    }

    async fn releasable_keys(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT b.concurrency_key
            FROM blocked_executions b
            LEFT JOIN semaphores s ON s.key = b.concurrency_key
            WHERE s.key IS NULL OR s.value > 0 OR b.expires_at <= $1
            ORDER BY b.concurrency_key
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("concurrency_key")?))
            .collect()
    }
}
