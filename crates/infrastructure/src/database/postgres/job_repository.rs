use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::instrument;

use conveyor_core::errors::{QueueError, Result};
use conveyor_core::models::{
    Disposition, ExecutionError, ExecutionState, FailedExecution, Job, NewJob,
};
use conveyor_core::traits::JobRepository;

use super::row_to_job;

pub struct PostgresJobRepository {
    pool: PgPool,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    #[instrument(skip(self, job), fields(class_name = %job.class_name, queue = %job.queue_name))]
    async fn create(&self, job: &NewJob, disposition: Disposition) -> Result<Job> {
        let mut tx = self.pool.begin().await?;

        let scheduled_at = job.scheduled_at.unwrap_or_else(Utc::now);
        let (key, limit, duration, on_conflict) = match &job.concurrency {
            Some(p) => (
                Some(p.key.as_str()),
                p.limit,
                p.duration_seconds,
                p.on_conflict,
            ),
            None => (None, 0, 180, Default::default()),
        };

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (queue_name, class_name, arguments, priority, scheduled_at,
                              concurrency_key, concurrency_limit, concurrency_duration_seconds, on_conflict)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(&job.queue_name)
        .bind(&job.class_name)
        .bind(&job.arguments)
        .bind(job.priority)
        .bind(scheduled_at)
        .bind(key)
        .bind(limit)
        .bind(duration)
        .bind(on_conflict)
        .fetch_one(&mut *tx)
        .await?;
        let mut created = row_to_job(&row)?;

        match &disposition {
            Disposition::Ready => {
                sqlx::query(
                    "INSERT INTO ready_executions (job_id, queue_name, priority) VALUES ($1, $2, $3)",
                )
                .bind(created.id)
                .bind(&created.queue_name)
                .bind(created.priority)
                .execute(&mut *tx)
                .await?;
            }
            Disposition::Scheduled(at) => {
                sqlx::query(
                    "INSERT INTO scheduled_executions (job_id, queue_name, priority, scheduled_at) VALUES ($1, $2, $3, $4)",
                )
                .bind(created.id)
                .bind(&created.queue_name)
                .bind(created.priority)
                .bind(at)
                .execute(&mut *tx)
                .await?;
            }
            Disposition::Blocked { key, expires_at } => {
                sqlx::query(
                    "INSERT INTO blocked_executions (job_id, queue_name, priority, concurrency_key, expires_at) VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(created.id)
                .bind(&created.queue_name)
                .bind(created.priority)
                .bind(key)
                .bind(expires_at)
                .execute(&mut *tx)
                .await?;
            }
            Disposition::Finished => {
                // 冲突丢弃：直接完成，不产生执行行，不占用槽位
                let row = sqlx::query(
                    "UPDATE jobs SET finished_at = now(), updated_at = now() WHERE id = $1 RETURNING finished_at",
                )
                .bind(created.id)
                .fetch_one(&mut *tx)
                .await?;
                created.finished_at = row.try_get("finished_at")?;
            }
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(skip(self))]
    async fn finish(&self, job_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM claimed_executions WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        let updated = sqlx::query(
            "UPDATE jobs SET finished_at = now(), updated_at = now() WHERE id = $1",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(QueueError::JobNotFound { id: job_id });
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, error), fields(error_class = %error.class))]
    async fn fail(&self, job_id: i64, error: &ExecutionError) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM claimed_executions WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO failed_executions (job_id, error_class, error_message, backtrace)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(&error.class)
        .bind(&error.message)
        .bind(&error.backtrace)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn retry(&self, job_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM failed_executions WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(QueueError::JobNotFound { id: job_id });
        }
        sqlx::query(
            r#"
            INSERT INTO ready_executions (job_id, queue_name, priority)
            SELECT id, queue_name, priority FROM jobs WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn discard_failed(&self, job_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM failed_executions WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(QueueError::JobNotFound { id: job_id });
        }
        sqlx::query("UPDATE jobs SET finished_at = now(), updated_at = now() WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn execution_state(&self, job_id: i64) -> Result<Option<ExecutionState>> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT finished_at IS NOT NULL FROM jobs WHERE id = $1) AS finished,
                EXISTS(SELECT 1 FROM ready_executions WHERE job_id = $1) AS ready,
                EXISTS(SELECT 1 FROM claimed_executions WHERE job_id = $1) AS claimed,
                EXISTS(SELECT 1 FROM scheduled_executions WHERE job_id = $1) AS scheduled,
                EXISTS(SELECT 1 FROM blocked_executions WHERE job_id = $1) AS blocked,
                EXISTS(SELECT 1 FROM failed_executions WHERE job_id = $1) AS failed
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        let finished: Option<bool> = row.try_get("finished")?;
        let finished = match finished {
            None => return Ok(None), // 作业不存在
            Some(f) => f,
        };

        let state = if row.try_get::<bool, _>("failed")? {
            ExecutionState::Finished { failed: true }
        } else if row.try_get::<bool, _>("claimed")? {
            ExecutionState::Claimed
        } else if row.try_get::<bool, _>("ready")? {
            ExecutionState::Ready
        } else if row.try_get::<bool, _>("scheduled")? {
            ExecutionState::Scheduled
        } else if row.try_get::<bool, _>("blocked")? {
            ExecutionState::Blocked
        } else if finished {
            ExecutionState::Finished { failed: false }
        } else {
            // 介于两次原子操作之间的瞬时状态，按已认领前的空窗处理
            return Ok(None);
        };
        Ok(Some(state))
    }

    async fn failed_execution(&self, job_id: i64) -> Result<Option<FailedExecution>> {
        let row = sqlx::query(
            "SELECT id, job_id, error_class, error_message, backtrace, created_at FROM failed_executions WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(FailedExecution {
                id: row.try_get("id")?,
                job_id: row.try_get("job_id")?,
                error_class: row.try_get("error_class")?,
                error_message: row.try_get("error_message")?,
                backtrace: row.try_get("backtrace")?,
                created_at: row.try_get("created_at")?,
            }),
            None => None,
        })
    }
}
