use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use conveyor_core::errors::Result;
use conveyor_core::models::RecurringTask;
use conveyor_core::traits::RecurringRepository;

pub struct PostgresRecurringRepository {
    pool: PgPool,
}

impl PostgresRecurringRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<RecurringTask> {
        Ok(RecurringTask {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            schedule: row.try_get("schedule")?,
            class_name: row.try_get("class_name")?,
            arguments: row.try_get("arguments")?,
            queue_name: row.try_get("queue_name")?,
            priority: row.try_get("priority")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl RecurringRepository for PostgresRecurringRepository {
    #[instrument(skip(self, task), fields(key = %task.key))]
    async fn upsert_task(&self, task: &RecurringTask) -> Result<RecurringTask> {
        let row = sqlx::query(
            r#"
            INSERT INTO recurring_tasks (key, schedule, class_name, arguments, queue_name, priority)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (key) DO UPDATE SET
                schedule = EXCLUDED.schedule,
                class_name = EXCLUDED.class_name,
                arguments = EXCLUDED.arguments,
                queue_name = EXCLUDED.queue_name,
                priority = EXCLUDED.priority,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(&task.key)
        .bind(&task.schedule)
        .bind(&task.class_name)
        .bind(&task.arguments)
        .bind(&task.queue_name)
        .bind(task.priority)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_task(&row)
    }

    async fn list_tasks(&self) -> Result<Vec<RecurringTask>> {
        let rows = sqlx::query("SELECT * FROM recurring_tasks ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn delete_tasks_except(&self, keys: &[String]) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM recurring_tasks WHERE key <> ALL($1)")
            .bind(keys)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }

    /// 认领触发刻度：唯一索引冲突意味着其他 scheduler 已触发，
    /// 返回 false 而不是错误。
    #[instrument(skip(self))]
    async fn record_fire(&self, task_key: &str, run_at: DateTime<Utc>) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO recurring_executions (task_key, run_at)
            VALUES ($1, $2)
            ON CONFLICT (task_key, run_at) DO NOTHING
            "#,
        )
        .bind(task_key)
        .bind(run_at)
        .execute(&self.pool)
        .await?;

        let owned = inserted.rows_affected() == 1;
        if !owned {
            debug!("刻度 ({task_key}, {run_at}) 已被其他 scheduler 触发，跳过");
        }
        Ok(owned)
    }

    async fn attach_job(&self, task_key: &str, run_at: DateTime<Utc>, job_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE recurring_executions SET job_id = $3 WHERE task_key = $1 AND run_at = $2",
        )
        .bind(task_key)
        .bind(run_at)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
