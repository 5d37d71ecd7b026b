use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::info;

use conveyor_core::errors::Result;
use conveyor_core::traits::QueueRepository;

pub struct PostgresQueueRepository {
    pool: PgPool,
}

impl PostgresQueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueRepository for PostgresQueueRepository {
    /// 当前存在就绪作业的队列名；覆盖 (queue_name, ...) 的轮询索引
    /// 使其成为 index-only 扫描
    async fn queue_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT queue_name FROM ready_executions ORDER BY queue_name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("queue_name")?))
            .collect()
    }

    async fn paused_queues(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT queue_name FROM pauses ORDER BY queue_name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("queue_name")?))
            .collect()
    }

    async fn pause(&self, queue_name: &str) -> Result<()> {
        sqlx::query("INSERT INTO pauses (queue_name) VALUES ($1) ON CONFLICT (queue_name) DO NOTHING")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        info!("队列 {} 已暂停", queue_name);
        Ok(())
    }

    async fn resume(&self, queue_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM pauses WHERE queue_name = $1")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        info!("队列 {} 已恢复", queue_name);
        Ok(())
    }
}
