use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, instrument};

use conveyor_core::errors::Result;
use conveyor_core::models::{Process, ProcessRegistration};
use conveyor_core::traits::ProcessRepository;

use super::row_to_process;

pub struct PostgresProcessRepository {
    pool: PgPool,
}

impl PostgresProcessRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessRepository for PostgresProcessRepository {
    #[instrument(skip(self, registration), fields(kind = %registration.kind, name = %registration.name))]
    async fn register(&self, registration: &ProcessRegistration) -> Result<Process> {
        let row = sqlx::query(
            r#"
            INSERT INTO processes (kind, name, pid, hostname, supervisor_id, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(registration.kind)
        .bind(&registration.name)
        .bind(registration.pid)
        .bind(&registration.hostname)
        .bind(registration.supervisor_id)
        .bind(&registration.metadata)
        .fetch_one(&self.pool)
        .await?;

        let process = row_to_process(&row)?;
        info!("进程 {} 已注册 (ID: {})", process.name, process.id);
        Ok(process)
    }

    async fn heartbeat(&self, process_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let updated = sqlx::query("UPDATE processes SET last_heartbeat_at = $2 WHERE id = $1")
            .bind(process_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(updated.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn deregister(&self, process_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM processes WHERE id = $1")
            .bind(process_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// 清理心跳过期的进程行，返回被清理的进程供调用方回收其认领
    #[instrument(skip(self))]
    async fn prune_dead(&self, cutoff: DateTime<Utc>) -> Result<Vec<Process>> {
        let rows = sqlx::query("DELETE FROM processes WHERE last_heartbeat_at < $1 RETURNING *")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        let pruned: Vec<Process> = rows.iter().map(row_to_process).collect::<Result<_>>()?;
        if !pruned.is_empty() {
            info!("清理了 {} 个心跳过期的进程", pruned.len());
        }
        Ok(pruned)
    }

    async fn get_by_id(&self, process_id: i64) -> Result<Option<Process>> {
        let row = sqlx::query("SELECT * FROM processes WHERE id = $1")
            .bind(process_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_process).transpose()
    }

    async fn supervisees(&self, supervisor_id: i64) -> Result<Vec<Process>> {
        let rows = sqlx::query("SELECT * FROM processes WHERE supervisor_id = $1 ORDER BY id")
            .bind(supervisor_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_process).collect()
    }
}
