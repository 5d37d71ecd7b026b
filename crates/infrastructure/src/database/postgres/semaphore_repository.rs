use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool, Row};
use tracing::instrument;

use conveyor_core::errors::Result;
use conveyor_core::models::Semaphore;
use conveyor_core::traits::SemaphoreRepository;

pub struct PostgresSemaphoreRepository {
    pool: PgPool,
}

impl PostgresSemaphoreRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// 获取一个槽位（可在任意连接/事务上复用）
///
/// 行不存在则以 value = limit - 1 创建；并发创建撞唯一索引时
/// 视为“已存在”，退回条件扣减路径。两条语句都不读回 value，
/// [0, limit] 不变量完全由条件更新保证。
pub(crate) async fn acquire_slot(
    conn: &mut PgConnection,
    key: &str,
    limit: i32,
    duration_seconds: i64,
) -> Result<bool> {
    let expires_at = Utc::now() + Duration::seconds(duration_seconds);

    let inserted = sqlx::query(
        r#"
        INSERT INTO semaphores (key, value, expires_at)
        VALUES ($1, $2 - 1, $3)
        ON CONFLICT (key) DO NOTHING
        "#,
    )
    .bind(key)
    .bind(limit)
    .bind(expires_at)
    .execute(&mut *conn)
    .await?;
    if inserted.rows_affected() == 1 {
        return Ok(true);
    }

    let decremented = sqlx::query(
        r#"
        UPDATE semaphores
        SET value = value - 1, expires_at = $2, updated_at = now()
        WHERE key = $1 AND value > 0
        "#,
    )
    .bind(key)
    .bind(expires_at)
    .execute(&mut *conn)
    .await?;
    Ok(decremented.rows_affected() == 1)
}

#[async_trait]
impl SemaphoreRepository for PostgresSemaphoreRepository {
    #[instrument(skip(self))]
    async fn try_acquire(&self, key: &str, limit: i32, duration_seconds: i64) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        acquire_slot(&mut conn, key, limit, duration_seconds).await
    }

    #[instrument(skip(self))]
    async fn release(&self, key: &str, limit: i32, duration_seconds: i64) -> Result<bool> {
        let expires_at = Utc::now() + Duration::seconds(duration_seconds);
        // 加一封顶 limit，同时顺延看门狗到期时间
        let updated = sqlx::query(
            r#"
            UPDATE semaphores
            SET value = value + 1, expires_at = $2, updated_at = now()
            WHERE key = $1 AND value < $3
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn expire(&self, now: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM semaphores WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }

    async fn get(&self, key: &str) -> Result<Option<Semaphore>> {
        let row = sqlx::query("SELECT * FROM semaphores WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => Some(Semaphore {
                id: row.try_get("id")?,
                key: row.try_get("key")?,
                value: row.try_get("value")?,
                expires_at: row.try_get("expires_at")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            }),
            None => None,
        })
    }
}
