//! 数据库连接管理与迁移

pub mod postgres;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use conveyor_core::config::DatabaseConfig;
use conveyor_core::errors::{QueueError, Result};

/// 按配置建立连接池
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .connect(&config.url)
        .await?;

    info!("数据库连接池已建立 (max={})", config.max_connections);
    Ok(pool)
}

/// 执行内嵌迁移
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| QueueError::DatabaseOperation(format!("迁移执行失败: {e}")))?;
    info!("数据库迁移完成");
    Ok(())
}
