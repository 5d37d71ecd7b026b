//! 真实 Postgres 集成测试
//!
//! 默认忽略；设置 DATABASE_URL 指向一个可写库后以
//! `cargo test -p conveyor-infrastructure -- --ignored` 运行。
//! 各用例使用唯一的队列名/并发键，可在同一个库上重复执行。

use chrono::{Duration, Utc};
use sqlx::PgPool;

use conveyor_core::models::{Disposition, ExecutionState, NewJob};
use conveyor_core::traits::{ExecutionRepository, JobRepository, SemaphoreRepository};
use conveyor_infrastructure::{
    run_migrations, PostgresExecutionRepository, PostgresJobRepository,
    PostgresSemaphoreRepository,
};

async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL 未设置");
    let pool = PgPool::connect(&url).await.expect("连接 Postgres 失败");
    run_migrations(&pool).await.expect("迁移执行失败");
    pool
}

fn unique(tag: &str) -> String {
    format!(
        "{tag}-{}-{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

#[tokio::test]
#[ignore = "需要 DATABASE_URL 指向真实 Postgres"]
async fn test_claim_orders_by_priority_and_consumes_ready_rows() {
    let pool = pool().await;
    let jobs = PostgresJobRepository::new(pool.clone());
    let executions = PostgresExecutionRepository::new(pool);
    let queue = unique("claim");

    for priority in [2, 1, 3] {
        jobs.create(
            &NewJob::new("Noop", serde_json::json!({}))
                .queue(&queue)
                .priority(priority),
            Disposition::Ready,
        )
        .await
        .unwrap();
    }

    let first = executions.claim(&[queue.clone()], 2, 9001).await.unwrap();
    let priorities: Vec<i32> = first.iter().map(|c| c.job.priority).collect();
    assert_eq!(priorities, vec![1, 2]);

    let second = executions.claim(&[queue.clone()], 10, 9001).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].job.priority, 3);

    // 就绪行已耗尽
    assert!(executions.claim(&[queue], 10, 9001).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "需要 DATABASE_URL 指向真实 Postgres"]
async fn test_concurrent_claimers_get_disjoint_jobs() {
    let pool = pool().await;
    let jobs = PostgresJobRepository::new(pool.clone());
    let queue = unique("contended");

    let total_jobs = 10;
    for priority in 0..total_jobs {
        jobs.create(
            &NewJob::new("Noop", serde_json::json!({}))
                .queue(&queue)
                .priority(priority),
            Disposition::Ready,
        )
        .await
        .unwrap();
    }

    // 四个认领者同时各要 3 个：SKIP LOCKED 让它们跳过彼此
    // 锁住的行，既不重复也不漏认领
    let mut claimers = Vec::new();
    for worker in 0..4_i64 {
        let executions = PostgresExecutionRepository::new(pool.clone());
        let queue = queue.clone();
        claimers.push(tokio::spawn(async move {
            executions.claim(&[queue], 3, 9100 + worker).await.unwrap()
        }));
    }

    let mut seen = std::collections::HashSet::new();
    let mut claimed_total = 0;
    for claimer in claimers {
        for claimed in claimer.await.unwrap() {
            assert!(
                seen.insert(claimed.job.id),
                "作业 {} 被两个认领者同时拿到",
                claimed.job.id
            );
            claimed_total += 1;
        }
    }
    assert_eq!(claimed_total, total_jobs);

    // 就绪行已全部消耗
    let executions = PostgresExecutionRepository::new(pool);
    assert!(executions.claim(&[queue], 10, 9199).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "需要 DATABASE_URL 指向真实 Postgres"]
async fn test_semaphore_conditional_updates_stay_in_bounds() {
    let pool = pool().await;
    let semaphores = PostgresSemaphoreRepository::new(pool);
    let key = unique("sem");

    // limit = 1：首次创建即扣减，第二次无槽位
    assert!(semaphores.try_acquire(&key, 1, 180).await.unwrap());
    assert!(!semaphores.try_acquire(&key, 1, 180).await.unwrap());
    assert_eq!(semaphores.get(&key).await.unwrap().unwrap().value, 0);

    // 归还封顶在 limit，重复归还是空操作
    assert!(semaphores.release(&key, 1, 180).await.unwrap());
    assert!(!semaphores.release(&key, 1, 180).await.unwrap());
    assert_eq!(semaphores.get(&key).await.unwrap().unwrap().value, 1);
}

#[tokio::test]
#[ignore = "需要 DATABASE_URL 指向真实 Postgres"]
async fn test_promote_scheduled_consumes_the_row_exactly_once() {
    let pool = pool().await;
    let jobs = PostgresJobRepository::new(pool.clone());
    let executions = PostgresExecutionRepository::new(pool);
    let queue = unique("promote");

    let due_at = Utc::now() - Duration::seconds(5);
    let job = jobs
        .create(
            &NewJob::new("Newsletter", serde_json::json!({})).queue(&queue),
            Disposition::Scheduled(due_at),
        )
        .await
        .unwrap();

    let due = executions
        .due_scheduled(Utc::now(), &[], 1_000)
        .await
        .unwrap();
    assert!(due.iter().any(|d| d.job_id == job.id));

    assert!(executions
        .promote_scheduled(job.id, Disposition::Ready)
        .await
        .unwrap());
    // 第二次晋升（并发 dispatcher 竞争）拿不到行
    assert!(!executions
        .promote_scheduled(job.id, Disposition::Ready)
        .await
        .unwrap());

    assert_eq!(
        jobs.execution_state(job.id).await.unwrap(),
        Some(ExecutionState::Ready)
    );
}
