//! 并发控制子系统
//!
//! 信号量 + 阻塞执行的准入控制：入队/晋升时决定作业进入 Ready
//! 还是 Blocked（或按策略直接丢弃）；作业完成时归还槽位并尝试
//! 释放一个等待者。批量维护路径兜底回收崩溃进程遗留的槽位。
//!
//! 所有槽位变更都是存储层的条件更新，同一并发键的争用彼此隔离，
//! 不同键之间互不阻塞。

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::errors::Result;
use crate::models::{Admission, ConcurrencyPolicy, OnConflict};
use crate::traits::{ExecutionRepository, SemaphoreRepository};

pub struct ConcurrencyController {
    semaphores: Arc<dyn SemaphoreRepository>,
    executions: Arc<dyn ExecutionRepository>,
}

impl ConcurrencyController {
    pub fn new(
        semaphores: Arc<dyn SemaphoreRepository>,
        executions: Arc<dyn ExecutionRepository>,
    ) -> Self {
        Self {
            semaphores,
            executions,
        }
    }

    /// 准入判定
    ///
    /// 无限流策略的作业直接 Ready；否则尝试获取槽位，
    /// 失败时按策略进入 Blocked（携带到期时间）或 Discarded。
    #[instrument(skip(self, policy))]
    pub async fn attempt_admission(&self, policy: Option<&ConcurrencyPolicy>) -> Result<Admission> {
        let policy = match policy {
            Some(p) if p.is_limited() => p,
            _ => return Ok(Admission::Ready),
        };

        let acquired = self
            .semaphores
            .try_acquire(&policy.key, policy.limit, policy.duration_seconds)
            .await?;
        if acquired {
            return Ok(Admission::Ready);
        }

        match policy.on_conflict {
            OnConflict::Block => Ok(Admission::Blocked {
                key: policy.key.clone(),
                expires_at: Utc::now() + policy.duration(),
            }),
            OnConflict::Discard => {
                debug!("并发键 {} 无可用槽位，按策略丢弃", policy.key);
                Ok(Admission::Discarded)
            }
        }
    }

    /// 完成信号：归还槽位并尝试释放一个等待者
    ///
    /// 先条件加一（封顶 limit）并顺延到期时间，再在 SKIP LOCKED
    /// 保护下迁移该键优先级最高的阻塞行——并发的信号方不会
    /// 争抢同一个等待者。
    #[instrument(skip(self, policy), fields(key = %policy.key))]
    pub async fn release(&self, policy: &ConcurrencyPolicy) -> Result<()> {
        if !policy.is_limited() {
            return Ok(());
        }

        self.semaphores
            .release(&policy.key, policy.limit, policy.duration_seconds)
            .await?;

        let released = self.executions.release_one_blocked(&policy.key).await?;
        if released {
            debug!("并发键 {} 的一个等待者已晋升为 Ready", policy.key);
        }
        Ok(())
    }

    /// 批量维护：对存在可释放等待者的键各释放一个，受批大小约束。
    /// 无可释放对象时为空操作。
    pub async fn unblock(&self, batch_size: i64) -> Result<usize> {
        let keys = self
            .executions
            .releasable_keys(Utc::now(), batch_size)
            .await?;
        let mut released = 0;
        for key in &keys {
            if self.executions.release_one_blocked(key).await? {
                released += 1;
            }
        }
        if released > 0 {
            debug!("批量维护释放了 {} 个等待者", released);
        }
        Ok(released)
    }

    /// 删除已到期的信号量行（崩溃进程未归还的槽位）
    pub async fn expire_semaphores(&self) -> Result<u64> {
        let expired = self.semaphores.expire(Utc::now()).await?;
        if expired > 0 {
            debug!("回收了 {} 个过期信号量", expired);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use mockall::mock;
    use mockall::predicate::eq;

    use crate::models::{ClaimedExecution, ClaimedJob, Disposition, ExecutionError, Semaphore};
    use crate::traits::DueExecution;

    mock! {
        Semaphores {}

        #[async_trait]
        impl SemaphoreRepository for Semaphores {
            async fn try_acquire(&self, key: &str, limit: i32, duration_seconds: i64) -> Result<bool>;
            async fn release(&self, key: &str, limit: i32, duration_seconds: i64) -> Result<bool>;
            async fn expire(&self, now: DateTime<Utc>) -> Result<u64>;
            async fn get(&self, key: &str) -> Result<Option<Semaphore>>;
        }
    }

    mock! {
        Executions {}

        #[async_trait]
        impl ExecutionRepository for Executions {
            async fn claim(
                &self,
                queue_names: &[String],
                max_count: i64,
                process_id: i64,
            ) -> Result<Vec<ClaimedJob>>;
            async fn claimed_by_process(&self, process_id: i64) -> Result<Vec<ClaimedExecution>>;
            async fn fail_claimed_by_process(
                &self,
                process_id: i64,
                error: &ExecutionError,
            ) -> Result<u64>;
            async fn due_scheduled(
                &self,
                now: DateTime<Utc>,
                excluded_queues: &[String],
                limit: i64,
            ) -> Result<Vec<DueExecution>>;
            async fn promote_scheduled(&self, job_id: i64, disposition: Disposition) -> Result<bool>;
            async fn release_one_blocked(&self, concurrency_key: &str) -> Result<bool>;
            async fn releasable_keys(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>>;
        }
    }

    fn controller(
        semaphores: MockSemaphores,
        executions: MockExecutions,
    ) -> ConcurrencyController {
        ConcurrencyController::new(Arc::new(semaphores), Arc::new(executions))
    }

    #[tokio::test]
    async fn test_unlimited_jobs_are_admitted_directly() {
        let mut semaphores = MockSemaphores::new();
        semaphores.expect_try_acquire().never();
        let c = controller(semaphores, MockExecutions::new());

        assert_eq!(c.attempt_admission(None).await.unwrap(), Admission::Ready);
        let zero_limit = ConcurrencyPolicy::new("k", 0);
        assert_eq!(
            c.attempt_admission(Some(&zero_limit)).await.unwrap(),
            Admission::Ready
        );
    }

    #[tokio::test]
    async fn test_admission_acquires_slot() {
        let mut semaphores = MockSemaphores::new();
        semaphores
            .expect_try_acquire()
            .with(eq("tenant-1"), eq(2), eq(180))
            .times(1)
            .returning(|_, _, _| Ok(true));
        let c = controller(semaphores, MockExecutions::new());

        let policy = ConcurrencyPolicy::new("tenant-1", 2);
        assert_eq!(
            c.attempt_admission(Some(&policy)).await.unwrap(),
            Admission::Ready
        );
    }

    #[tokio::test]
    async fn test_admission_blocks_when_no_slot() {
        let mut semaphores = MockSemaphores::new();
        semaphores
            .expect_try_acquire()
            .returning(|_, _, _| Ok(false));
        let c = controller(semaphores, MockExecutions::new());

        let policy = ConcurrencyPolicy::new("tenant-1", 1);
        match c.attempt_admission(Some(&policy)).await.unwrap() {
            Admission::Blocked { key, expires_at } => {
                assert_eq!(key, "tenant-1");
                assert!(expires_at > Utc::now());
            }
            other => panic!("unexpected admission: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_admission_discards_on_conflict_policy() {
        let mut semaphores = MockSemaphores::new();
        semaphores
            .expect_try_acquire()
            .returning(|_, _, _| Ok(false));
        let c = controller(semaphores, MockExecutions::new());

        let mut policy = ConcurrencyPolicy::new("tenant-1", 1);
        policy.on_conflict = OnConflict::Discard;
        assert_eq!(
            c.attempt_admission(Some(&policy)).await.unwrap(),
            Admission::Discarded
        );
    }

    #[tokio::test]
    async fn test_release_signals_then_unblocks_one_waiter() {
        let mut semaphores = MockSemaphores::new();
        semaphores
            .expect_release()
            .with(eq("tenant-1"), eq(1), eq(180))
            .times(1)
            .returning(|_, _, _| Ok(true));
        let mut executions = MockExecutions::new();
        executions
            .expect_release_one_blocked()
            .with(eq("tenant-1"))
            .times(1)
            .returning(|_| Ok(true));
        let c = controller(semaphores, executions);

        c.release(&ConcurrencyPolicy::new("tenant-1", 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unblock_with_nothing_eligible_is_noop() {
        let mut executions = MockExecutions::new();
        executions
            .expect_releasable_keys()
            .times(1)
            .returning(|_, _| Ok(Vec::new()));
        executions.expect_release_one_blocked().never();
        let c = controller(MockSemaphores::new(), executions);

        assert_eq!(c.unblock(100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unblock_releases_one_waiter_per_key() {
        let mut executions = MockExecutions::new();
        executions
            .expect_releasable_keys()
            .returning(|_, _| Ok(vec!["a".to_string(), "b".to_string()]));
        executions
            .expect_release_one_blocked()
            .times(2)
            .returning(|key| Ok(key == "a"));
        let c = controller(MockSemaphores::new(), executions);

        assert_eq!(c.unblock(100).await.unwrap(), 1);
    }
}
