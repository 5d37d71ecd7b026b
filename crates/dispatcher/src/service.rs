//! Dispatcher 服务
//!
//! 轮询到期的定时作业，经并发准入晋升为 Ready / Blocked /
//! Finished，暂停中的队列被排除在外。多 dispatcher 并发运行时
//! 晋升以 scheduled 行的删除为准：行已被别人删掉的晋升返回
//! false，本实例退还刚占下的槽位。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use conveyor_core::config::DispatcherConfig;
use conveyor_core::errors::{ErrorCallback, Result};
use conveyor_core::models::{Admission, Disposition, ProcessKind, ProcessRegistration};
use conveyor_core::services::ConcurrencyController;
use conveyor_core::traits::{
    ExecutionRepository, JobRepository, ProcessRepository, QueueRepository,
};

pub struct DispatcherService {
    config: DispatcherConfig,
    jobs: Arc<dyn JobRepository>,
    executions: Arc<dyn ExecutionRepository>,
    queues: Arc<dyn QueueRepository>,
    processes: Arc<dyn ProcessRepository>,
    concurrency: Arc<ConcurrencyController>,
    heartbeat_interval: Duration,
    supervisor_id: Option<i64>,
    /// 主循环因存储层故障退出前调用一次
    on_error: Option<ErrorCallback>,
}

impl DispatcherService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatcherConfig,
        jobs: Arc<dyn JobRepository>,
        executions: Arc<dyn ExecutionRepository>,
        queues: Arc<dyn QueueRepository>,
        processes: Arc<dyn ProcessRepository>,
        concurrency: Arc<ConcurrencyController>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            config,
            jobs,
            executions,
            queues,
            processes,
            concurrency,
            heartbeat_interval,
            supervisor_id: None,
            on_error: None,
        }
    }

    pub fn supervised_by(mut self, supervisor_id: i64) -> Self {
        self.supervisor_id = Some(supervisor_id);
        self
    }

    pub fn on_error(mut self, hook: ErrorCallback) -> Self {
        self.on_error = Some(hook);
        self
    }

    /// 晋升一批到期的定时作业，返回晋升数量
    #[instrument(skip(self))]
    pub async fn dispatch_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let paused = self.queues.paused_queues().await?;
        let due = self
            .executions
            .due_scheduled(now, &paused, self.config.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut promoted = 0;
        for execution in &due {
            let job = match self.jobs.get_by_id(execution.job_id).await? {
                Some(job) => job,
                // 作业行已被外部删除，残留的 scheduled 行直接清掉
                None => {
                    self.executions
                        .promote_scheduled(execution.job_id, Disposition::Finished)
                        .await?;
                    continue;
                }
            };

            let admission = self
                .concurrency
                .attempt_admission(job.concurrency.as_ref())
                .await?;
            let disposition = match admission.clone() {
                Admission::Ready => Disposition::Ready,
                Admission::Blocked { key, expires_at } => Disposition::Blocked { key, expires_at },
                Admission::Discarded => Disposition::Finished,
            };

            if self
                .executions
                .promote_scheduled(execution.job_id, disposition)
                .await?
            {
                promoted += 1;
            } else if let (Admission::Ready, Some(policy)) = (admission, job.concurrency.as_ref()) {
                // 晋升竞争失败，退还刚获取的槽位
                self.concurrency.release(policy).await?;
            }
        }

        if promoted > 0 {
            debug!("晋升了 {promoted} 个到期作业（本批 {} 个）", due.len());
        }
        Ok(promoted)
    }

    /// 并发维护：先回收过期信号量再批量解阻塞。
    /// 顺序不可颠倒：过期行占着键，删掉之后等待者才能重新获取槽位。
    #[instrument(skip(self))]
    pub async fn maintenance_once(&self) -> Result<(usize, u64)> {
        let expired = self.concurrency.expire_semaphores().await?;
        let released = self
            .concurrency
            .unblock(self.config.maintenance_batch_size)
            .await?;
        Ok((released, expired))
    }

    /// dispatcher 主循环：注册进程，按固定节奏晋升与维护
    ///
    /// 存储层故障会让循环退出：上报错误回调后把 Err 抛给监管方
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let result = self.run_inner(shutdown).await;
        if let Err(e) = &result {
            error!("dispatcher 循环因存储层故障退出: {e}");
            if let Some(hook) = &self.on_error {
                hook(e);
            }
        }
        result
    }

    async fn run_inner(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut registration = ProcessRegistration::generate(ProcessKind::Dispatcher);
        if let Some(supervisor_id) = self.supervisor_id {
            registration = registration.supervised_by(supervisor_id);
        }
        let mut process = self.processes.register(&registration).await?;
        info!("dispatcher {} 开始运行", process.name);

        let mut poll = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        let mut maintenance = tokio::time::interval(Duration::from_secs(
            self.config.maintenance_interval_seconds,
        ));
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.dispatch_once(Utc::now()).await?;
                }
                _ = maintenance.tick() => {
                    self.maintenance_once().await?;
                }
                _ = heartbeat.tick() => {
                    // 心跳落空说明进程行已被清理，重新注册一行
                    if !self.processes.heartbeat(process.id, Utc::now()).await? {
                        warn!("dispatcher {} 的进程行已被清理，重新注册", process.name);
                        process = self.processes.register(&registration).await?;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        self.processes.deregister(process.id).await?;
        info!("dispatcher {} 已退出", process.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use conveyor_core::errors::QueueError;
    use conveyor_core::models::{
        ClaimedExecution, ClaimedJob, ConcurrencyPolicy, ExecutionError, ExecutionState, NewJob,
        OnConflict,
    };
    use conveyor_core::services::QueueService;
    use conveyor_core::traits::{DueExecution, QueueRepository};
    use conveyor_testing_utils::InMemoryStore;

    /// 到期扫描必败的执行仓储，模拟存储层故障
    struct BrokenExecutions;

    #[async_trait]
    impl ExecutionRepository for BrokenExecutions {
        async fn claim(
            &self,
            _queue_names: &[String],
            _max_count: i64,
            _process_id: i64,
        ) -> Result<Vec<ClaimedJob>> {
            Ok(Vec::new())
        }

        async fn claimed_by_process(&self, _process_id: i64) -> Result<Vec<ClaimedExecution>> {
            Ok(Vec::new())
        }

        async fn fail_claimed_by_process(
            &self,
            _process_id: i64,
            _error: &ExecutionError,
        ) -> Result<u64> {
            Ok(0)
        }

        async fn due_scheduled(
            &self,
            _now: DateTime<Utc>,
            _excluded_queues: &[String],
            _limit: i64,
        ) -> Result<Vec<DueExecution>> {
            Err(QueueError::DatabaseOperation("连接池已关闭".to_string()))
        }

        async fn promote_scheduled(&self, _job_id: i64, _disposition: Disposition) -> Result<bool> {
            Ok(false)
        }

        async fn release_one_blocked(&self, _concurrency_key: &str) -> Result<bool> {
            Ok(false)
        }

        async fn releasable_keys(&self, _now: DateTime<Utc>, _limit: i64) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        dispatcher: DispatcherService,
        queue: Arc<QueueService>,
        store: InMemoryStore,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let concurrency = Arc::new(ConcurrencyController::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        ));
        let queue = Arc::new(QueueService::new(
            Arc::new(store.clone()),
            Arc::clone(&concurrency),
        ));
        let dispatcher = DispatcherService::new(
            DispatcherConfig::default(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            concurrency,
            Duration::from_secs(60),
        );
        Fixture {
            dispatcher,
            queue,
            store,
        }
    }

    #[tokio::test]
    async fn test_due_job_promoted_to_ready() {
        let f = fixture();
        let at = Utc::now() + ChronoDuration::seconds(30);
        let job = f
            .queue
            .enqueue_at(NewJob::new("Newsletter", serde_json::json!({})), at)
            .await
            .unwrap();
        assert_eq!(f.store.counts().scheduled, 1);

        // 时间未到不晋升
        assert_eq!(f.dispatcher.dispatch_once(Utc::now()).await.unwrap(), 0);

        let promoted = f
            .dispatcher
            .dispatch_once(at + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(promoted, 1);
        assert_eq!(f.store.counts().scheduled, 0);
        assert_eq!(f.store.counts().ready, 1);
        let state = f.store.state_of(job.id);
        assert_eq!(state, Some(ExecutionState::Ready));
    }

    #[tokio::test]
    async fn test_paused_queue_excluded_from_dispatch() {
        let f = fixture();
        let at = Utc::now() - ChronoDuration::seconds(5);
        f.queue
            .enqueue(
                NewJob::new("Report", serde_json::json!({}))
                    .queue("reports")
                    .scheduled_at(at + ChronoDuration::seconds(60)),
            )
            .await
            .unwrap();

        f.store.pause("reports").await.unwrap();
        let promoted = f
            .dispatcher
            .dispatch_once(Utc::now() + ChronoDuration::seconds(120))
            .await
            .unwrap();
        assert_eq!(promoted, 0);
        assert_eq!(f.store.counts().scheduled, 1);

        f.store.resume("reports").await.unwrap();
        let promoted = f
            .dispatcher
            .dispatch_once(Utc::now() + ChronoDuration::seconds(120))
            .await
            .unwrap();
        assert_eq!(promoted, 1);
    }

    #[tokio::test]
    async fn test_exhausted_semaphore_promotes_to_blocked() {
        let f = fixture();
        let policy = ConcurrencyPolicy::new("tenant-9", 1);

        // 先占满唯一槽位
        let _running = f
            .queue
            .enqueue(NewJob::new("Sync", serde_json::json!({})).concurrency(policy.clone()))
            .await
            .unwrap();
        assert_eq!(f.store.semaphore_value("tenant-9"), Some(0));

        let at = Utc::now() - ChronoDuration::seconds(1);
        let blocked = f
            .queue
            .enqueue(
                NewJob::new("Sync", serde_json::json!({}))
                    .concurrency(policy)
                    .scheduled_at(at + ChronoDuration::seconds(60)),
            )
            .await
            .unwrap();

        let promoted = f
            .dispatcher
            .dispatch_once(Utc::now() + ChronoDuration::seconds(120))
            .await
            .unwrap();
        assert_eq!(promoted, 1);
        assert_eq!(
            f.store.state_of(blocked.id),
            Some(ExecutionState::Blocked)
        );
    }

    #[tokio::test]
    async fn test_discard_policy_finishes_conflicting_job() {
        let f = fixture();
        let mut policy = ConcurrencyPolicy::new("tenant-3", 1);
        policy.on_conflict = OnConflict::Discard;

        let _running = f
            .queue
            .enqueue(NewJob::new("Import", serde_json::json!({})).concurrency(policy.clone()))
            .await
            .unwrap();

        let at = Utc::now() + ChronoDuration::seconds(30);
        let discarded = f
            .queue
            .enqueue_at(
                NewJob::new("Import", serde_json::json!({})).concurrency(policy),
                at,
            )
            .await
            .unwrap();

        let promoted = f
            .dispatcher
            .dispatch_once(at + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(promoted, 1);
        assert_eq!(
            f.store.state_of(discarded.id),
            Some(ExecutionState::Finished { failed: false })
        );
        assert_eq!(f.store.counts().ready, 0);
        assert_eq!(f.store.counts().blocked, 0);
    }

    #[tokio::test]
    async fn test_maintenance_releases_waiter_after_semaphore_expiry() {
        let f = fixture();
        let mut policy = ConcurrencyPolicy::new("tenant-1", 1);
        policy.duration_seconds = 0; // 立即过期，模拟崩溃进程遗留的槽位

        let _holder = f
            .queue
            .enqueue(NewJob::new("Sync", serde_json::json!({})).concurrency(policy.clone()))
            .await
            .unwrap();
        let waiter = f
            .queue
            .enqueue(NewJob::new("Sync", serde_json::json!({})).concurrency(policy))
            .await
            .unwrap();
        assert_eq!(
            f.store.state_of(waiter.id),
            Some(ExecutionState::Blocked)
        );

        let (released, _expired) = f.dispatcher.maintenance_once().await.unwrap();
        assert_eq!(released, 1);
        assert_eq!(
            f.store.state_of(waiter.id),
            Some(ExecutionState::Ready)
        );
    }

    #[tokio::test]
    async fn test_storage_failure_stops_run_and_reports_error() {
        let store = InMemoryStore::new();
        let concurrency = Arc::new(ConcurrencyController::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        ));
        let reported: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let dispatcher = DispatcherService::new(
            DispatcherConfig::default(),
            Arc::new(store.clone()),
            Arc::new(BrokenExecutions),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            concurrency,
            Duration::from_secs(60),
        )
        .on_error(Arc::new(move |e| {
            sink.lock().unwrap().push(e.to_string());
        }));

        let (_tx, rx) = broadcast::channel(1);
        let result = tokio::time::timeout(Duration::from_secs(2), dispatcher.run(rx))
            .await
            .expect("存储层故障应让主循环退出而不是继续轮询");
        assert!(matches!(result, Err(QueueError::DatabaseOperation(_))));

        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("连接池已关闭"));
    }
}
