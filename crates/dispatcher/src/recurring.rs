//! 周期任务调度器
//!
//! 启动时把静态配置对账进数据库（新增/更新/删除），随后为每个
//! 任务维持一个内存中的单次定时器。刻度到达后先重臂下一个刻度
//! 再做入队工作，慢入队不会拖迟后续刻度。
//!
//! 多 scheduler 同时运行时依赖触发账本 (task_key, run_at) 的
//! 唯一约束：谁插入成功谁入队，其余实例静默跳过。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use conveyor_core::config::RecurringTaskConfig;
use conveyor_core::errors::{ErrorCallback, QueueError, Result};
use conveyor_core::models::{Job, NewJob, ProcessKind, ProcessRegistration, RecurringTask};
use conveyor_core::services::QueueService;
use conveyor_core::traits::{ProcessRepository, RecurringRepository};

use crate::cron_schedule::CronSchedule;

/// 单个刻度的触发结果
#[derive(Debug)]
pub enum FireOutcome {
    /// 本实例赢得该刻度，作业已入队
    Fired(Job),
    /// 其他实例已触发该刻度
    Skipped,
}

pub struct RecurringScheduler {
    recurring: Arc<dyn RecurringRepository>,
    queue: Arc<QueueService>,
    processes: Arc<dyn ProcessRepository>,
    heartbeat_interval: Duration,
    supervisor_id: Option<i64>,
    /// 主循环因存储层故障退出前调用一次
    on_error: Option<ErrorCallback>,
}

impl RecurringScheduler {
    pub fn new(
        recurring: Arc<dyn RecurringRepository>,
        queue: Arc<QueueService>,
        processes: Arc<dyn ProcessRepository>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            recurring,
            queue,
            processes,
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

    /// 把静态配置对账进数据库：逐条校验并 upsert，
    /// 删除配置中已不存在的任务。返回对账后的全量任务。
    pub async fn reconcile(&self, configs: &[RecurringTaskConfig]) -> Result<Vec<RecurringTask>> {
        let mut keys = Vec::with_capacity(configs.len());
        for config in configs {
            CronSchedule::validate(&config.schedule)?;
            let mut task = RecurringTask::new(&config.key, &config.schedule, &config.class);
            task.arguments = config.arguments.clone();
            task.queue_name = config.queue.clone();
            task.priority = config.priority;
            self.recurring.upsert_task(&task).await?;
            keys.push(config.key.clone());
        }

        let removed = self.recurring.delete_tasks_except(&keys).await?;
        if removed > 0 {
            info!("对账删除了 {} 个已移出配置的周期任务", removed);
        }
        self.recurring.list_tasks().await
    }

    /// 触发一个刻度：先在账本认领，认领成功才入队并回填 job_id
    pub async fn fire(&self, task: &RecurringTask, run_at: DateTime<Utc>) -> Result<FireOutcome> {
        if !self.recurring.record_fire(&task.key, run_at).await? {
            debug!("{} 刻度 {} 已被其他实例触发", task.entity_description(), run_at);
            return Ok(FireOutcome::Skipped);
        }

        let new_job = NewJob::new(&task.class_name, task.arguments.clone())
            .queue(&task.queue_name)
            .priority(task.priority);
        let job = self.queue.enqueue(new_job).await?;
        self.recurring.attach_job(&task.key, run_at, job.id).await?;

        info!(
            "{} 于 {} 触发，作业 {} 已入队",
            task.entity_description(),
            run_at,
            job.id
        );
        Ok(FireOutcome::Fired(job))
    }

    /// scheduler 主循环：注册进程，为每个任务运行一个定时循环
    ///
    /// 任一定时循环遇到存储层故障都会让整个 scheduler 退出：
    /// 上报错误回调后把 Err 抛给监管方
    pub async fn run(
        self: Arc<Self>,
        configs: &[RecurringTaskConfig],
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let result = self.run_inner(configs, shutdown).await;
        if let Err(e) = &result {
            error!("scheduler 循环因存储层故障退出: {e}");
            if let Some(hook) = &self.on_error {
                hook(e);
            }
        }
        result
    }

    async fn run_inner(
        self: &Arc<Self>,
        configs: &[RecurringTaskConfig],
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut registration = ProcessRegistration::generate(ProcessKind::Scheduler);
        if let Some(supervisor_id) = self.supervisor_id {
            registration = registration.supervised_by(supervisor_id);
        }
        let mut process = self.processes.register(&registration).await?;

        let tasks = self.reconcile(configs).await?;
        info!("scheduler {} 启动，共 {} 个周期任务", process.name, tasks.len());

        let mut timers = JoinSet::new();
        for task in tasks {
            let scheduler = Arc::clone(self);
            let shutdown = shutdown.resubscribe();
            timers.spawn(async move { scheduler.run_task_loop(task, shutdown).await });
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if !self.processes.heartbeat(process.id, Utc::now()).await? {
                        warn!("scheduler {} 的进程行已被清理，重新注册", process.name);
                        process = self.processes.register(&registration).await?;
                    }
                }
                // 定时循环只会带着 Err 提前结束；正常退出只发生在
                // 任务不再有下一个刻度时
                joined = timers.join_next(), if !timers.is_empty() => {
                    match joined {
                        Some(Ok(Err(e))) => return Err(e),
                        Some(Err(join_error)) => {
                            return Err(QueueError::Internal(format!(
                                "定时循环异常终止: {join_error}"
                            )));
                        }
                        _ => {}
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        // 定时循环各自持有 resubscribe 出来的接收端，会自行退出
        while timers.join_next().await.is_some() {}
        self.processes.deregister(process.id).await?;
        info!("scheduler {} 已退出", process.name);
        Ok(())
    }

    async fn run_task_loop(
        &self,
        task: RecurringTask,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let schedule = match CronSchedule::parse(&task.schedule) {
            Ok(s) => s,
            Err(e) => {
                // reconcile 已校验过，这里只会在数据库被直接改动时出现
                error!("{} 表达式无效: {e}", task.entity_description());
                return Ok(());
            }
        };

        let mut next = match schedule.next_occurrence(Utc::now()) {
            Some(t) => t,
            None => {
                warn!("{} 不会再触发", task.entity_description());
                return Ok(());
            }
        };

        loop {
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.recv() => {
                    debug!("{} 定时循环退出", task.entity_description());
                    return Ok(());
                }
            }

            let run_at = next;
            // 先重臂再入队
            next = match schedule.next_occurrence(run_at) {
                Some(t) => t,
                None => {
                    warn!("{} 已到最后一个刻度", task.entity_description());
                    return Ok(());
                }
            };

            // 触发失败即存储层故障（账本或入队不可写），向上传递
            self.fire(&task, run_at).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conveyor_core::services::ConcurrencyController;
    use conveyor_testing_utils::InMemoryStore;

    /// 账本不可写的周期任务仓储：对账正常，触发刻度时报存储故障
    struct ReadOnlyLedger {
        inner: InMemoryStore,
    }

    #[async_trait]
    impl RecurringRepository for ReadOnlyLedger {
        async fn upsert_task(&self, task: &RecurringTask) -> Result<RecurringTask> {
            self.inner.upsert_task(task).await
        }

        async fn list_tasks(&self) -> Result<Vec<RecurringTask>> {
            self.inner.list_tasks().await
        }

        async fn delete_tasks_except(&self, keys: &[String]) -> Result<u64> {
            self.inner.delete_tasks_except(keys).await
        }

        async fn record_fire(&self, _task_key: &str, _run_at: DateTime<Utc>) -> Result<bool> {
            Err(QueueError::DatabaseOperation("账本不可写".to_string()))
        }

        async fn attach_job(
            &self,
            task_key: &str,
            run_at: DateTime<Utc>,
            job_id: i64,
        ) -> Result<()> {
            self.inner.attach_job(task_key, run_at, job_id).await
        }
    }

    fn scheduler_with_store() -> (RecurringScheduler, InMemoryStore) {
        let store = InMemoryStore::new();
        let concurrency = Arc::new(ConcurrencyController::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        ));
        let queue = Arc::new(QueueService::new(Arc::new(store.clone()), concurrency));
        (
            RecurringScheduler::new(
                Arc::new(store.clone()),
                queue,
                Arc::new(store.clone()),
                Duration::from_secs(60),
            ),
            store,
        )
    }

    fn task_config(key: &str, schedule: &str) -> RecurringTaskConfig {
        RecurringTaskConfig {
            key: key.to_string(),
            schedule: schedule.to_string(),
            class: "PeriodicCleanup".to_string(),
            arguments: serde_json::json!({}),
            queue: "maintenance".to_string(),
            priority: 0,
        }
    }

    #[tokio::test]
    async fn test_reconcile_upserts_and_prunes() {
        let (scheduler, _store) = scheduler_with_store();

        let tasks = scheduler
            .reconcile(&[task_config("a", "@hourly"), task_config("b", "@daily")])
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);

        // b 移出配置后对账应删除它
        let tasks = scheduler
            .reconcile(&[task_config("a", "every 5 minutes")])
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].key, "a");
        assert_eq!(tasks[0].schedule, "every 5 minutes");
    }

    #[tokio::test]
    async fn test_reconcile_rejects_invalid_schedule() {
        let (scheduler, _store) = scheduler_with_store();
        let result = scheduler.reconcile(&[task_config("bad", "whenever")]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fire_is_idempotent_per_tick() {
        let (scheduler, store) = scheduler_with_store();
        let tasks = scheduler
            .reconcile(&[task_config("cleanup", "@hourly")])
            .await
            .unwrap();
        let task = &tasks[0];
        let run_at = Utc::now();

        let first = scheduler.fire(task, run_at).await.unwrap();
        assert!(matches!(first, FireOutcome::Fired(_)));

        // 同一刻度的第二次触发（另一个 scheduler 实例）被账本拒绝
        let second = scheduler.fire(task, run_at).await.unwrap();
        assert!(matches!(second, FireOutcome::Skipped));

        assert_eq!(store.counts().jobs, 1);
        assert_eq!(store.counts().ready, 1);
    }

    #[tokio::test]
    async fn test_fired_job_lands_on_configured_queue() {
        let (scheduler, _store) = scheduler_with_store();
        let tasks = scheduler
            .reconcile(&[task_config("cleanup", "@hourly")])
            .await
            .unwrap();

        let outcome = scheduler.fire(&tasks[0], Utc::now()).await.unwrap();
        let FireOutcome::Fired(job) = outcome else {
            panic!("expected a fired job");
        };
        assert_eq!(job.queue_name, "maintenance");
        assert_eq!(job.class_name, "PeriodicCleanup");
    }

    #[tokio::test]
    async fn test_ledger_failure_stops_scheduler_run() {
        let store = InMemoryStore::new();
        let concurrency = Arc::new(ConcurrencyController::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        ));
        let queue = Arc::new(QueueService::new(Arc::new(store.clone()), concurrency));
        let scheduler = Arc::new(RecurringScheduler::new(
            Arc::new(ReadOnlyLedger {
                inner: store.clone(),
            }),
            queue,
            Arc::new(store.clone()),
            Duration::from_secs(60),
        ));

        // 每秒触发一次，首个刻度就会撞上不可写的账本
        let configs = [task_config("tick", "every second")];
        let (_tx, rx) = broadcast::channel(1);
        let result = tokio::time::timeout(Duration::from_secs(5), scheduler.run(&configs, rx))
            .await
            .expect("账本故障应让 scheduler 退出而不是继续触发");
        assert!(matches!(result, Err(QueueError::DatabaseOperation(_))));
        assert_eq!(store.counts().jobs, 0);
    }
}
