//! Worker 服务
//!
//! 主循环在「认领一批 → 派发到执行池 → 自适应休眠」之间循环。
//! 单次认领数不超过执行池的空闲槽位，作业完成即唤醒主循环，
//! 空轮询则按控制器退避。执行结果只通过作业仓储推进状态机：
//! 成功删认领行并标记完成，失败落失败记录；带限流策略的作业
//! 完成后归还信号量槽位并尝试释放一个等待者。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Notify, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use conveyor_core::config::WorkerConfig;
use conveyor_core::errors::{ErrorCallback, QueueError, Result};
use conveyor_core::models::{ClaimedJob, ExecutionError, ProcessKind, ProcessRegistration};
use conveyor_core::polling::{AdaptivePoller, PollOutcome, PollerConfig};
use conveyor_core::queue_selector::QueueSelector;
use conveyor_core::services::ConcurrencyController;
use conveyor_core::traits::{
    ExecutionRepository, HandlerRegistry, JobContext, JobRepository, ProcessRepository,
    QueueRepository,
};

pub struct WorkerService {
    config: WorkerConfig,
    jobs: Arc<dyn JobRepository>,
    executions: Arc<dyn ExecutionRepository>,
    processes: Arc<dyn ProcessRepository>,
    concurrency: Arc<ConcurrencyController>,
    registry: Arc<HandlerRegistry>,
    selector: QueueSelector,
    poller: Mutex<AdaptivePoller>,
    /// 本地执行池：许可数即空闲槽位数，认领数不超过它
    slots: Arc<Semaphore>,
    /// 槽位释放时唤醒主循环，免掉一个完整的退避周期
    wake: Notify,
    heartbeat_interval: Duration,
    supervisor_id: Option<i64>,
    /// 主循环因存储层故障退出前调用一次
    on_error: Option<ErrorCallback>,
}

impl WorkerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        poller_config: PollerConfig,
        jobs: Arc<dyn JobRepository>,
        executions: Arc<dyn ExecutionRepository>,
        queues: Arc<dyn QueueRepository>,
        processes: Arc<dyn ProcessRepository>,
        concurrency: Arc<ConcurrencyController>,
        registry: Arc<HandlerRegistry>,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        let selector = QueueSelector::new(config.queues.clone(), queues);
        let poller = AdaptivePoller::new(poller_config)?;
        let pool_size = config.pool_size;
        Ok(Self {
            config,
            jobs,
            executions,
            processes,
            concurrency,
            registry,
            selector,
            poller: Mutex::new(poller),
            slots: Arc::new(Semaphore::new(pool_size)),
            wake: Notify::new(),
            heartbeat_interval,
            supervisor_id: None,
            on_error: None,
        })
    }

    pub fn supervised_by(mut self, supervisor_id: i64) -> Self {
        self.supervisor_id = Some(supervisor_id);
        self
    }

    pub fn on_error(mut self, hook: ErrorCallback) -> Self {
        self.on_error = Some(hook);
        self
    }

    /// 认领一批就绪作业并派发到执行池，返回认领数量
    #[instrument(skip(self))]
    pub async fn poll_once(self: &Arc<Self>, process_id: i64) -> Result<usize> {
        let idle = self.slots.available_permits();
        if idle == 0 {
            return Ok(0);
        }

        let queue_names = self.selector.resolve_names().await?;
        if queue_names.is_empty() {
            return Ok(0);
        }

        let claimed = self
            .executions
            .claim(&queue_names, idle as i64, process_id)
            .await?;
        let count = claimed.len();

        for claimed_job in claimed {
            // 认领数以空闲许可为上限，且只有本循环消耗许可
            let permit = match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("执行池许可耗尽，作业 {} 等待下轮认领恢复", claimed_job.job.id);
                    break;
                }
            };

            let worker = Arc::clone(self);
            tokio::spawn(async move {
                let job_id = claimed_job.job.id;
                if let Err(e) = worker.execute_now(claimed_job).await {
                    error!("作业 {job_id} 状态推进失败: {e}");
                }
                drop(permit);
                worker.wake.notify_one();
            });
        }

        Ok(count)
    }

    /// 执行单个已认领的作业并推进状态机
    ///
    /// 处理器缺失与处理器返回 Err 同样落为失败记录；
    /// 返回的 Err 仅表示状态推进本身失败（存储故障）。
    pub async fn execute_now(&self, claimed: ClaimedJob) -> Result<()> {
        let job = claimed.job;
        let context = JobContext {
            job_id: job.id,
            queue_name: job.queue_name.clone(),
        };

        let outcome = match self.registry.get(&job.class_name) {
            Ok(handler) => handler.execute(&context, &job.arguments).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.jobs.finish(job.id).await?;
                debug!("{} 执行成功", job.entity_description());
            }
            Err(e) => {
                let error = ExecutionError::new(error_class(&e), e.to_string());
                self.jobs.fail(job.id, &error).await?;
                warn!("{} 执行失败: {}", job.entity_description(), error.message);
            }
        }

        // 无论成败，占用的并发槽位都要归还
        if let Some(policy) = &job.concurrency {
            self.concurrency.release(policy).await?;
        }
        Ok(())
    }

    /// worker 主循环
    ///
    /// 处理器层面的失败只落失败记录；存储层故障会让循环退出：
    /// 上报错误回调后把 Err 抛给监管方，由它决定重启。
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let result = self.run_inner(shutdown).await;
        if let Err(e) = &result {
            error!("worker 循环因存储层故障退出: {e}");
            if let Some(hook) = &self.on_error {
                hook(e);
            }
        }
        result
    }

    async fn run_inner(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut registration = ProcessRegistration::generate(ProcessKind::Worker).metadata(
            serde_json::json!({
                "queues": self.config.queues,
                "pool_size": self.config.pool_size,
            }),
        );
        if let Some(supervisor_id) = self.supervisor_id {
            registration = registration.supervised_by(supervisor_id);
        }
        let mut process = self.processes.register(&registration).await?;
        info!(
            "worker {} 开始轮询，执行池 {}",
            process.name, self.config.pool_size
        );

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await; // interval 的首个 tick 立即完成，跳过

        loop {
            // 认领失败即存储层故障，退出循环；进程行留给心跳清理回收
            let outcome = match self.poll_once(process.id).await? {
                0 => PollOutcome::empty(),
                n => PollOutcome::claimed(n),
            };
            let interval = {
                let mut poller = self.poller.lock().map_err(|_| {
                    QueueError::Internal("轮询控制器的锁已中毒".to_string())
                })?;
                poller.record(outcome)
            };

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => {}
                _ = heartbeat.tick() => {
                    if !self.processes.heartbeat(process.id, Utc::now()).await? {
                        warn!("worker {} 的进程行已被清理，重新注册", process.name);
                        process = self.processes.register(&registration).await?;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        self.drain().await;
        self.processes.deregister(process.id).await?;
        info!("worker {} 已退出", process.name);
        Ok(())
    }

    /// 等待在途作业结束。超时控制由监管方负责（到时会被强杀）。
    async fn drain(&self) {
        let pool_size = self.config.pool_size;
        if self.slots.available_permits() < pool_size {
            info!(
                "等待 {} 个在途作业完成",
                pool_size - self.slots.available_permits()
            );
        }
        while self.slots.available_permits() < pool_size {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn error_class(error: &QueueError) -> &'static str {
    match error {
        QueueError::HandlerNotFound { .. } => "HandlerNotFoundError",
        QueueError::ExecutionFailed(_) => "ExecutionFailedError",
        QueueError::Database(_) | QueueError::DatabaseOperation(_) => "DatabaseError",
        _ => "JobError",
    }
}
