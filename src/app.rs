//! 应用组装
//!
//! 连接数据库、跑迁移、把仓储和服务按运行模式接起来。
//! supervisor 的 async 模式通过 ChildFactory 回到这里拉起
//! 子服务任务；fork 模式则由 supervisor 重新执行本二进制。

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use conveyor_core::config::AppConfig;
use conveyor_core::errors::{QueueError, Result};
use conveyor_core::models::ProcessKind;
use conveyor_core::services::{ConcurrencyController, QueueService};
use conveyor_core::traits::{
    ExecutionRepository, HandlerRegistry, JobRepository, ProcessRepository, QueueRepository,
    RecurringRepository, SemaphoreRepository,
};
use conveyor_dispatcher::{DispatcherService, RecurringScheduler};
use conveyor_infrastructure::{
    connect, run_migrations, PostgresExecutionRepository, PostgresJobRepository,
    PostgresProcessRepository, PostgresQueueRepository, PostgresRecurringRepository,
    PostgresSemaphoreRepository,
};
use conveyor_supervisor::{ChildFactory, ChildSpec, Supervisor};
use conveyor_worker::WorkerService;

/// 进程的运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Supervisor,
    Worker,
    Dispatcher,
    Scheduler,
}

impl AppMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "supervisor" => Ok(AppMode::Supervisor),
            "worker" => Ok(AppMode::Worker),
            "dispatcher" => Ok(AppMode::Dispatcher),
            "scheduler" => Ok(AppMode::Scheduler),
            other => Err(QueueError::Configuration(format!(
                "不支持的运行模式: {other}"
            ))),
        }
    }
}

/// 仓储集合，所有服务共享同一个连接池
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub semaphores: Arc<dyn SemaphoreRepository>,
    pub processes: Arc<dyn ProcessRepository>,
    pub recurring: Arc<dyn RecurringRepository>,
    pub queues: Arc<dyn QueueRepository>,
}

impl Repositories {
    pub fn postgres(pool: &PgPool) -> Self {
        Self {
            jobs: Arc::new(PostgresJobRepository::new(pool.clone())),
            executions: Arc::new(PostgresExecutionRepository::new(pool.clone())),
            semaphores: Arc::new(PostgresSemaphoreRepository::new(pool.clone())),
            processes: Arc::new(PostgresProcessRepository::new(pool.clone())),
            recurring: Arc::new(PostgresRecurringRepository::new(pool.clone())),
            queues: Arc::new(PostgresQueueRepository::new(pool.clone())),
        }
    }
}

pub struct Application {
    pub config: AppConfig,
    config_path: Option<String>,
    repos: Repositories,
    concurrency: Arc<ConcurrencyController>,
    queue: Arc<QueueService>,
    registry: Arc<HandlerRegistry>,
    supervisor_id: Option<i64>,
}

impl Application {
    /// 连接数据库并跑迁移后组装服务图
    pub async fn new(
        config: AppConfig,
        config_path: Option<String>,
        registry: HandlerRegistry,
        supervisor_id: Option<i64>,
    ) -> Result<Self> {
        let pool = connect(&config.database).await?;
        run_migrations(&pool).await?;
        info!("数据库就绪: {}", config.database.url);

        Ok(Self::with_repositories(
            config,
            config_path,
            Repositories::postgres(&pool),
            registry,
            supervisor_id,
        ))
    }

    /// 用现成的仓储组装（嵌入式与测试入口）
    pub fn with_repositories(
        config: AppConfig,
        config_path: Option<String>,
        repos: Repositories,
        registry: HandlerRegistry,
        supervisor_id: Option<i64>,
    ) -> Self {
        let concurrency = Arc::new(ConcurrencyController::new(
            Arc::clone(&repos.semaphores),
            Arc::clone(&repos.executions),
        ));
        let queue = Arc::new(QueueService::new(
            Arc::clone(&repos.jobs),
            Arc::clone(&concurrency),
        ));
        Self {
            config,
            config_path,
            repos,
            concurrency,
            queue,
            registry: Arc::new(registry),
            supervisor_id,
        }
    }

    /// 入队门面，嵌入方用它提交作业
    pub fn queue(&self) -> Arc<QueueService> {
        Arc::clone(&self.queue)
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.config.supervisor.heartbeat_interval_seconds)
    }

    pub fn build_worker(&self, supervisor_id: Option<i64>) -> Result<Arc<WorkerService>> {
        let mut worker = WorkerService::new(
            self.config.worker.clone(),
            self.config.polling.clone(),
            Arc::clone(&self.repos.jobs),
            Arc::clone(&self.repos.executions),
            Arc::clone(&self.repos.queues),
            Arc::clone(&self.repos.processes),
            Arc::clone(&self.concurrency),
            Arc::clone(&self.registry),
            self.heartbeat_interval(),
        )?;
        if let Some(id) = supervisor_id {
            worker = worker.supervised_by(id);
        }
        Ok(Arc::new(worker))
    }

    pub fn build_dispatcher(&self, supervisor_id: Option<i64>) -> DispatcherService {
        let mut dispatcher = DispatcherService::new(
            self.config.dispatcher.clone(),
            Arc::clone(&self.repos.jobs),
            Arc::clone(&self.repos.executions),
            Arc::clone(&self.repos.queues),
            Arc::clone(&self.repos.processes),
            Arc::clone(&self.concurrency),
            self.heartbeat_interval(),
        );
        if let Some(id) = supervisor_id {
            dispatcher = dispatcher.supervised_by(id);
        }
        dispatcher
    }

    pub fn build_scheduler(&self, supervisor_id: Option<i64>) -> Arc<RecurringScheduler> {
        let mut scheduler = RecurringScheduler::new(
            Arc::clone(&self.repos.recurring),
            Arc::clone(&self.queue),
            Arc::clone(&self.repos.processes),
            self.heartbeat_interval(),
        );
        if let Some(id) = supervisor_id {
            scheduler = scheduler.supervised_by(id);
        }
        Arc::new(scheduler)
    }

    pub fn build_supervisor(self: &Arc<Self>) -> Supervisor {
        Supervisor::new(
            self.config.supervisor.clone(),
            self.config_path.clone(),
            Arc::clone(&self.repos.processes),
            Arc::clone(&self.repos.executions),
            Arc::new(ServiceFactory {
                app: Arc::clone(self),
            }),
        )
    }

    async fn run_child(
        self: Arc<Self>,
        kind: ProcessKind,
        supervisor_id: Option<i64>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        match kind {
            ProcessKind::Worker => self.build_worker(supervisor_id)?.run(shutdown).await,
            ProcessKind::Dispatcher => {
                self.build_dispatcher(supervisor_id).run(shutdown).await
            }
            ProcessKind::Scheduler => {
                let configs = self.config.recurring.clone();
                self.build_scheduler(supervisor_id)
                    .run(&configs, shutdown)
                    .await
            }
            ProcessKind::Supervisor => Err(QueueError::Internal(
                "supervisor 不能作为自身的子进程".to_string(),
            )),
        }
    }

    /// 嵌入式入口：无监管进程，直接在本进程内运行某个角色
    pub async fn run_embedded(
        self: Arc<Self>,
        kind: ProcessKind,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        self.run_child(kind, None, shutdown).await
    }

    /// 按模式运行到关闭信号为止
    pub async fn run(
        self: Arc<Self>,
        mode: AppMode,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        match mode {
            AppMode::Supervisor => self.build_supervisor().run().await,
            AppMode::Worker => {
                let supervisor_id = self.supervisor_id;
                self.run_child(ProcessKind::Worker, supervisor_id, shutdown).await
            }
            AppMode::Dispatcher => {
                let supervisor_id = self.supervisor_id;
                self.run_child(ProcessKind::Dispatcher, supervisor_id, shutdown).await
            }
            AppMode::Scheduler => {
                let supervisor_id = self.supervisor_id;
                self.run_child(ProcessKind::Scheduler, supervisor_id, shutdown).await
            }
        }
    }
}

/// supervisor async 模式下的子服务工厂
struct ServiceFactory {
    app: Arc<Application>,
}

impl ChildFactory for ServiceFactory {
    fn spawn(
        &self,
        spec: &ChildSpec,
        supervisor_id: i64,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<Result<()>> {
        let app = Arc::clone(&self.app);
        let kind = spec.kind;
        tokio::spawn(async move {
            app.run_child(kind, Some(supervisor_id), shutdown).await
        })
    }
}
