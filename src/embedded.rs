//! 嵌入式引擎
//!
//! 应用进程内运行完整的队列引擎：worker、dispatcher、scheduler
//! 作为 tokio 任务启动，入队门面直接暴露给嵌入方。适合单进程
//! 部署与集成测试；多进程部署用 supervisor 的 fork 模式。

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

use conveyor_core::config::AppConfig;
use conveyor_core::errors::Result;
use conveyor_core::models::ProcessKind;
use conveyor_core::services::QueueService;
use conveyor_core::traits::HandlerRegistry;

use crate::app::Application;

/// 进程内引擎句柄
pub struct Engine {
    app: Arc<Application>,
    shutdown: broadcast::Sender<()>,
    services: JoinSet<Result<()>>,
}

impl Engine {
    /// 连接数据库并启动全部服务
    pub async fn start(config: AppConfig, registry: HandlerRegistry) -> Result<Engine> {
        let app = Arc::new(Application::new(config, None, registry, None).await?);
        Ok(Self::launch(app))
    }

    fn launch(app: Arc<Application>) -> Engine {
        let (shutdown, _) = broadcast::channel(4);
        let mut services = JoinSet::new();

        let roles = [
            (ProcessKind::Worker, app.config.supervisor.worker_count),
            (ProcessKind::Dispatcher, app.config.supervisor.dispatcher_count),
            (ProcessKind::Scheduler, app.config.supervisor.scheduler_count),
        ];
        for (kind, count) in roles {
            for _ in 0..count {
                let app = Arc::clone(&app);
                let rx = shutdown.subscribe();
                services.spawn(async move { app.run_embedded(kind, rx).await });
            }
        }

        info!("嵌入式引擎已启动");
        Engine {
            app,
            shutdown,
            services,
        }
    }

    /// 入队门面
    pub fn queue(&self) -> Arc<QueueService> {
        self.app.queue()
    }

    /// 广播关闭并等待所有服务退出
    pub async fn stop(mut self) -> Result<()> {
        info!("嵌入式引擎开始关闭");
        let _ = self.shutdown.send(());
        while let Some(joined) = self.services.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("服务退出时出错: {e}"),
                Err(e) => error!("服务任务异常结束: {e}"),
            }
        }
        info!("嵌入式引擎已关闭");
        Ok(())
    }
}
