//! 监管主循环
//!
//! 注册自身进程行后按配置拉起子进程，之后在四件事之间循环：
//! 心跳与失联进程清理、子进程收割与重启、POSIX 信号处理、
//! 优雅关闭的超时升级。子进程崩溃时其在途作业被转为失败记录，
//! 等待人工重试，随后补位一个新实例。

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use conveyor_core::config::{SupervisionMode, SupervisorConfig};
use conveyor_core::errors::{QueueError, Result};
use conveyor_core::models::{ExecutionError, ProcessKind, ProcessRegistration};
use conveyor_core::traits::{ExecutionRepository, ProcessRepository};

use crate::children::{fork_child, ChildFactory, ChildHandle, ChildSpec, ExitReport};
use crate::shutdown::{ShutdownSignal, SupervisorState};

pub struct Supervisor {
    config: SupervisorConfig,
    /// fork 模式下透传给子进程的配置文件路径
    config_path: Option<String>,
    processes: Arc<dyn ProcessRepository>,
    executions: Arc<dyn ExecutionRepository>,
    factory: Arc<dyn ChildFactory>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        config_path: Option<String>,
        processes: Arc<dyn ProcessRepository>,
        executions: Arc<dyn ExecutionRepository>,
        factory: Arc<dyn ChildFactory>,
    ) -> Self {
        Self {
            config,
            config_path,
            processes,
            executions,
            factory,
        }
    }

    fn child_specs(&self) -> Vec<ChildSpec> {
        let mut specs = Vec::new();
        for index in 0..self.config.worker_count {
            specs.push(ChildSpec::new(ProcessKind::Worker, index));
        }
        for index in 0..self.config.dispatcher_count {
            specs.push(ChildSpec::new(ProcessKind::Dispatcher, index));
        }
        for index in 0..self.config.scheduler_count {
            specs.push(ChildSpec::new(ProcessKind::Scheduler, index));
        }
        specs
    }

    fn spawn_child(
        &self,
        spec: &ChildSpec,
        supervisor_id: i64,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<ChildHandle> {
        match self.config.mode {
            SupervisionMode::Fork => {
                let child = fork_child(spec, supervisor_id, self.config_path.as_deref())?;
                info!(
                    "子进程 {} 已拉起 (pid {:?})",
                    spec.describe(),
                    child.id()
                );
                Ok(ChildHandle::Forked(child))
            }
            SupervisionMode::Async => {
                let handle = self.factory.spawn(spec, supervisor_id, shutdown.subscribe());
                info!("子任务 {} 已拉起", spec.describe());
                Ok(ChildHandle::Async(handle))
            }
        }
    }

    /// 清理心跳失联的进程行，把它们的在途作业转为失败记录。
    /// 返回清理的进程数；重复调用是幂等的。
    pub async fn prune_and_recover(&self) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.prune_after_seconds);
        let pruned = self.processes.prune_dead(cutoff).await?;
        let mut recovered = 0u64;
        for process in &pruned {
            let error = ExecutionError::process_missing(&process.name);
            recovered += self
                .executions
                .fail_claimed_by_process(process.id, &error)
                .await?;
        }
        if !pruned.is_empty() {
            info!(
                "清理了 {} 个失联进程，回收 {} 个在途作业",
                pruned.len(),
                recovered
            );
        }
        Ok(pruned.len())
    }

    /// fork 子进程崩溃后的善后：按 pid 找到其进程行，
    /// 回收在途作业并删除进程行
    async fn recover_forked(&self, supervisor_id: i64, pid: u32, status: &str) -> Result<()> {
        let supervisees = self.processes.supervisees(supervisor_id).await?;
        let Some(row) = supervisees.into_iter().find(|p| p.pid == pid as i32) else {
            // 子进程还没来得及注册就崩溃了，没有可回收的状态
            return Ok(());
        };

        let error = ExecutionError::process_exited(&row.name, status);
        let failed = self
            .executions
            .fail_claimed_by_process(row.id, &error)
            .await?;
        if failed > 0 {
            warn!("回收了进程 {} 的 {} 个在途作业", row.name, failed);
        }
        self.processes.deregister(row.id).await?;
        Ok(())
    }

    async fn reap_children(
        &self,
        children: &mut Vec<(ChildSpec, ChildHandle)>,
        supervisor_id: i64,
        shutting_down: bool,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<()> {
        let mut survivors = Vec::with_capacity(children.len());
        for (spec, mut handle) in children.drain(..) {
            let pid = handle.pid();
            let Some(report) = handle.try_reap() else {
                survivors.push((spec, handle));
                continue;
            };

            // async 任务退出后补全真实的退出原因
            let report = match handle {
                ChildHandle::Async(join_handle) => async_exit_report(join_handle.await),
                ChildHandle::Forked(_) => report,
            };

            if shutting_down {
                info!("子进程 {} 已退出 ({})", spec.describe(), report.status);
                continue;
            }

            if report.clean {
                warn!("子进程 {} 意外退出，重新拉起", spec.describe());
            } else {
                error!(
                    "子进程 {} 崩溃 ({})，回收其认领并重新拉起",
                    spec.describe(),
                    report.status
                );
                if let Some(pid) = pid {
                    self.recover_forked(supervisor_id, pid, &report.status).await?;
                }
                // async 任务崩溃时进程行心跳随之停摆，由清理路径兜底回收
            }

            let replacement = self.spawn_child(&spec, supervisor_id, shutdown)?;
            survivors.push((spec, replacement));
        }
        *children = survivors;
        Ok(())
    }

    fn apply_signal(
        &self,
        state: SupervisorState,
        sig: ShutdownSignal,
        children: &mut [(ChildSpec, ChildHandle)],
        shutdown: &broadcast::Sender<()>,
        deadline: &mut Option<tokio::time::Instant>,
    ) -> SupervisorState {
        let next = state.on_signal(sig);
        if next == state {
            debug!("已在关闭流程中，忽略重复信号");
            return state;
        }

        match next {
            SupervisorState::GracefulShutdown => {
                info!(
                    "开始优雅关闭，等待子进程退出（上限 {} 秒）",
                    self.config.shutdown_timeout_seconds
                );
                let _ = shutdown.send(());
                for (_, handle) in children.iter() {
                    handle.signal(libc::SIGTERM);
                }
                *deadline = Some(
                    tokio::time::Instant::now()
                        + Duration::from_secs(self.config.shutdown_timeout_seconds),
                );
            }
            SupervisorState::ImmediateShutdown => {
                warn!("立即关闭，强制终止子进程");
                let _ = shutdown.send(());
                for (_, handle) in children.iter_mut() {
                    handle.force_stop();
                }
            }
            _ => {}
        }
        next
    }

    /// 监管主循环，直到所有子进程退出
    pub async fn run(&self) -> Result<()> {
        let registration = ProcessRegistration::generate(ProcessKind::Supervisor);
        let mut process = self.processes.register(&registration).await?;
        info!("supervisor {} 启动 ({:?} 模式)", process.name, self.config.mode);

        let (shutdown_tx, _) = broadcast::channel(4);
        let mut children: Vec<(ChildSpec, ChildHandle)> = Vec::new();
        for spec in self.child_specs() {
            let handle = self.spawn_child(&spec, process.id, &shutdown_tx)?;
            children.push((spec, handle));
        }

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| QueueError::Internal(format!("安装 SIGTERM 处理失败: {e}")))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| QueueError::Internal(format!("安装 SIGINT 处理失败: {e}")))?;
        let mut sigquit = signal(SignalKind::quit())
            .map_err(|e| QueueError::Internal(format!("安装 SIGQUIT 处理失败: {e}")))?;

        let mut heartbeat = tokio::time::interval(Duration::from_secs(
            self.config.heartbeat_interval_seconds,
        ));
        let mut reap = tokio::time::interval(Duration::from_millis(500));
        let mut state = SupervisorState::Running;
        let mut deadline: Option<tokio::time::Instant> = None;

        loop {
            let deadline_at = deadline;
            let escalate = async move {
                match deadline_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = heartbeat.tick() => {
                    if !self.processes.heartbeat(process.id, Utc::now()).await? {
                        warn!("supervisor 进程行已被清理，重新注册");
                        process = self.processes.register(&registration).await?;
                    }
                    if let Err(e) = self.prune_and_recover().await {
                        error!("清理失联进程失败: {e}");
                    }
                }
                _ = reap.tick() => {
                    self.reap_children(&mut children, process.id, state.is_shutting_down(), &shutdown_tx).await?;
                    if state.is_shutting_down() && children.is_empty() {
                        state = state.on_all_children_exited();
                        break;
                    }
                }
                _ = sigterm.recv() => {
                    state = self.apply_signal(state, ShutdownSignal::Term, &mut children, &shutdown_tx, &mut deadline);
                }
                _ = sigint.recv() => {
                    state = self.apply_signal(state, ShutdownSignal::Term, &mut children, &shutdown_tx, &mut deadline);
                }
                _ = sigquit.recv() => {
                    state = self.apply_signal(state, ShutdownSignal::Quit, &mut children, &shutdown_tx, &mut deadline);
                }
                _ = escalate => {
                    warn!("优雅关闭超时，升级为立即关闭");
                    state = state.on_timeout();
                    deadline = None;
                    for (_, handle) in children.iter_mut() {
                        handle.force_stop();
                    }
                }
            }
        }

        debug_assert_eq!(state, SupervisorState::Terminated);
        self.processes.deregister(process.id).await?;
        info!("supervisor {} 已终止", process.name);
        Ok(())
    }
}

fn async_exit_report(
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> ExitReport {
    match joined {
        Ok(Ok(())) => ExitReport {
            clean: true,
            status: "任务正常结束".to_string(),
        },
        Ok(Err(e)) => ExitReport {
            clean: false,
            status: format!("任务出错: {e}"),
        },
        Err(join_error) if join_error.is_cancelled() => ExitReport {
            clean: true,
            status: "任务已取消".to_string(),
        },
        Err(join_error) => ExitReport {
            clean: false,
            status: format!("任务 panic: {join_error}"),
        },
    }
}
