//! 子进程抽象
//!
//! fork 模式重新执行当前二进制并传入角色参数，子进程拥有独立的
//! 地址空间与数据库连接池；async 模式由嵌入方提供的工厂在本进程
//! 内起任务。两种形态在监管循环里走同一套收割与重启逻辑。

use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use conveyor_core::errors::{QueueError, Result};
use conveyor_core::models::ProcessKind;

/// 一个受监管的子进程槽位定义
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub kind: ProcessKind,
    /// 同角色多实例时的序号
    pub index: usize,
}

impl ChildSpec {
    pub fn new(kind: ProcessKind, index: usize) -> Self {
        Self { kind, index }
    }

    pub fn describe(&self) -> String {
        format!("{}#{}", self.kind, self.index)
    }
}

/// async 模式的子服务工厂，由嵌入方在组装阶段实现
pub trait ChildFactory: Send + Sync {
    fn spawn(
        &self,
        spec: &ChildSpec,
        supervisor_id: i64,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<Result<()>>;
}

/// 受监管子进程的运行时句柄
pub enum ChildHandle {
    Forked(Child),
    Async(JoinHandle<Result<()>>),
}

impl ChildHandle {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ChildHandle::Forked(child) => child.id(),
            ChildHandle::Async(_) => None,
        }
    }

    /// 非阻塞探测退出；返回 Some(描述) 表示已退出
    pub fn try_reap(&mut self) -> Option<ExitReport> {
        match self {
            ChildHandle::Forked(child) => match child.try_wait() {
                Ok(Some(status)) => Some(ExitReport {
                    clean: status.success(),
                    status: status.to_string(),
                }),
                Ok(None) => None,
                Err(e) => {
                    warn!("收割子进程失败: {e}");
                    Some(ExitReport {
                        clean: false,
                        status: format!("wait failed: {e}"),
                    })
                }
            },
            ChildHandle::Async(handle) => {
                if !handle.is_finished() {
                    return None;
                }
                Some(ExitReport {
                    clean: true,
                    status: "task finished".to_string(),
                })
            }
        }
    }

    /// 发送 POSIX 信号（仅 fork 模式有接收方）
    pub fn signal(&self, sig: i32) {
        if let ChildHandle::Forked(child) = self {
            if let Some(pid) = child.id() {
                debug!("向子进程 {pid} 发送信号 {sig}");
                unsafe {
                    libc::kill(pid as i32, sig);
                }
            }
        }
    }

    /// 立即终止：fork 发 SIGQUIT，async 直接取消任务
    pub fn force_stop(&mut self) {
        match self {
            ChildHandle::Forked(_) => self.signal(libc::SIGQUIT),
            ChildHandle::Async(handle) => handle.abort(),
        }
    }
}

/// 子进程退出情况
#[derive(Debug)]
pub struct ExitReport {
    /// 退出码为 0（或 async 任务自行结束）
    pub clean: bool,
    pub status: String,
}

/// fork 模式：重新执行当前二进制，角色与监管关系经命令行传入
pub fn fork_child(
    spec: &ChildSpec,
    supervisor_id: i64,
    config_path: Option<&str>,
) -> Result<Child> {
    let exe = std::env::current_exe()
        .map_err(|e| QueueError::Internal(format!("无法定位当前可执行文件: {e}")))?;

    let mut command = Command::new(exe);
    command
        .arg("--mode")
        .arg(spec.kind.as_str())
        .arg("--supervisor-id")
        .arg(supervisor_id.to_string());
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }

    command
        .spawn()
        .map_err(|e| QueueError::Internal(format!("拉起子进程 {} 失败: {e}", spec.describe())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_spec_describe() {
        let spec = ChildSpec::new(ProcessKind::Worker, 2);
        assert_eq!(spec.describe(), "worker#2");
    }

    #[tokio::test]
    async fn test_async_handle_reaps_after_finish() {
        let handle: JoinHandle<Result<()>> = tokio::spawn(async { Ok(()) });
        let mut child = ChildHandle::Async(handle);

        // 等任务真正结束
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let report = child.try_reap().expect("task should be finished");
        assert!(report.clean);
    }

    #[tokio::test]
    async fn test_async_handle_running_is_not_reaped() {
        let handle: JoinHandle<Result<()>> = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(())
        });
        let mut child = ChildHandle::Async(handle);
        assert!(child.try_reap().is_none());

        child.force_stop();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(child.try_reap().is_some());
    }
}
