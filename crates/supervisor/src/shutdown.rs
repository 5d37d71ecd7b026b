//! 关闭状态机
//!
//! Running → GracefulShutdown →（超时）→ ImmediateShutdown → Terminated。
//! 已进入关闭流程后重复到达的信号一律为空操作，关闭只会单向推进。

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM / SIGINT：优雅关闭
    Term,
    /// SIGQUIT：立即关闭
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    /// 已通知子进程停止，等待其退出
    GracefulShutdown,
    /// 强制终止子进程
    ImmediateShutdown,
    Terminated,
}

impl SupervisorState {
    pub fn on_signal(self, signal: ShutdownSignal) -> Self {
        match (self, signal) {
            (SupervisorState::Running, ShutdownSignal::Term) => SupervisorState::GracefulShutdown,
            (SupervisorState::Running, ShutdownSignal::Quit) => SupervisorState::ImmediateShutdown,
            (state, _) => state,
        }
    }

    /// 优雅关闭等待超时
    pub fn on_timeout(self) -> Self {
        match self {
            SupervisorState::GracefulShutdown => SupervisorState::ImmediateShutdown,
            state => state,
        }
    }

    /// 全部子进程已退出
    pub fn on_all_children_exited(self) -> Self {
        match self {
            SupervisorState::GracefulShutdown | SupervisorState::ImmediateShutdown => {
                SupervisorState::Terminated
            }
            state => state,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self,
            SupervisorState::GracefulShutdown | SupervisorState::ImmediateShutdown
        )
    }
}
