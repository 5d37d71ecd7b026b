//! 进程监管
//!
//! supervisor 负责拉起并看护 worker / dispatcher / scheduler：
//! fork 模式下以独立 OS 进程运行（崩溃隔离），async 模式下以
//! 进程内任务运行。子进程崩溃即回收其认领并重新拉起；
//! TERM/INT 触发优雅关闭，超时或 QUIT 升级为立即关闭。

pub mod children;
pub mod shutdown;
pub mod supervisor;

pub use children::{ChildFactory, ChildSpec};
pub use shutdown::{ShutdownSignal, SupervisorState};
pub use supervisor::Supervisor;
