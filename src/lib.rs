//! 数据库支撑的作业队列引擎
//!
//! 库入口：嵌入方注册处理器并通过 [`embedded::Engine`] 在自己的
//! 进程内运行引擎；独立部署则使用 `conveyor` 二进制。

pub mod app;
pub mod embedded;

pub use conveyor_core::config::AppConfig;
pub use conveyor_core::models::{ConcurrencyPolicy, Job, NewJob, OnConflict};
pub use conveyor_core::services::QueueService;
pub use conveyor_core::traits::{HandlerRegistry, JobContext, JobHandler};

pub use app::{AppMode, Application, Repositories};
pub use embedded::Engine;
