//! Dispatcher 与 scheduler
//!
//! dispatcher 负责把到期的定时作业经并发准入晋升为就绪，
//! 并周期性执行并发维护（批量解阻塞、信号量过期回收）。
//! scheduler 负责按 CRON 表达式触发周期任务，多实例下以
//! 触发账本的唯一约束保证每个刻度只入队一次。

pub mod cron_schedule;
pub mod recurring;
pub mod service;

pub use cron_schedule::CronSchedule;
pub use recurring::{FireOutcome, RecurringScheduler};
pub use service::DispatcherService;
