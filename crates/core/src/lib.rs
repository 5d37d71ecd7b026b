pub mod config;
pub mod errors;
pub mod models;
pub mod polling;
pub mod queue_selector;
pub mod services;
pub mod traits;

pub use config::AppConfig;
pub use errors::{ErrorCallback, QueueError, Result};
pub use models::{
    Admission, BlockedExecution, ClaimedExecution, ClaimedJob, ConcurrencyPolicy, Disposition,
    ExecutionError, ExecutionState, FailedExecution, Job, NewJob, OnConflict, Process,
    ProcessKind, ProcessRegistration, ReadyExecution, RecurringExecution, RecurringTask,
    ScheduledExecution, Semaphore,
};
pub use polling::{AdaptivePoller, PollOutcome, PollerConfig};
pub use queue_selector::QueueSelector;
pub use services::{ConcurrencyController, QueueService};
pub use traits::{
    ExecutionRepository, JobContext, JobHandler, JobRepository, ProcessRepository,
    QueueRepository, RecurringRepository, HandlerRegistry, SemaphoreRepository,
};
