pub mod execution;
pub mod job;
pub mod process;
pub mod recurring;
pub mod semaphore;

pub use execution::{
    BlockedExecution, ClaimedExecution, ClaimedJob, ExecutionError, ExecutionState,
    FailedExecution, ReadyExecution, ScheduledExecution,
};
pub use job::{Admission, ConcurrencyPolicy, Disposition, Job, NewJob, OnConflict};
pub use process::{Process, ProcessKind, ProcessRegistration};
pub use recurring::{RecurringExecution, RecurringTask};
pub use semaphore::Semaphore;
