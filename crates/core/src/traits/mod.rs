pub mod handler;
pub mod repository;

pub use handler::{HandlerRegistry, JobContext, JobHandler};
pub use repository::{
    DueExecution, ExecutionRepository, JobRepository, ProcessRepository, QueueRepository,
    RecurringRepository, SemaphoreRepository,
};
