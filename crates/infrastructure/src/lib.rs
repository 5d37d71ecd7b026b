pub mod database;

pub use database::postgres::{
    PostgresExecutionRepository, PostgresJobRepository, PostgresProcessRepository,
    PostgresQueueRepository, PostgresRecurringRepository, PostgresSemaphoreRepository,
};
pub use database::{connect, run_migrations};
