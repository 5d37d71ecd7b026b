pub mod concurrency;
pub mod queue_service;

pub use concurrency::ConcurrencyController;
pub use queue_service::QueueService;
