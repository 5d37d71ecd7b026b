//! Worker
//!
//! 以认领协议从就绪队列取作业，在本地执行池内并发执行，
//! 完成后推进状态机并归还并发槽位。轮询节奏由自适应
//! 控制器根据命中率调节。

pub mod service;

pub use service::WorkerService;
