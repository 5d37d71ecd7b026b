//! 数据仓储层接口定义
//!
//! 此模块定义了队列引擎持久化层的核心抽象接口：
//! - 作业仓储 (JobRepository) - 作业创建与生命周期终态
//! - 执行仓储 (ExecutionRepository) - 认领协议与执行行的状态迁移
//! - 信号量仓储 (SemaphoreRepository) - 按键并发控制的原子槽位操作
//! - 进程仓储 (ProcessRepository) - 进程注册、心跳与清理
//! - 周期任务仓储 (RecurringRepository) - 幂等触发账本
//! - 队列仓储 (QueueRepository) - 队列名枚举与暂停状态
//!
//! 所有操作都是异步的，返回统一的 `Result<T>`；每个方法都是一个
//! 原子的存储操作，跨进程的正确性完全依赖存储层的行锁、
//! 唯一约束与条件更新，不依赖任何进程内协调。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::models::{
    ClaimedExecution, ClaimedJob, Disposition, ExecutionError, ExecutionState, FailedExecution,
    Job, NewJob, Process, ProcessRegistration, RecurringTask, Semaphore,
};

/// 作业仓储接口
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 原子创建作业及其初始执行行（Finished 落位不产生执行行）
    async fn create(&self, job: &NewJob, disposition: Disposition) -> Result<Job>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Job>>;

    /// 成功完成：删除认领行并写入 finished_at
    async fn finish(&self, job_id: i64) -> Result<()>;

    /// 执行失败：删除认领行并写入失败记录
    async fn fail(&self, job_id: i64, error: &ExecutionError) -> Result<()>;

    /// 重试失败作业：删除失败记录，重新进入 Ready
    async fn retry(&self, job_id: i64) -> Result<()>;

    /// 放弃失败作业：删除失败记录并标记完成
    async fn discard_failed(&self, job_id: i64) -> Result<()>;

    /// 当前执行状态（测试与运维查询用）
    async fn execution_state(&self, job_id: i64) -> Result<Option<ExecutionState>>;

    async fn failed_execution(&self, job_id: i64) -> Result<Option<FailedExecution>>;
}

/// 待晋升的定时执行行视图
#[derive(Debug, Clone)]
pub struct DueExecution {
    pub job_id: i64,
    pub queue_name: String,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
}

/// 执行仓储接口：认领协议与执行行状态迁移
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// 认领协议核心
    ///
    /// 按队列顺序处理，跨队列累计消耗 max_count；每个队列在一个事务内：
    /// 以 (priority, job_id) 升序 SKIP LOCKED 选取就绪行，插入带
    /// process_id 的认领行，删除消耗掉的就绪行。并发调用者之间
    /// 认领结果互不重叠。
    async fn claim(
        &self,
        queue_names: &[String],
        max_count: i64,
        process_id: i64,
    ) -> Result<Vec<ClaimedJob>>;

    async fn claimed_by_process(&self, process_id: i64) -> Result<Vec<ClaimedExecution>>;

    /// 孤儿回收：把某进程认领中的全部执行置为失败（可重试）
    async fn fail_claimed_by_process(
        &self,
        process_id: i64,
        error: &ExecutionError,
    ) -> Result<u64>;

    /// 到期的定时执行，按 (scheduled_at, priority, job_id) 排序取一批
    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        excluded_queues: &[String],
        limit: i64,
    ) -> Result<Vec<DueExecution>>;

    /// 晋升一个定时作业：原子删除 scheduled 行并插入 Ready/Blocked 行。
    /// 行已不存在（被其他 dispatcher 抢先）时返回 false。
    async fn promote_scheduled(&self, job_id: i64, disposition: Disposition) -> Result<bool>;

    /// 释放一个等待者：SKIP LOCKED 锁定该键优先级最高的阻塞行，
    /// 确认仍有可用槽位（条件扣减成功）后迁移为 Ready。
    async fn release_one_blocked(&self, concurrency_key: &str) -> Result<bool>;

    /// 批量维护扫描：存在等待者且（槽位可用或等待已过期）的并发键
    async fn releasable_keys(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>>;
}

/// 信号量仓储接口：全部为条件更新，绝不读-改-写
#[async_trait]
pub trait SemaphoreRepository: Send + Sync {
    /// 获取一个槽位。行不存在则以 value = limit - 1 创建
    /// （并发创建触发唯一冲突时退回扣减路径）；
    /// 行存在则仅在 value > 0 时扣减。
    async fn try_acquire(&self, key: &str, limit: i32, duration_seconds: i64) -> Result<bool>;

    /// 归还一个槽位：value < limit 时加一并顺延到期时间
    async fn release(&self, key: &str, limit: i32, duration_seconds: i64) -> Result<bool>;

    /// 删除已到期的信号量行，回收崩溃进程遗留的槽位
    async fn expire(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn get(&self, key: &str) -> Result<Option<Semaphore>>;
}

/// 进程仓储接口
#[async_trait]
pub trait ProcessRepository: Send + Sync {
    async fn register(&self, registration: &ProcessRegistration) -> Result<Process>;

    /// 更新心跳时间戳；进程行已被清理时返回 false
    async fn heartbeat(&self, process_id: i64, now: DateTime<Utc>) -> Result<bool>;

    async fn deregister(&self, process_id: i64) -> Result<()>;

    /// 清理心跳早于 cutoff 的进程行，返回被清理的进程
    async fn prune_dead(&self, cutoff: DateTime<Utc>) -> Result<Vec<Process>>;

    async fn get_by_id(&self, process_id: i64) -> Result<Option<Process>>;

    /// 某个 supervisor 名下的全部进程行（fork 模式按 pid 对回子进程）
    async fn supervisees(&self, supervisor_id: i64) -> Result<Vec<Process>>;
}

/// 周期任务仓储接口
#[async_trait]
pub trait RecurringRepository: Send + Sync {
    async fn upsert_task(&self, task: &RecurringTask) -> Result<RecurringTask>;

    async fn list_tasks(&self) -> Result<Vec<RecurringTask>>;

    /// 删除不在给定键集合中的任务（配置对账）
    async fn delete_tasks_except(&self, keys: &[String]) -> Result<u64>;

    /// 认领一个触发刻度：插入 (task_key, run_at) 账本行。
    /// 唯一冲突表示其他 scheduler 已触发该刻度，返回 false。
    async fn record_fire(&self, task_key: &str, run_at: DateTime<Utc>) -> Result<bool>;

    /// 把触发产生的作业回填到账本行
    async fn attach_job(&self, task_key: &str, run_at: DateTime<Utc>, job_id: i64) -> Result<()>;
}

/// 队列仓储接口
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// 当前存在就绪作业的队列名（通配符解析用）
    async fn queue_names(&self) -> Result<Vec<String>>;

    async fn paused_queues(&self) -> Result<Vec<String>>;

    async fn pause(&self, queue_name: &str) -> Result<()>;

    async fn resume(&self, queue_name: &str) -> Result<()>;
}
