//! 测试用内存存储
//!
//! 用一把互斥锁模拟存储层的原子操作语义，使服务层的
//! 状态机与并发控制逻辑可以脱离真实数据库做场景测试。
//! 单进程内互斥锁天然给出与行锁等价的认领互斥性。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use conveyor_core::errors::{QueueError, Result};
use conveyor_core::models::{
    BlockedExecution, ClaimedExecution, ClaimedJob, Disposition, ExecutionError, ExecutionState,
    FailedExecution, Job, NewJob, Process, ProcessRegistration, ReadyExecution, RecurringTask,
    ScheduledExecution, Semaphore,
};
use conveyor_core::traits::{
    DueExecution, ExecutionRepository, JobRepository, ProcessRepository, QueueRepository,
    RecurringRepository, SemaphoreRepository,
};

#[derive(Default)]
struct State {
    next_id: i64,
    jobs: HashMap<i64, Job>,
    // 执行表均以 job_id 为键，对应存储层的唯一索引
    ready: HashMap<i64, ReadyExecution>,
    claimed: HashMap<i64, ClaimedExecution>,
    scheduled: HashMap<i64, ScheduledExecution>,
    blocked: HashMap<i64, BlockedExecution>,
    failed: HashMap<i64, FailedExecution>,
    semaphores: HashMap<String, Semaphore>,
    processes: HashMap<i64, Process>,
    recurring_tasks: HashMap<String, RecurringTask>,
    recurring_fires: HashMap<(String, DateTime<Utc>), Option<i64>>,
    pauses: Vec<String>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// 内存存储，Clone 共享同一份状态；实现全部仓储接口
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().expect("in-memory store poisoned")
    }

    /// 测试断言辅助：各执行表的行数
    pub fn counts(&self) -> StoreCounts {
        let state = self.lock();
        StoreCounts {
            jobs: state.jobs.len(),
            ready: state.ready.len(),
            claimed: state.claimed.len(),
            scheduled: state.scheduled.len(),
            blocked: state.blocked.len(),
            failed: state.failed.len(),
        }
    }

    /// 测试辅助：直接读取信号量值
    pub fn semaphore_value(&self, key: &str) -> Option<i32> {
        self.lock().semaphores.get(key).map(|s| s.value)
    }

    /// 测试断言辅助：作业当前的执行状态
    pub fn state_of(&self, job_id: i64) -> Option<ExecutionState> {
        state_of_locked(&self.lock(), job_id)
    }

    /// 测试辅助：把进程心跳拨到指定时刻（模拟失联）
    pub fn set_heartbeat(&self, process_id: i64, at: DateTime<Utc>) {
        if let Some(process) = self.lock().processes.get_mut(&process_id) {
            process.last_heartbeat_at = at;
        }
    }
}

fn state_of_locked(state: &State, job_id: i64) -> Option<ExecutionState> {
    if !state.jobs.contains_key(&job_id) {
        return None;
    }
    if state.failed.contains_key(&job_id) {
        Some(ExecutionState::Finished { failed: true })
    } else if state.claimed.contains_key(&job_id) {
        Some(ExecutionState::Claimed)
    } else if state.ready.contains_key(&job_id) {
        Some(ExecutionState::Ready)
    } else if state.scheduled.contains_key(&job_id) {
        Some(ExecutionState::Scheduled)
    } else if state.blocked.contains_key(&job_id) {
        Some(ExecutionState::Blocked)
    } else if state.jobs[&job_id].finished_at.is_some() {
        Some(ExecutionState::Finished { failed: false })
    } else {
        None
    }
}

#[derive(Debug, PartialEq)]
pub struct StoreCounts {
    pub jobs: usize,
    pub ready: usize,
    pub claimed: usize,
    pub scheduled: usize,
    pub blocked: usize,
    pub failed: usize,
}

fn acquire_slot_locked(state: &mut State, key: &str, limit: i32, duration_seconds: i64) -> bool {
    let expires_at = Utc::now() + Duration::seconds(duration_seconds);
    match state.semaphores.get_mut(key) {
        None => {
            let id = {
                state.next_id += 1;
                state.next_id
            };
            let now = Utc::now();
            state.semaphores.insert(
                key.to_string(),
                Semaphore {
                    id,
                    key: key.to_string(),
                    value: limit - 1,
                    expires_at,
                    created_at: now,
                    updated_at: now,
                },
            );
            true
        }
        Some(semaphore) if semaphore.value > 0 => {
            semaphore.value -= 1;
            semaphore.expires_at = expires_at;
            semaphore.updated_at = Utc::now();
            true
        }
        Some(_) => false,
    }
}

#[async_trait]
impl JobRepository for InMemoryStore {
    async fn create(&self, job: &NewJob, disposition: Disposition) -> Result<Job> {
        let mut state = self.lock();
        let id = state.next_id();
        let now = Utc::now();
        let mut created = Job {
            id,
            queue_name: job.queue_name.clone(),
            class_name: job.class_name.clone(),
            arguments: job.arguments.clone(),
            priority: job.priority,
            scheduled_at: job.scheduled_at.unwrap_or(now),
            finished_at: None,
            concurrency: job.concurrency.clone(),
            created_at: now,
            updated_at: now,
        };

        match disposition {
            Disposition::Ready => {
                let exec_id = state.next_id();
                state.ready.insert(
                    id,
                    ReadyExecution {
                        id: exec_id,
                        job_id: id,
                        queue_name: created.queue_name.clone(),
                        priority: created.priority,
                        created_at: now,
                    },
                );
            }
            Disposition::Scheduled(at) => {
                let exec_id = state.next_id();
                state.scheduled.insert(
                    id,
                    ScheduledExecution {
                        id: exec_id,
                        job_id: id,
                        queue_name: created.queue_name.clone(),
                        priority: created.priority,
                        scheduled_at: at,
                        created_at: now,
                    },
                );
            }
            Disposition::Blocked { key, expires_at } => {
                let exec_id = state.next_id();
                state.blocked.insert(
                    id,
                    BlockedExecution {
                        id: exec_id,
                        job_id: id,
                        queue_name: created.queue_name.clone(),
                        priority: created.priority,
                        concurrency_key: key,
                        expires_at,
                        created_at: now,
                    },
                );
            }
            Disposition::Finished => {
                created.finished_at = Some(now);
            }
        }

        state.jobs.insert(id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn finish(&self, job_id: i64) -> Result<()> {
        let mut state = self.lock();
        state.claimed.remove(&job_id);
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound { id: job_id })?;
        job.finished_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(&self, job_id: i64, error: &ExecutionError) -> Result<()> {
        let mut state = self.lock();
        state.claimed.remove(&job_id);
        let id = state.next_id();
        state.failed.entry(job_id).or_insert(FailedExecution {
            id,
            job_id,
            error_class: error.class.clone(),
            error_message: error.message.clone(),
            backtrace: error.backtrace.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn retry(&self, job_id: i64) -> Result<()> {
        let mut state = self.lock();
        if state.failed.remove(&job_id).is_none() {
            return Err(QueueError::JobNotFound { id: job_id });
        }
        let (queue_name, priority) = {
            let job = state
                .jobs
                .get(&job_id)
                .ok_or(QueueError::JobNotFound { id: job_id })?;
            (job.queue_name.clone(), job.priority)
        };
        let exec_id = state.next_id();
        state.ready.insert(
            job_id,
            ReadyExecution {
                id: exec_id,
                job_id,
                queue_name,
                priority,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn discard_failed(&self, job_id: i64) -> Result<()> {
        let mut state = self.lock();
        if state.failed.remove(&job_id).is_none() {
            return Err(QueueError::JobNotFound { id: job_id });
        }
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn execution_state(&self, job_id: i64) -> Result<Option<ExecutionState>> {
        Ok(state_of_locked(&self.lock(), job_id))
    }

    async fn failed_execution(&self, job_id: i64) -> Result<Option<FailedExecution>> {
        Ok(self.lock().failed.get(&job_id).cloned())
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryStore {
    async fn claim(
        &self,
        queue_names: &[String],
        max_count: i64,
        process_id: i64,
    ) -> Result<Vec<ClaimedJob>> {
        let mut state = self.lock();
        let mut claimed = Vec::new();

        for queue in queue_names {
            let remaining = max_count - claimed.len() as i64;
            if remaining <= 0 {
                break;
            }

            let mut candidates: Vec<(i32, i64)> = state
                .ready
                .values()
                .filter(|r| &r.queue_name == queue)
                .map(|r| (r.priority, r.job_id))
                .collect();
            candidates.sort();
            candidates.truncate(remaining as usize);

            for (_, job_id) in candidates {
                state.ready.remove(&job_id);
                let claim_id = state.next_id();
                state.claimed.insert(
                    job_id,
                    ClaimedExecution {
                        id: claim_id,
                        job_id,
                        process_id,
                        created_at: Utc::now(),
                    },
                );
                let job = state.jobs[&job_id].clone();
                claimed.push(ClaimedJob { claim_id, job });
            }
        }
        Ok(claimed)
    }

    async fn claimed_by_process(&self, process_id: i64) -> Result<Vec<ClaimedExecution>> {
        let state = self.lock();
        let mut executions: Vec<ClaimedExecution> = state
            .claimed
            .values()
            .filter(|c| c.process_id == process_id)
            .cloned()
            .collect();
        executions.sort_by_key(|c| c.id);
        Ok(executions)
    }

    async fn fail_claimed_by_process(
        &self,
        process_id: i64,
        error: &ExecutionError,
    ) -> Result<u64> {
        let mut state = self.lock();
        let orphaned: Vec<i64> = state
            .claimed
            .values()
            .filter(|c| c.process_id == process_id)
            .map(|c| c.job_id)
            .collect();
        for job_id in &orphaned {
            state.claimed.remove(job_id);
            let id = state.next_id();
            state.failed.entry(*job_id).or_insert(FailedExecution {
                id,
                job_id: *job_id,
                error_class: error.class.clone(),
                error_message: error.message.clone(),
                backtrace: error.backtrace.clone(),
                created_at: Utc::now(),
            });
        }
        Ok(orphaned.len() as u64)
    }

    async fn due_scheduled(
        &self,
        now: DateTime<Utc>,
        excluded_queues: &[String],
        limit: i64,
    ) -> Result<Vec<DueExecution>> {
        let state = self.lock();
        let mut due: Vec<DueExecution> = state
            .scheduled
            .values()
            .filter(|s| s.scheduled_at <= now && !excluded_queues.contains(&s.queue_name))
            .map(|s| DueExecution {
                job_id: s.job_id,
                queue_name: s.queue_name.clone(),
                priority: s.priority,
                scheduled_at: s.scheduled_at,
            })
            .collect();
        due.sort_by_key(|d| (d.scheduled_at, d.priority, d.job_id));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn promote_scheduled(&self, job_id: i64, disposition: Disposition) -> Result<bool> {
        let mut state = self.lock();
        let scheduled = match state.scheduled.remove(&job_id) {
            Some(s) => s,
            None => return Ok(false),
        };
        let exec_id = state.next_id();
        match disposition {
            Disposition::Ready => {
                state.ready.insert(
                    job_id,
                    ReadyExecution {
                        id: exec_id,
                        job_id,
                        queue_name: scheduled.queue_name,
                        priority: scheduled.priority,
                        created_at: Utc::now(),
                    },
                );
            }
            Disposition::Blocked { key, expires_at } => {
                state.blocked.insert(
                    job_id,
                    BlockedExecution {
                        id: exec_id,
                        job_id,
                        queue_name: scheduled.queue_name,
                        priority: scheduled.priority,
                        concurrency_key: key,
                        expires_at,
                        created_at: Utc::now(),
                    },
                );
            }
            Disposition::Finished => {
                if let Some(job) = state.jobs.get_mut(&job_id) {
                    job.finished_at = Some(Utc::now());
                }
            }
            Disposition::Scheduled(_) => {
                return Err(QueueError::Internal(
                    "晋升目标不能仍是 Scheduled".to_string(),
                ));
            }
        }
        Ok(true)
    }

    async fn release_one_blocked(&self, concurrency_key: &str) -> Result<bool> {
        let mut state = self.lock();
        let candidate = state
            .blocked
            .values()
            .filter(|b| b.concurrency_key == concurrency_key)
            .min_by_key(|b| (b.priority, b.job_id))
            .map(|b| b.job_id);
        let job_id = match candidate {
            Some(id) => id,
            None => return Ok(false),
        };

        let (limit, duration_seconds) = match state.jobs[&job_id].concurrency.clone() {
            Some(p) => (p.limit, p.duration_seconds),
            None => (0, 0),
        };
        if !acquire_slot_locked(&mut state, concurrency_key, limit, duration_seconds) {
            return Ok(false);
        }

        let blocked = state.blocked.remove(&job_id).expect("candidate vanished");
        let exec_id = state.next_id();
        state.ready.insert(
            job_id,
            ReadyExecution {
                id: exec_id,
                job_id,
                queue_name: blocked.queue_name,
                priority: blocked.priority,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn releasable_keys(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>> {
        let state = self.lock();
        let mut keys: Vec<String> = state
            .blocked
            .values()
            .filter(|b| {
                b.expires_at <= now
                    || state
                        .semaphores
                        .get(&b.concurrency_key)
                        .map(|s| s.value > 0)
                        .unwrap_or(true)
            })
            .map(|b| b.concurrency_key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys.truncate(limit as usize);
        Ok(keys)
    }
}

#[async_trait]
impl SemaphoreRepository for InMemoryStore {
    async fn try_acquire(&self, key: &str, limit: i32, duration_seconds: i64) -> Result<bool> {
        let mut state = self.lock();
        Ok(acquire_slot_locked(&mut state, key, limit, duration_seconds))
    }

    async fn release(&self, key: &str, limit: i32, duration_seconds: i64) -> Result<bool> {
        let mut state = self.lock();
        match state.semaphores.get_mut(key) {
            Some(semaphore) if semaphore.value < limit => {
                semaphore.value += 1;
                semaphore.expires_at = Utc::now() + Duration::seconds(duration_seconds);
                semaphore.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock();
        let before = state.semaphores.len();
        state.semaphores.retain(|_, s| s.expires_at > now);
        Ok((before - state.semaphores.len()) as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<Semaphore>> {
        Ok(self.lock().semaphores.get(key).cloned())
    }
}

#[async_trait]
impl ProcessRepository for InMemoryStore {
    async fn register(&self, registration: &ProcessRegistration) -> Result<Process> {
        let mut state = self.lock();
        let id = state.next_id();
        let process = Process {
            id,
            kind: registration.kind,
            name: registration.name.clone(),
            pid: registration.pid,
            hostname: registration.hostname.clone(),
            supervisor_id: registration.supervisor_id,
            last_heartbeat_at: Utc::now(),
            metadata: registration.metadata.clone(),
            created_at: Utc::now(),
        };
        state.processes.insert(id, process.clone());
        Ok(process)
    }

    async fn heartbeat(&self, process_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock();
        match state.processes.get_mut(&process_id) {
            Some(process) => {
                process.last_heartbeat_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deregister(&self, process_id: i64) -> Result<()> {
        self.lock().processes.remove(&process_id);
        Ok(())
    }

    async fn prune_dead(&self, cutoff: DateTime<Utc>) -> Result<Vec<Process>> {
        let mut state = self.lock();
        let dead: Vec<i64> = state
            .processes
            .values()
            .filter(|p| p.last_heartbeat_at < cutoff)
            .map(|p| p.id)
            .collect();
        let mut pruned = Vec::with_capacity(dead.len());
        for id in dead {
            if let Some(process) = state.processes.remove(&id) {
                pruned.push(process);
            }
        }
        pruned.sort_by_key(|p| p.id);
        Ok(pruned)
    }

    async fn get_by_id(&self, process_id: i64) -> Result<Option<Process>> {
        Ok(self.lock().processes.get(&process_id).cloned())
    }

    async fn supervisees(&self, supervisor_id: i64) -> Result<Vec<Process>> {
        let state = self.lock();
        let mut children: Vec<Process> = state
            .processes
            .values()
            .filter(|p| p.supervisor_id == Some(supervisor_id))
            .cloned()
            .collect();
        children.sort_by_key(|p| p.id);
        Ok(children)
    }
}

#[async_trait]
impl RecurringRepository for InMemoryStore {
    async fn upsert_task(&self, task: &RecurringTask) -> Result<RecurringTask> {
        let mut state = self.lock();
        let id = match state.recurring_tasks.get(&task.key) {
            Some(existing) => existing.id,
            None => state.next_id(),
        };
        let mut stored = task.clone();
        stored.id = id;
        stored.updated_at = Utc::now();
        state.recurring_tasks.insert(task.key.clone(), stored.clone());
        Ok(stored)
    }

    async fn list_tasks(&self) -> Result<Vec<RecurringTask>> {
        let state = self.lock();
        let mut tasks: Vec<RecurringTask> = state.recurring_tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(tasks)
    }

    async fn delete_tasks_except(&self, keys: &[String]) -> Result<u64> {
        let mut state = self.lock();
        let before = state.recurring_tasks.len();
        state.recurring_tasks.retain(|key, _| keys.contains(key));
        Ok((before - state.recurring_tasks.len()) as u64)
    }

    async fn record_fire(&self, task_key: &str, run_at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock();
        let tick = (task_key.to_string(), run_at);
        if state.recurring_fires.contains_key(&tick) {
            return Ok(false);
        }
        state.recurring_fires.insert(tick, None);
        Ok(true)
    }

    async fn attach_job(&self, task_key: &str, run_at: DateTime<Utc>, job_id: i64) -> Result<()> {
        let mut state = self.lock();
        state
            .recurring_fires
            .insert((task_key.to_string(), run_at), Some(job_id));
        Ok(())
    }
}

#[async_trait]
impl QueueRepository for InMemoryStore {
    async fn queue_names(&self) -> Result<Vec<String>> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .ready
            .values()
            .map(|r| r.queue_name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn paused_queues(&self) -> Result<Vec<String>> {
        Ok(self.lock().pauses.clone())
    }

    async fn pause(&self, queue_name: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.pauses.iter().any(|q| q == queue_name) {
            state.pauses.push(queue_name.to_string());
        }
        Ok(())
    }

    async fn resume(&self, queue_name: &str) -> Result<()> {
        self.lock().pauses.retain(|q| q != queue_name);
        Ok(())
    }
}
