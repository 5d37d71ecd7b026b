//! 入队门面
//!
//! 作业创建的统一入口：根据 scheduled_at 与并发准入结果
//! 把新作业路由到 Ready / Scheduled / Blocked / Finished 落位。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::errors::Result;
use crate::models::{Admission, Disposition, Job, NewJob};
use crate::services::concurrency::ConcurrencyController;
use crate::traits::JobRepository;

pub struct QueueService {
    jobs: Arc<dyn JobRepository>,
    concurrency: Arc<ConcurrencyController>,
}

impl QueueService {
    pub fn new(jobs: Arc<dyn JobRepository>, concurrency: Arc<ConcurrencyController>) -> Self {
        Self { jobs, concurrency }
    }

    /// 入队。scheduled_at 在未来则进入 Scheduled，
    /// 否则经并发准入进入 Ready / Blocked / Finished。
    pub async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let now = Utc::now();
        if let Some(at) = job.scheduled_at {
            if at > now {
                let created = self.jobs.create(&job, Disposition::Scheduled(at)).await?;
                debug!("{} 定时于 {}", created.entity_description(), at);
                return Ok(created);
            }
        }

        let disposition = match self
            .concurrency
            .attempt_admission(job.concurrency.as_ref())
            .await?
        {
            Admission::Ready => Disposition::Ready,
            Admission::Blocked { key, expires_at } => Disposition::Blocked { key, expires_at },
            Admission::Discarded => Disposition::Finished,
        };
        let created = self.jobs.create(&job, disposition).await?;
        debug!("{} 已入队", created.entity_description());
        Ok(created)
    }

    /// 定时入队
    pub async fn enqueue_at(&self, job: NewJob, at: DateTime<Utc>) -> Result<Job> {
        self.enqueue(job.scheduled_at(at)).await
    }

    /// 重试失败作业：删除失败记录，重回 Ready
    pub async fn retry(&self, job_id: i64) -> Result<()> {
        self.jobs.retry(job_id).await?;
        info!("作业 {} 已重新进入就绪队列", job_id);
        Ok(())
    }

    /// 放弃失败作业：标记完成，不再重试
    pub async fn discard(&self, job_id: i64) -> Result<()> {
        self.jobs.discard_failed(job_id).await?;
        info!("作业 {} 已放弃", job_id);
        Ok(())
    }
}
