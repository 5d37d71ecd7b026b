//! 进程内全链路测试：入队 → worker 认领执行 → 状态终结
//!
//! 用内存存储替换 Postgres 仓储，验证服务组装与作业生命周期，
//! 不依赖外部数据库。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use conveyor::{AppConfig, Application, HandlerRegistry, JobContext, JobHandler, NewJob, Repositories};
use conveyor_core::errors::Result;
use conveyor_core::models::{ExecutionState, ProcessKind};
use conveyor_testing_utils::InMemoryStore;

struct RecordingHandler {
    seen: Arc<Mutex<Vec<i64>>>,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    fn class_name(&self) -> &str {
        "Recording"
    }

    async fn execute(&self, ctx: &JobContext, _args: &serde_json::Value) -> Result<()> {
        self.seen.lock().unwrap().push(ctx.job_id);
        Ok(())
    }
}

fn in_memory_repositories(store: &InMemoryStore) -> Repositories {
    Repositories {
        jobs: Arc::new(store.clone()),
        executions: Arc::new(store.clone()),
        semaphores: Arc::new(store.clone()),
        processes: Arc::new(store.clone()),
        recurring: Arc::new(store.clone()),
        queues: Arc::new(store.clone()),
    }
}

#[tokio::test]
async fn test_worker_round_trip_in_process() {
    let store = InMemoryStore::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(RecordingHandler {
        seen: Arc::clone(&seen),
    }));

    let app = Arc::new(Application::with_repositories(
        AppConfig::default(),
        None,
        in_memory_repositories(&store),
        registry,
        None,
    ));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let worker = tokio::spawn(
        Arc::clone(&app).run_embedded(ProcessKind::Worker, shutdown_rx),
    );

    let job = app
        .queue()
        .enqueue(NewJob::new("Recording", serde_json::json!({"n": 1})))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store.state_of(job.id) == Some(ExecutionState::Finished { failed: false }) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("作业应在超时前执行完成");

    assert_eq!(seen.lock().unwrap().as_slice(), &[job.id]);

    shutdown_tx.send(()).unwrap();
    worker.await.unwrap().unwrap();
}
