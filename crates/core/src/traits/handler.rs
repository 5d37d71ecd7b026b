//! 作业处理器注册表
//!
//! 以稳定的类型标识静态绑定执行函数，启动时注册，
//! 运行期查表分发，不做任何反射式解析。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::errors::{QueueError, Result};

/// 执行上下文，随作业体一起传入处理器
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: i64,
    pub queue_name: String,
}

/// 作业处理器接口，由嵌入方应用实现
///
/// 参数以不透明的 JSON 负载传入，引擎不理解其结构；
/// 返回 Err 的执行会被记录为 FailedExecution。
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// 处理器的稳定类型标识，与 Job.class_name 对应
    fn class_name(&self) -> &str;

    async fn execute(&self, context: &JobContext, arguments: &serde_json::Value) -> Result<()>;
}

/// 处理器注册表：class_name -> 处理器
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let name = handler.class_name().to_string();
        info!("注册作业处理器: {}", name);
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, class_name: &str) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(class_name)
            .cloned()
            .ok_or_else(|| QueueError::HandlerNotFound {
                class_name: class_name.to_string(),
            })
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.handlers.contains_key(class_name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
