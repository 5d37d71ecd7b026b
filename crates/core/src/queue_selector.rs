//! 队列模式解析
//!
//! 把请求的队列模式（精确名、前缀通配、`*` 全匹配）解析为
//! 具体的可轮询队列名集合，并剔除已暂停的队列。
//! 认领协议与定时分发路径共用此解析。

use std::collections::HashSet;
use std::sync::Arc;

use crate::errors::Result;
use crate::traits::QueueRepository;

/// 单个队列模式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePattern {
    /// `*` 或空模式列表：所有队列
    All,
    /// `foo*`：以 foo 开头的所有现存队列
    Prefix(String),
    /// 精确队列名
    Exact(String),
}

impl QueuePattern {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" {
            QueuePattern::All
        } else if let Some(prefix) = raw.strip_suffix('*') {
            QueuePattern::Prefix(prefix.to_string())
        } else {
            QueuePattern::Exact(raw.to_string())
        }
    }
}

/// 纯解析函数：(模式, 现存队列, 暂停队列) -> 具体队列名
///
/// 精确名原样通过（即使当前不存在，对空队列认领无害）；
/// 通配模式只匹配现存队列名；暂停队列即使被精确点名也产出零匹配。
/// 结果去重，精确名保持给定顺序在前，通配匹配排序后追加。
pub fn resolve(patterns: &[String], existing: &[String], paused: &[String]) -> Vec<String> {
    let parsed: Vec<QueuePattern> = if patterns.is_empty() {
        vec![QueuePattern::All]
    } else {
        patterns.iter().map(|p| QueuePattern::parse(p)).collect()
    };

    let paused: HashSet<&str> = paused.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut result = Vec::new();

    for pattern in &parsed {
        if let QueuePattern::Exact(name) = pattern {
            if !paused.contains(name.as_str()) && seen.insert(name.clone()) {
                result.push(name.clone());
            }
        }
    }

    let mut wildcard_matches: Vec<String> = Vec::new();
    for pattern in &parsed {
        match pattern {
            QueuePattern::All => {
                wildcard_matches.extend(existing.iter().cloned());
            }
            QueuePattern::Prefix(prefix) => {
                wildcard_matches.extend(
                    existing
                        .iter()
                        .filter(|name| name.starts_with(prefix.as_str()))
                        .cloned(),
                );
            }
            QueuePattern::Exact(_) => {}
        }
    }
    wildcard_matches.sort();
    for name in wildcard_matches {
        if !paused.contains(name.as_str()) && seen.insert(name.clone()) {
            result.push(name);
        }
    }

    result
}

/// 基于仓储的选择器门面
pub struct QueueSelector {
    patterns: Vec<String>,
    queues: Arc<dyn QueueRepository>,
}

impl QueueSelector {
    pub fn new(patterns: Vec<String>, queues: Arc<dyn QueueRepository>) -> Self {
        Self { patterns, queues }
    }

    /// 解析出当前应轮询的具体队列名
    pub async fn resolve_names(&self) -> Result<Vec<String>> {
        let needs_existing = self.patterns.is_empty()
            || self
                .patterns
                .iter()
                .any(|p| matches!(QueuePattern::parse(p), QueuePattern::All | QueuePattern::Prefix(_)));

        let existing = if needs_existing {
            self.queues.queue_names().await?
        } else {
            Vec::new()
        };
        let paused = self.queues.paused_queues().await?;

        Ok(resolve(&self.patterns, &existing, &paused))
    }
}
