//! 自适应轮询控制器
//!
//! 每个轮询循环持有一个控制器实例，根据最近一窗口的轮询结果
//! 把睡眠间隔在 [min, max] 之间调快或调慢：持续有活就加速，
//! 持续空轮询就退避，不忙不闲时向基准间隔几何收敛。
//!
//! 各分类阈值与因子没有理论推导，全部保留为独立可调的配置项。

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{QueueError, Result};

/// 自适应轮询参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// 基准轮询间隔（毫秒），稳态时向其收敛
    pub base_interval_ms: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// 滑动窗口容量 W
    pub window_size: usize,
    /// 空轮询阈值 K：连续空轮询达到 K 次进入退避，
    /// 同时也是繁忙判定的采样长度
    pub idle_streak: usize,
    /// 最近 K 次中有活轮询占比超过该值判定繁忙
    pub busy_rate_threshold: f64,
    /// 最近 K 次平均作业数超过该值判定繁忙
    pub busy_count_threshold: f64,
    /// 退避因子（> 1）
    pub backoff_factor: f64,
    /// 加速因子（0 < x < 1）
    pub speedup_factor: f64,
    /// 连续繁忙达到该次数后追加一次乘性加速
    pub rapid_accel_streak: usize,
    pub rapid_accel_factor: f64,
    /// 退避乘数上限：min(1 + 0.1 * 连续空轮询数, 上限)
    pub max_backoff_multiplier: f64,
    /// 稳态收敛步长（每次向基准靠拢的比例）
    pub convergence_rate: f64,
    /// 两次重算之间的最小墙钟间隔（毫秒），抑制突发抖动
    pub recalc_gap_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 100,
            min_interval_ms: 25,
            max_interval_ms: 5_000,
            window_size: 20,
            idle_streak: 5,
            busy_rate_threshold: 0.5,
            busy_count_threshold: 3.0,
            backoff_factor: 1.5,
            speedup_factor: 0.75,
            rapid_accel_streak: 10,
            rapid_accel_factor: 0.9,
            max_backoff_multiplier: 3.0,
            convergence_rate: 0.05,
            recalc_gap_ms: 50,
        }
    }
}

/// 间隔上下限之比的合理范围，超出视为配置笔误
const MAX_INTERVAL_RATIO: f64 = 10_000.0;
const MIN_INTERVAL_RATIO: f64 = 2.0;

impl PollerConfig {
    /// 启动时校验；轮询器构造前失败
    pub fn validate(&self) -> Result<()> {
        if self.min_interval_ms == 0 {
            return Err(QueueError::Configuration(
                "polling.min_interval_ms 必须大于 0".to_string(),
            ));
        }
        if self.min_interval_ms >= self.max_interval_ms {
            return Err(QueueError::Configuration(format!(
                "polling.min_interval_ms ({}) 必须小于 max_interval_ms ({})",
                self.min_interval_ms, self.max_interval_ms
            )));
        }
        if self.base_interval_ms < self.min_interval_ms
            || self.base_interval_ms > self.max_interval_ms
        {
            return Err(QueueError::Configuration(format!(
                "polling.base_interval_ms ({}) 必须落在 [{}, {}] 内",
                self.base_interval_ms, self.min_interval_ms, self.max_interval_ms
            )));
        }
        let ratio = self.max_interval_ms as f64 / self.min_interval_ms as f64;
        if !(MIN_INTERVAL_RATIO..=MAX_INTERVAL_RATIO).contains(&ratio) {
            return Err(QueueError::Configuration(format!(
                "polling 间隔上下限之比 {ratio:.1} 超出合理范围 [{MIN_INTERVAL_RATIO}, {MAX_INTERVAL_RATIO}]"
            )));
        }
        if self.backoff_factor <= 1.0 {
            return Err(QueueError::Configuration(format!(
                "polling.backoff_factor ({}) 必须大于 1",
                self.backoff_factor
            )));
        }
        if self.speedup_factor <= 0.0 || self.speedup_factor >= 1.0 {
            return Err(QueueError::Configuration(format!(
                "polling.speedup_factor ({}) 必须落在 (0, 1) 内",
                self.speedup_factor
            )));
        }
        if self.idle_streak == 0 || self.window_size < self.idle_streak {
            return Err(QueueError::Configuration(format!(
                "polling.window_size ({}) 必须不小于 idle_streak ({}) 且二者大于 0",
                self.window_size, self.idle_streak
            )));
        }
        if self.convergence_rate <= 0.0 || self.convergence_rate >= 1.0 {
            return Err(QueueError::Configuration(format!(
                "polling.convergence_rate ({}) 必须落在 (0, 1) 内",
                self.convergence_rate
            )));
        }
        if self.max_backoff_multiplier < 1.0 {
            return Err(QueueError::Configuration(format!(
                "polling.max_backoff_multiplier ({}) 必须不小于 1",
                self.max_backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// 单次轮询结果
#[derive(Debug, Clone, Copy)]
pub struct PollOutcome {
    pub job_count: usize,
    pub had_work: bool,
}

impl PollOutcome {
    pub fn claimed(job_count: usize) -> Self {
        Self {
            job_count,
            had_work: job_count > 0,
        }
    }

    pub fn empty() -> Self {
        Self {
            job_count: 0,
            had_work: false,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Classification {
    Busy,
    Idle,
    Stable,
}

/// 自适应轮询控制器
pub struct AdaptivePoller {
    config: PollerConfig,
    current_interval_ms: f64,
    window: VecDeque<PollOutcome>,
    consecutive_empty: usize,
    consecutive_busy: usize,
    last_adjusted_at: Option<Instant>,
}

impl AdaptivePoller {
    pub fn new(config: PollerConfig) -> Result<Self> {
        config.validate()?;
        let base = config.base_interval_ms as f64;
        Ok(Self {
            window: VecDeque::with_capacity(config.window_size),
            current_interval_ms: base,
            consecutive_empty: 0,
            consecutive_busy: 0,
            last_adjusted_at: None,
            config,
        })
    }

    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.current_interval_ms.round() as u64)
    }

    /// 记录一次轮询结果并返回下一次睡眠间隔
    pub fn record(&mut self, outcome: PollOutcome) -> Duration {
        if self.window.len() == self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(outcome);

        if outcome.had_work {
            self.consecutive_busy += 1;
            self.consecutive_empty = 0;
        } else {
            self.consecutive_empty += 1;
            self.consecutive_busy = 0;
        }

        // 重算限速：间隔内只记录不调整
        let gap = Duration::from_millis(self.config.recalc_gap_ms);
        if let Some(last) = self.last_adjusted_at {
            if last.elapsed() < gap {
                return self.current_interval();
            }
        }

        let classification = self.classify();
        let next = match classification {
            Classification::Busy => {
                let mut next = self.current_interval_ms * self.config.speedup_factor;
                if self.consecutive_busy >= self.config.rapid_accel_streak {
                    next *= self.config.rapid_accel_factor;
                }
                next
            }
            Classification::Idle => {
                let multiplier = (1.0 + 0.1 * self.consecutive_empty as f64)
                    .min(self.config.max_backoff_multiplier);
                self.current_interval_ms * self.config.backoff_factor * multiplier
            }
            Classification::Stable => {
                let base = self.config.base_interval_ms as f64;
                self.current_interval_ms
                    + (base - self.current_interval_ms) * self.config.convergence_rate
            }
        };

        self.current_interval_ms = next.clamp(
            self.config.min_interval_ms as f64,
            self.config.max_interval_ms as f64,
        );
        self.last_adjusted_at = Some(Instant::now());

        debug!(
            "轮询间隔调整: {:?} -> {:.1}ms (连续空 {}, 连续忙 {})",
            classification, self.current_interval_ms, self.consecutive_empty, self.consecutive_busy
        );

        self.current_interval()
    }

    fn classify(&self) -> Classification {
        let k = self.config.idle_streak;
        let recent: Vec<&PollOutcome> = self.window.iter().rev().take(k).collect();
        if !recent.is_empty() {
            let with_work = recent.iter().filter(|o| o.had_work).count();
            let work_rate = with_work as f64 / recent.len() as f64;
            let mean_count = recent.iter().map(|o| o.job_count).sum::<usize>() as f64
                / recent.len() as f64;
            if work_rate > self.config.busy_rate_threshold
                || mean_count > self.config.busy_count_threshold
            {
                return Classification::Busy;
            }
        }

        if self.consecutive_empty >= k {
            return Classification::Idle;
        }

        Classification::Stable
    }
}
