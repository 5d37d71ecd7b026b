//! CRON 表达式解析与调度计算
//!
//! 对外接受三种写法：六字段 CRON（秒 分 时 日 月 周）、
//! 传统五字段 CRON（自动补秒字段）、以及 `@hourly`、
//! `"every 5 minutes"` 一类速记短语。统一归一化为六字段
//! 后交给 cron crate 解析。

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use conveyor_core::errors::{QueueError, Result};

#[derive(Debug)]
pub struct CronSchedule {
    raw: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let normalized = normalize(expr);
        let schedule = Schedule::from_str(&normalized).map_err(|e| QueueError::InvalidCron {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            raw: expr.to_string(),
            schedule,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// 严格晚于 after 的下一次触发时间
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// 严格早于 before 的上一次触发时间
    ///
    /// cron crate 只提供前向迭代，这里从逐步加宽的回看窗口
    /// 正向扫描取最后一个命中。年度表达式最多回看一年多。
    pub fn previous_occurrence(&self, before: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let lookbacks = [
            Duration::hours(1),
            Duration::days(1),
            Duration::days(8),
            Duration::days(366),
        ];
        for lookback in lookbacks {
            let start = before - lookback;
            let previous = self
                .schedule
                .after(&start)
                .take_while(|t| *t < before)
                .last();
            if previous.is_some() {
                return previous;
            }
        }
        None
    }

    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    pub fn validate(expr: &str) -> Result<()> {
        Self::parse(expr).map(|_| ())
    }
}

/// 把速记短语与五字段 CRON 归一化为六字段 CRON。
/// 无法识别的写法原样返回，由解析阶段报错。
pub fn normalize(expr: &str) -> String {
    let trimmed = expr.trim();
    let lowered = trimmed.to_lowercase();

    match lowered.as_str() {
        "@yearly" | "@annually" | "every year" => return "0 0 0 1 1 *".to_string(),
        "@monthly" | "every month" => return "0 0 0 1 * *".to_string(),
        "@weekly" | "every week" => return "0 0 0 * * SUN".to_string(),
        "@daily" | "@midnight" | "every day" => return "0 0 0 * * *".to_string(),
        "@hourly" | "every hour" => return "0 0 * * * *".to_string(),
        "@minutely" | "every minute" => return "0 * * * * *".to_string(),
        "every second" => return "* * * * * *".to_string(),
        _ => {}
    }

    if let Some(cron) = phrase_to_cron(&lowered) {
        return cron;
    }

    // 五字段视为无秒写法，补 0 秒
    if trimmed.split_whitespace().count() == 5 {
        return format!("0 {trimmed}");
    }
    trimmed.to_string()
}

/// `every N seconds|minutes|hours` 与 `every day at HH:MM`
fn phrase_to_cron(lowered: &str) -> Option<String> {
    let tokens: Vec<&str> = lowered.split_whitespace().collect();
    if tokens.first() != Some(&"every") {
        return None;
    }

    match tokens.as_slice() {
        ["every", n, unit] => {
            let n: u32 = n.parse().ok().filter(|n| *n >= 1)?;
            match unit.trim_end_matches('s') {
                "second" => Some(format!("*/{n} * * * * *")),
                "minute" => Some(format!("0 */{n} * * * *")),
                "hour" => Some(format!("0 0 */{n} * * *")),
                _ => None,
            }
        }
        ["every", "day", "at", clock] => {
            let (hour, minute) = clock.split_once(':')?;
            let hour: u32 = hour.parse().ok().filter(|h| *h < 24)?;
            let minute: u32 = minute.parse().ok().filter(|m| *m < 60)?;
            Some(format!("0 {minute} {hour} * * *"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_shorthands() {
        assert_eq!(normalize("@hourly"), "0 0 * * * *");
        assert_eq!(normalize("@daily"), "0 0 0 * * *");
        assert_eq!(normalize("@weekly"), "0 0 0 * * SUN");
        assert_eq!(normalize("@monthly"), "0 0 0 1 * *");
        assert_eq!(normalize("@yearly"), "0 0 0 1 1 *");
    }

    #[test]
    fn test_normalize_phrases() {
        assert_eq!(normalize("every 5 minutes"), "0 */5 * * * *");
        assert_eq!(normalize("every 30 seconds"), "*/30 * * * * *");
        assert_eq!(normalize("every 2 hours"), "0 0 */2 * * *");
        assert_eq!(normalize("every day at 09:30"), "0 30 9 * * *");
        assert_eq!(normalize("Every minute"), "0 * * * * *");
    }

    #[test]
    fn test_normalize_five_field_gets_zero_seconds() {
        assert_eq!(normalize("*/10 * * * *"), "0 */10 * * * *");
        assert_eq!(normalize("30 4 * * 1"), "0 30 4 * * 1");
    }

    #[test]
    fn test_normalize_six_field_passthrough() {
        assert_eq!(normalize("15 */10 * * * *"), "15 */10 * * * *");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = CronSchedule::parse("every fortnight").unwrap_err();
        assert!(matches!(err, QueueError::InvalidCron { .. }));
        assert!(CronSchedule::parse("not a cron").is_err());
    }

    #[test]
    fn test_next_occurrence_hourly() {
        let schedule = CronSchedule::parse("@hourly").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap();
        let next = schedule.next_occurrence(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_previous_occurrence_hourly() {
        let schedule = CronSchedule::parse("@hourly").unwrap();
        let before = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap();
        let previous = schedule.previous_occurrence(before).unwrap();
        assert_eq!(
            previous,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_previous_occurrence_daily_needs_wider_lookback() {
        let schedule = CronSchedule::parse("every day at 03:00").unwrap();
        let before = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
        let previous = schedule.previous_occurrence(before).unwrap();
        assert_eq!(
            previous,
            Utc.with_ymd_and_hms(2024, 4, 30, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_upcoming_every_five_minutes() {
        let schedule = CronSchedule::parse("every 5 minutes").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 0).unwrap();
        let upcoming = schedule.upcoming(from, 3);
        assert_eq!(
            upcoming,
            vec![
                Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 5, 1, 10, 10, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap(),
            ]
        );
    }
}
