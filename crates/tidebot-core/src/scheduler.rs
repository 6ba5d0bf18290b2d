//! Keyed background task scheduler.
//!
//! An explicit, injected object owning every background timer: interval
//! loops, one-shot delays, and a small cron subset. Cancellation is by
//! key; scheduling under an existing key replaces (aborts) the previous
//! task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
pub struct TaskScheduler {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, key: &str, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(previous) = tasks.insert(key.to_string(), handle) {
            previous.abort();
        }
    }

    /// Run `task` now and then every `every`, until cancelled or until the
    /// task returns `false`.
    pub fn run_every_until<F, Fut>(&self, key: &str, every: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !task().await {
                    break;
                }
            }
        });
        self.register(key, handle);
    }

    /// Run `task` now and then every `every`, until cancelled.
    pub fn run_every<F, Fut>(&self, key: &str, every: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.run_every_until(key, every, move || {
            let fut = task();
            async move {
                fut.await;
                true
            }
        });
    }

    /// Run `task` once after `delay`.
    pub fn run_after<F, Fut>(&self, key: &str, delay: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task().await;
        });
        self.register(key, handle);
    }

    /// Run `task` on a 5-field cron schedule (minute granularity), until
    /// cancelled.
    pub fn run_cron<F, Fut>(&self, key: &str, spec: CronSpec, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = spec.next_after(now);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                task().await;
            }
        });
        self.register(key, handle);
    }

    /// Abort the task registered under `key`. Returns whether one existed.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.tasks.lock().unwrap().remove(key);
        if let Some(handle) = removed {
            handle.abort();
            debug!(key, "cancelled scheduled task");
            true
        } else {
            false
        }
    }

    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    /// Whether a live task is registered under `key`.
    pub fn is_scheduled(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .unwrap()
            .get(key)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

/// A parsed 5-field cron expression: minute, hour, day-of-month, month,
/// day-of-week (0 = Sunday). Supports `*`, `*/n`, comma lists, and plain
/// values.
#[derive(Debug, Clone)]
pub struct CronSpec {
    minutes: CronField,
    hours: CronField,
    days_of_month: CronField,
    months: CronField,
    days_of_week: CronField,
}

#[derive(Debug, Clone)]
enum CronField {
    Any,
    Values(Vec<u32>),
}

impl CronField {
    fn parse(text: &str, min: u32, max: u32) -> anyhow::Result<Self> {
        if text == "*" {
            return Ok(CronField::Any);
        }
        if let Some(step) = text.strip_prefix("*/") {
            let step: u32 = step.parse()?;
            anyhow::ensure!(step > 0, "cron step must be positive");
            return Ok(CronField::Values(
                (min..=max).filter(|v| (v - min) % step == 0).collect(),
            ));
        }
        let mut values = Vec::new();
        for part in text.split(',') {
            let value: u32 = part.trim().parse()?;
            anyhow::ensure!(
                (min..=max).contains(&value),
                "cron value {value} out of range {min}..={max}"
            );
            values.push(value);
        }
        anyhow::ensure!(!values.is_empty(), "empty cron field");
        Ok(CronField::Values(values))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Values(values) => values.contains(&value),
        }
    }
}

impl CronSpec {
    pub fn parse(expr: &str) -> anyhow::Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        anyhow::ensure!(
            fields.len() == 5,
            "cron expression must have 5 fields, got {}",
            fields.len()
        );
        Ok(Self {
            minutes: CronField::parse(fields[0], 0, 59)?,
            hours: CronField::parse(fields[1], 0, 23)?,
            days_of_month: CronField::parse(fields[2], 1, 31)?,
            months: CronField::parse(fields[3], 1, 12)?,
            days_of_week: CronField::parse(fields[4], 0, 6)?,
        })
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minutes.matches(t.minute())
            && self.hours.matches(t.hour())
            && self.days_of_month.matches(t.day())
            && self.months.matches(t.month())
            && self.days_of_week.matches(t.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let mut candidate = (after + chrono::Duration::minutes(1))
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after);
        // A year of minutes bounds the scan for any satisfiable field set.
        for _ in 0..(366 * 24 * 60) {
            if self.matches(candidate) {
                return candidate;
            }
            candidate += chrono::Duration::minutes(1);
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn cron_parse_rejects_malformed_expressions() {
        assert!(CronSpec::parse("* * * *").is_err());
        assert!(CronSpec::parse("61 * * * *").is_err());
        assert!(CronSpec::parse("*/0 * * * *").is_err());
        assert!(CronSpec::parse("0 */2 * * *").is_ok());
    }

    #[test]
    fn cron_next_fire_every_other_hour() {
        let spec = CronSpec::parse("0 */2 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2023, 4, 3, 1, 30, 0).unwrap();
        let next = spec.next_after(after);
        assert_eq!(next, Utc.with_ymd_and_hms(2023, 4, 3, 2, 0, 0).unwrap());

        // Exactly on a match still moves to the next slot.
        let next = spec.next_after(next);
        assert_eq!(next, Utc.with_ymd_and_hms(2023, 4, 3, 4, 0, 0).unwrap());
    }

    #[test]
    fn cron_lists_and_weekdays() {
        let spec = CronSpec::parse("15,45 9 * * 1").unwrap();
        // 2023-04-03 is a Monday.
        let after = Utc.with_ymd_and_hms(2023, 4, 3, 9, 20, 0).unwrap();
        let next = spec.next_after(after);
        assert_eq!(next, Utc.with_ymd_and_hms(2023, 4, 3, 9, 45, 0).unwrap());

        let next = spec.next_after(next);
        assert_eq!(next, Utc.with_ymd_and_hms(2023, 4, 10, 9, 15, 0).unwrap());
    }

    #[tokio::test]
    async fn interval_task_runs_and_cancels() {
        let scheduler = TaskScheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        scheduler.run_every("tick", Duration::from_millis(20), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(scheduler.is_scheduled("tick"));
        assert!(count.load(Ordering::SeqCst) >= 2);

        assert!(scheduler.cancel("tick"));
        assert!(!scheduler.is_scheduled("tick"));
        let frozen = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), frozen);
    }

    #[tokio::test]
    async fn until_task_stops_itself() {
        let scheduler = TaskScheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        scheduler.run_every_until("bounded", Duration::from_millis(10), move || {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            async move { n < 2 }
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_scheduled("bounded"));
    }

    #[tokio::test]
    async fn one_shot_fires_once_after_delay() {
        let scheduler = TaskScheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        scheduler.run_after("later", Duration::from_millis(30), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rescheduling_a_key_replaces_the_previous_task() {
        let scheduler = TaskScheduler::new();
        let first = Arc::new(AtomicU32::new(0));
        let seen = first.clone();
        scheduler.run_every("job", Duration::from_millis(10), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = Arc::new(AtomicU32::new(0));
        let seen = second.clone();
        scheduler.run_every("job", Duration::from_millis(10), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        let frozen = first.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(first.load(Ordering::SeqCst), frozen);
        assert!(second.load(Ordering::SeqCst) >= 1);

        scheduler.cancel_all();
        assert!(!scheduler.is_scheduled("job"));
    }
}
